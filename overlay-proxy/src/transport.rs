//! Entry point for overlay-bound requests: acquire the host's session, then hand the request to
//! the peer session or the bag assembler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assembler::OrderedPieceAssembler;
use crate::error::GatewayError;
use crate::message::{GatewayRequest, GatewayResponse};
use crate::registry::{Acquired, SiteRegistry};

pub struct Transport {
    registry: Arc<SiteRegistry>,
    assembler: OrderedPieceAssembler,
}

impl Transport {
    pub fn new(registry: Arc<SiteRegistry>, assembler: OrderedPieceAssembler) -> Self {
        Self {
            registry,
            assembler,
        }
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        mut req: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        match self.registry.acquire(&req.host, cancel).await? {
            Acquired::Peer(session) => session.request(req, cancel).await,
            Acquired::Content(lease) => {
                // Bags take no request body.
                if let Some(mut body) = req.body.take() {
                    let discarded = body.read_to_end().await?;
                    debug!(host = %req.host, bytes = discarded.len(), "request body discarded");
                }
                let range = req.header("range").map(str::to_owned);
                self.assembler
                    .serve_holding(
                        lease.downloader().clone(),
                        &req.path,
                        range.as_deref(),
                        cancel,
                        lease,
                    )
                    .await
            }
        }
    }
}
