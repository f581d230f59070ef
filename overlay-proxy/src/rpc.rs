//! Peer channel seam: a bidirectional query/answer channel to one overlay peer.
//!
//! The gateway asks (`Request`, `GetNextPayloadPart` for response bodies) and is asked
//! (`GetNextPayloadPart` for request bodies, `GetCapabilities`) over the same channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use overlay_core::{Answer, PublicKey, Query};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("query timed out")]
    Timeout,
    #[error("channel closed")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("answer of {size} bytes exceeds limit {limit}")]
    AnswerTooLarge { size: u64, limit: u64 },
    #[error("query rejected: {0}")]
    Rejected(String),
    #[error("unexpected {0} query")]
    UnexpectedQuery(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e.to_string())
    }
}

/// Answers queries the remote side sends us.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle(&self, query: Query) -> Result<Answer, RpcError>;
}

/// Called once when the channel goes down.
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send `query` and wait for its answer, which must serialize to at most `max_answer_size` bytes.
    async fn query(&self, query: Query, max_answer_size: u64) -> Result<Answer, RpcError>;

    fn set_query_handler(&self, handler: Arc<dyn QueryHandler>);

    fn set_disconnect_handler(&self, handler: DisconnectHandler);

    fn close(&self);
}

/// Opens channels to peers at a given address, authenticated against their public key.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        addr: SocketAddr,
        key: &PublicKey,
    ) -> Result<Arc<dyn RpcChannel>, RpcError>;
}
