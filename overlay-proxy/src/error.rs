//! Gateway error taxonomy and its mapping onto HTTP status codes.

use std::net::SocketAddr;

use overlay_core::{AddressError, RangeError};

use crate::rpc::RpcError;
use crate::storage::StorageError;
use crate::stream::StreamClosed;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad address {host}: {source}")]
    AddressFormat {
        host: String,
        #[source]
        source: AddressError,
    },
    #[error("name {0} has no site record")]
    NameNotFound(String),
    #[error("failed to resolve {host}: {reason}")]
    NameResolution { host: String, reason: String },
    #[error("address lookup for {key} failed: {reason}")]
    DirectoryLookupFailed { key: String, reason: String },
    #[error("no reachable address for {host} (tried {tried:?})")]
    AllCandidatesFailed {
        host: String,
        tried: Vec<SocketAddr>,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    RangeNotSatisfiable(#[from] RangeError),
    #[error("site {0} is not responding")]
    UpstreamTimeout(String),
    #[error(transparent)]
    StreamClosed(#[from] StreamClosed),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("peer channel: {0}")]
    Rpc(RpcError),
    /// Clear-web forwarding failed.
    #[error("upstream: {0}")]
    Http(String),
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Classify a channel failure for `host`; timeouts get their own variant.
    pub fn from_rpc(host: &str, err: RpcError) -> Self {
        match err {
            RpcError::Timeout => GatewayError::UpstreamTimeout(host.to_string()),
            other => GatewayError::Rpc(other),
        }
    }

    /// HTTP status answered to the client for this failure.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::AddressFormat { .. } => 400,
            GatewayError::NameNotFound(_) => 404,
            GatewayError::RangeNotSatisfiable(_) => 416,
            GatewayError::Cancelled => 503,
            _ => 502,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::UpstreamTimeout(_))
    }
}
