//! Overlay gateway daemon: local HTTP proxy in front of overlay sites and content bags.
//! Name resolution, per-site sessions, HTTP-over-RPC and ordered piece assembly live here;
//! wire types and pure arithmetic live in overlay-core.

pub mod assembler;
pub mod config;
pub mod directory;
pub mod error;
pub mod local_storage;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod stream;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod testing;

pub use assembler::OrderedPieceAssembler;
pub use config::Config;
pub use error::GatewayError;
pub use message::{GatewayRequest, GatewayResponse};
pub use proxy::{run_proxy, ProxyState};
pub use registry::SiteRegistry;
pub use resolver::HostResolver;
pub use stream::DataStream;
pub use transport::Transport;
