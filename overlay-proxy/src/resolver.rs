//! Host → Target resolution: literal overlay and content hosts decode locally,
//! anything else goes to the name service with redundant parallel lookups.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use overlay_core::address::classify_host;
use overlay_core::{ContentId, HostKind, KeyId, PublicKey};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// What a name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRecord {
    Peer(KeyId),
    Content(ContentId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("no such record")]
    NoSuchRecord,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait NameService: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<SiteRecord, NameError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("key not found")]
    NotFound,
    #[error("{0}")]
    Unreachable(String),
}

/// Peer directory: current addresses and public key for a key id.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_addresses(
        &self,
        key: &KeyId,
    ) -> Result<(Vec<SocketAddr>, PublicKey), DirectoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub key_id: KeyId,
    pub public_key: PublicKey,
    /// Tried in order until one accepts a connection.
    pub candidates: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Peer(PeerTarget),
    Content(ContentId),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Parallel name-service lookups per resolution.
    pub attempts: usize,
    /// Timeout of attempt `i` is `base_timeout * (i + 1)`.
    pub base_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_timeout: Duration::from_secs(3),
        }
    }
}

pub struct HostResolver {
    directory: Arc<dyn Directory>,
    names: Arc<dyn NameService>,
    config: ResolverConfig,
}

impl HostResolver {
    pub fn new(
        directory: Arc<dyn Directory>,
        names: Arc<dyn NameService>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            directory,
            names,
            config,
        }
    }

    pub async fn resolve(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Target, GatewayError> {
        let kind = classify_host(host).map_err(|source| GatewayError::AddressFormat {
            host: host.to_string(),
            source,
        })?;
        let record = match kind {
            HostKind::Overlay(key) => SiteRecord::Peer(key),
            HostKind::Content(id) => return Ok(Target::Content(id)),
            HostKind::Name(name) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    r = self.resolve_name(&name) => r?,
                }
            }
        };
        match record {
            SiteRecord::Content(id) => {
                debug!(host, bag = %id.to_hex(), "resolved to bag");
                Ok(Target::Content(id))
            }
            SiteRecord::Peer(key_id) => {
                let peer = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    r = self.lookup_peer(key_id) => r?,
                };
                debug!(host, candidates = peer.candidates.len(), "resolved to peer");
                Ok(Target::Peer(peer))
            }
        }
    }

    /// Parallel lookups; the first definitive answer (a record, or no-such-record) wins and the rest are aborted.
    async fn resolve_name(&self, name: &str) -> Result<SiteRecord, GatewayError> {
        let mut lookups = JoinSet::new();
        for attempt in 0..self.config.attempts.max(1) {
            let names = self.names.clone();
            let name = name.to_string();
            let limit = self.config.base_timeout * (attempt as u32 + 1);
            lookups.spawn(async move { tokio::time::timeout(limit, names.resolve(&name)).await });
        }

        let mut last_failure = None;
        let mut timed_out = 0usize;
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok(Ok(Ok(record))) => return Ok(record),
                Ok(Ok(Err(NameError::NoSuchRecord))) => {
                    return Err(GatewayError::NameNotFound(name.to_string()))
                }
                Ok(Ok(Err(NameError::Failed(reason)))) => {
                    debug!(name, %reason, "name lookup attempt failed");
                    last_failure = Some(reason);
                }
                Ok(Err(_elapsed)) => timed_out += 1,
                Err(e) => last_failure = Some(e.to_string()),
            }
        }
        match last_failure {
            None if timed_out > 0 => Err(GatewayError::UpstreamTimeout(name.to_string())),
            reason => {
                let reason = reason.unwrap_or_else(|| "no lookup attempts".to_string());
                warn!(name, %reason, "name resolution failed");
                Err(GatewayError::NameResolution {
                    host: name.to_string(),
                    reason,
                })
            }
        }
    }

    async fn lookup_peer(&self, key_id: KeyId) -> Result<PeerTarget, GatewayError> {
        let failed = |reason: String| GatewayError::DirectoryLookupFailed {
            key: key_id.to_hex(),
            reason,
        };
        let (candidates, public_key) = self
            .directory
            .find_addresses(&key_id)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if KeyId::from_public_key(&public_key) != key_id {
            return Err(failed("public key does not match key id".to_string()));
        }
        if candidates.is_empty() {
            return Err(failed("no addresses".to_string()));
        }
        Ok(PeerTarget {
            key_id,
            public_key,
            candidates,
        })
    }
}
