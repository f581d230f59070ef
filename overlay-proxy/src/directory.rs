//! Config-backed directory and name service.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use overlay_core::address::decode_overlay_hostname;
use overlay_core::{ContentId, KeyId, PublicKey};

use crate::config::{PeerEntry, SiteEntry};
use crate::resolver::{Directory, DirectoryError, NameError, NameService, SiteRecord};

#[derive(Debug, thiserror::Error)]
#[error("{entry}: {reason}")]
pub struct TableError {
    pub entry: String,
    pub reason: String,
}

impl TableError {
    pub(crate) fn new(entry: &str, reason: impl Into<String>) -> Self {
        Self {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }
}

pub(crate) fn parse_hex32(s: &str) -> Result<[u8; 32], String> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

/// Overlay address (with or without `.adnl`) or 64 hex chars.
pub fn parse_key_id(s: &str) -> Result<KeyId, String> {
    let s = s.trim();
    let s = s.strip_suffix(".adnl").unwrap_or(s);
    if s.len() == 64 {
        return parse_hex32(s).map(KeyId);
    }
    decode_overlay_hostname(s).map_err(|e| e.to_string())
}

#[derive(Default)]
pub struct StaticDirectory {
    peers: HashMap<KeyId, (Vec<SocketAddr>, PublicKey)>,
}

impl StaticDirectory {
    pub fn from_config(entries: &[PeerEntry]) -> Result<Self, TableError> {
        let mut peers = HashMap::new();
        for e in entries {
            let key = parse_key_id(&e.key).map_err(|r| TableError::new(&e.key, r))?;
            let public_key =
                PublicKey(parse_hex32(&e.public_key).map_err(|r| TableError::new(&e.key, r))?);
            if KeyId::from_public_key(&public_key) != key {
                return Err(TableError::new(&e.key, "public_key does not match key"));
            }
            peers.insert(key, (e.addrs.clone(), public_key));
        }
        Ok(Self { peers })
    }

    pub fn insert(&mut self, public_key: PublicKey, addrs: Vec<SocketAddr>) -> KeyId {
        let key = KeyId::from_public_key(&public_key);
        self.peers.insert(key, (addrs, public_key));
        key
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn find_addresses(
        &self,
        key: &KeyId,
    ) -> Result<(Vec<SocketAddr>, PublicKey), DirectoryError> {
        self.peers.get(key).cloned().ok_or(DirectoryError::NotFound)
    }
}

#[derive(Default)]
pub struct StaticNameService {
    records: HashMap<String, SiteRecord>,
}

impl StaticNameService {
    pub fn from_config(entries: &[SiteEntry]) -> Result<Self, TableError> {
        let mut service = Self::default();
        for e in entries {
            let record = match (&e.peer, &e.bag) {
                (Some(peer), None) => {
                    SiteRecord::Peer(parse_key_id(peer).map_err(|r| TableError::new(&e.name, r))?)
                }
                (None, Some(bag)) => SiteRecord::Content(ContentId(
                    parse_hex32(bag).map_err(|r| TableError::new(&e.name, r))?,
                )),
                _ => return Err(TableError::new(&e.name, "set exactly one of peer or bag")),
            };
            service.insert(&e.name, record);
        }
        Ok(service)
    }

    pub fn insert(&mut self, name: &str, record: SiteRecord) {
        self.records
            .insert(name.trim_end_matches('.').to_ascii_lowercase(), record);
    }
}

#[async_trait]
impl NameService for StaticNameService {
    async fn resolve(&self, name: &str) -> Result<SiteRecord, NameError> {
        self.records
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or(NameError::NoSuchRecord)
    }
}
