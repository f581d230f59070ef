//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use overlay_core::piece::DEFAULT_PIECE_SIZE;
use serde::Deserialize;

use crate::registry::RegistryConfig;
use crate::resolver::ResolverConfig;
use crate::session::SessionConfig;
use crate::stream::DEFAULT_STREAM_BUFFER;

/// Gateway configuration. File: ~/.config/overlay-proxy/config.toml or /etc/overlay-proxy/config.toml.
/// Env overrides: OVERLAY_PROXY_ADDR, OVERLAY_PROXY_NO_HTTP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy listen address (default 127.0.0.1:8080).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Refuse clear-web forwarding.
    #[serde(default)]
    pub block_http: bool,
    /// Value of the identity header added to forwarded requests.
    #[serde(default = "default_version_tag")]
    pub version_tag: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub bags: Vec<BagEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportConfig {
    pub stale_after_secs: u64,
    pub idle_content_secs: u64,
    pub reaper_interval_secs: u64,
    pub resolve_attempts: usize,
    pub resolve_timeout_ms: u64,
    pub query_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pending_stream_ttl_secs: u64,
    pub chunk_size: u32,
    pub stream_buffer: usize,
}

/// `name` resolves to exactly one of `peer` (overlay address or hex key id) or `bag` (hex content id).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteEntry {
    pub name: String,
    pub peer: Option<String>,
    pub bag: Option<String>,
}

/// Directory entry. `key` is the overlay address; `public_key` must hash to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub key: String,
    pub public_key: String,
    pub addrs: Vec<SocketAddr>,
}

/// A bag served from a local directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BagEntry {
    pub id: String,
    pub dir: PathBuf,
    #[serde(default = "default_piece_size")]
    pub piece_size: u32,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_version_tag() -> String {
    format!("overlay-proxy/{}", env!("CARGO_PKG_VERSION"))
}
fn default_piece_size() -> u32 {
    DEFAULT_PIECE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            block_http: false,
            version_tag: default_version_tag(),
            transport: TransportConfig::default(),
            sites: Vec::new(),
            peers: Vec::new(),
            bags: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
            idle_content_secs: 300,
            reaper_interval_secs: 3,
            resolve_attempts: 3,
            resolve_timeout_ms: 3000,
            query_timeout_secs: 30,
            connect_timeout_secs: 10,
            pending_stream_ttl_secs: 15,
            chunk_size: 1 << 17,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl TransportConfig {
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            stale_after: Duration::from_secs(self.stale_after_secs),
            idle_content: Duration::from_secs(self.idle_content_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
        }
    }

    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            attempts: self.resolve_attempts.max(1),
            base_timeout: Duration::from_millis(self.resolve_timeout_ms),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.chunk_size.max(1),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            pending_ttl: Duration::from_secs(self.pending_stream_ttl_secs),
            stream_buffer: self.stream_buffer,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: an explicit file must exist and parse. Otherwise the first existing default
/// location is used, falling back to defaults. Env vars are applied last.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = var("OVERLAY_PROXY_ADDR") {
        c.listen_addr = addr;
    }
    if let Some(v) = var("OVERLAY_PROXY_NO_HTTP") {
        c.block_http = matches!(v.trim(), "1" | "true" | "yes");
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/overlay-proxy/config.toml"));
    }
    out.push(PathBuf::from("/etc/overlay-proxy/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
