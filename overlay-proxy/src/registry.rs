//! Per-host site state: resolved target, the live session, last use. Owns the connect policy
//! and the sweep that releases idle bags.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::resolver::{HostResolver, PeerTarget, Target};
use crate::rpc::PeerConnector;
use crate::session::{RldpSession, SessionConfig};
use crate::storage::{Downloader, StorageEngine};

/// Resolve-and-connect rounds before giving up on a peer host.
const CONNECT_ROUNDS: usize = 2;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A peer connection unused for longer is replaced before reuse.
    pub stale_after: Duration,
    /// A bag session unused for longer is released by the sweep.
    pub idle_content: Duration,
    pub reaper_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            idle_content: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(3),
        }
    }
}

pub struct PeerSession {
    /// None after the channel reported a disconnect or was recycled.
    pub connection: Option<Arc<RldpSession>>,
}

pub struct ContentSession {
    pub downloader: Arc<dyn Downloader>,
}

pub enum SessionVariant {
    None,
    Peer(PeerSession),
    Content(ContentSession),
}

/// What `acquire` hands back.
pub enum Acquired {
    Peer(Arc<RldpSession>),
    Content(BagLease),
}

/// A bag downloader in use by one response. While any lease is alive the sweep leaves the
/// site alone; dropping the last one counts as a use.
pub struct BagLease {
    site: Arc<SiteState>,
    downloader: Arc<dyn Downloader>,
    epoch: Instant,
}

impl BagLease {
    fn new(site: Arc<SiteState>, downloader: Arc<dyn Downloader>, epoch: Instant) -> Self {
        site.active.fetch_add(1, Ordering::SeqCst);
        Self {
            site,
            downloader,
            epoch,
        }
    }

    pub fn downloader(&self) -> &Arc<dyn Downloader> {
        &self.downloader
    }
}

impl Drop for BagLease {
    fn drop(&mut self) {
        self.site.touch(self.epoch.elapsed().as_millis() as u64);
        self.site.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquired::Peer(_) => f.write_str("Acquired::Peer"),
            Acquired::Content(_) => f.write_str("Acquired::Content"),
        }
    }
}

struct SiteInner {
    target: Option<Target>,
    session: SessionVariant,
}

pub struct SiteState {
    host: String,
    /// Milliseconds since the registry epoch.
    last_used: AtomicU64,
    /// Live `BagLease`s.
    active: AtomicUsize,
    inner: Mutex<SiteInner>,
}

impl SiteState {
    fn touch(&self, now_ms: u64) {
        self.last_used.store(now_ms, Ordering::Relaxed);
    }

    fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_used.load(Ordering::Relaxed))
    }

    fn is_streaming(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Forget `session` if it is still the current connection.
    async fn drop_connection(&self, session: &Arc<RldpSession>) {
        let mut inner = self.inner.lock().await;
        if let SessionVariant::Peer(peer) = &mut inner.session {
            if peer
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, session))
            {
                debug!(host = %self.host, "peer disconnected");
                peer.connection = None;
            }
        }
    }
}

pub struct SiteRegistry {
    sites: RwLock<HashMap<String, Arc<SiteState>>>,
    resolver: HostResolver,
    connector: Arc<dyn PeerConnector>,
    storage: Arc<dyn StorageEngine>,
    session_config: SessionConfig,
    config: RegistryConfig,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl SiteRegistry {
    pub fn new(
        resolver: HostResolver,
        connector: Arc<dyn PeerConnector>,
        storage: Arc<dyn StorageEngine>,
        session_config: SessionConfig,
        config: RegistryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sites: RwLock::new(HashMap::new()),
            resolver,
            connector,
            storage,
            session_config,
            config,
            epoch: Instant::now(),
            shutdown,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn site(&self, host: &str) -> Arc<SiteState> {
        if let Some(site) = self.read_sites().get(host) {
            return site.clone();
        }
        let now = self.now_ms();
        self.write_sites()
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(SiteState {
                    host: host.to_string(),
                    last_used: AtomicU64::new(now),
                    active: AtomicUsize::new(0),
                    inner: Mutex::new(SiteInner {
                        target: None,
                        session: SessionVariant::None,
                    }),
                })
            })
            .clone()
    }

    /// Whether `site` is still the map entry for `host`; the sweep may have dropped it.
    fn is_current(&self, host: &str, site: &Arc<SiteState>) -> bool {
        self.read_sites()
            .get(host)
            .is_some_and(|s| Arc::ptr_eq(s, site))
    }

    fn read_sites(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SiteState>>> {
        self.sites.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sites(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SiteState>>> {
        self.sites.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read_sites().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session for `host`, resolving and connecting as needed. Concurrent callers for one host
    /// wait on its lock and reuse what the first one set up.
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Acquired, GatewayError> {
        loop {
            let site = self.site(host);
            let inner = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(GatewayError::Cancelled),
                guard = site.inner.lock() => guard,
            };
            if !self.is_current(host, &site) {
                debug!(host, "site released while waiting, retrying");
                continue;
            }
            return self.acquire_locked(host, &site, inner, cancel).await;
        }
    }

    async fn acquire_locked(
        &self,
        host: &str,
        site: &Arc<SiteState>,
        mut inner: MutexGuard<'_, SiteInner>,
        cancel: &CancellationToken,
    ) -> Result<Acquired, GatewayError> {
        let mut tried = Vec::new();
        for round in 0..CONNECT_ROUNDS {
            let target = match &inner.target {
                Some(t) => t.clone(),
                None => {
                    let t = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(GatewayError::Cancelled),
                        r = self.resolver.resolve(host, cancel) => r?,
                    };
                    inner.target = Some(t.clone());
                    t
                }
            };

            match target {
                Target::Content(id) => {
                    let open = match &inner.session {
                        SessionVariant::Content(c) => Some(c.downloader.clone()),
                        _ => None,
                    };
                    let downloader = match open {
                        Some(d) => d,
                        None => {
                            let d = self.storage.open(&id).await?;
                            info!(host, bag = %id.to_hex(), "bag opened");
                            inner.session = SessionVariant::Content(ContentSession {
                                downloader: d.clone(),
                            });
                            d
                        }
                    };
                    site.touch(self.now_ms());
                    return Ok(Acquired::Content(BagLease::new(
                        site.clone(),
                        downloader,
                        self.epoch,
                    )));
                }
                Target::Peer(peer) => {
                    let now = self.now_ms();
                    if let SessionVariant::Peer(ps) = &mut inner.session {
                        let stale = site.idle_ms(now) > self.config.stale_after.as_millis() as u64;
                        if stale {
                            if let Some(old) = ps.connection.take() {
                                debug!(host, "recycling idle peer connection");
                                tokio::spawn(async move { old.close() });
                            }
                        }
                        if let Some(conn) = &ps.connection {
                            let conn = conn.clone();
                            site.touch(now);
                            return Ok(Acquired::Peer(conn));
                        }
                    }

                    match self.connect_any(site, &peer, cancel).await {
                        Ok(session) => {
                            inner.session = SessionVariant::Peer(PeerSession {
                                connection: Some(session.clone()),
                            });
                            site.touch(self.now_ms());
                            return Ok(Acquired::Peer(session));
                        }
                        Err(GatewayError::AllCandidatesFailed { tried: t, .. }) => {
                            warn!(host, round, tried = ?t, "no candidate accepted, re-resolving");
                            tried = t;
                            inner.target = None;
                            inner.session = SessionVariant::None;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(GatewayError::AllCandidatesFailed {
            host: host.to_string(),
            tried,
        })
    }

    /// Try candidates in order; the first that accepts becomes the session.
    async fn connect_any(
        &self,
        site: &Arc<SiteState>,
        peer: &PeerTarget,
        cancel: &CancellationToken,
    ) -> Result<Arc<RldpSession>, GatewayError> {
        let mut tried: Vec<SocketAddr> = Vec::with_capacity(peer.candidates.len());
        for addr in &peer.candidates {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(GatewayError::Cancelled),
                r = self.connector.connect(*addr, &peer.public_key) => r,
            };
            tried.push(*addr);
            match attempt {
                Ok(channel) => {
                    info!(host = %site.host, %addr, "connected");
                    let session = Arc::new(RldpSession::new(
                        site.host.clone(),
                        channel.clone(),
                        self.session_config.clone(),
                    ));
                    let weak_site: Weak<SiteState> = Arc::downgrade(site);
                    let weak_session = Arc::downgrade(&session);
                    channel.set_disconnect_handler(Box::new(move || {
                        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                            return;
                        };
                        runtime.spawn(async move {
                            if let (Some(site), Some(session)) =
                                (weak_site.upgrade(), weak_session.upgrade())
                            {
                                site.drop_connection(&session).await;
                            }
                        });
                    }));
                    return Ok(session);
                }
                Err(e) => debug!(host = %site.host, %addr, error = %e, "connect failed"),
            }
        }
        Err(GatewayError::AllCandidatesFailed {
            host: site.host.clone(),
            tried,
        })
    }

    /// Release bag sessions idle beyond the threshold. Sites busy with a request or still
    /// streaming a response are skipped. Returns how many were released.
    pub fn sweep(&self) -> usize {
        let now = self.now_ms();
        let limit = self.config.idle_content.as_millis() as u64;
        let idle: Vec<(String, Arc<SiteState>)> = self
            .read_sites()
            .iter()
            .filter(|(_, site)| !site.is_streaming() && site.idle_ms(now) > limit)
            .map(|(host, site)| (host.clone(), site.clone()))
            .collect();

        let mut released = 0;
        for (host, site) in idle {
            let Ok(mut inner) = site.inner.try_lock() else {
                continue;
            };
            if site.is_streaming() || site.idle_ms(now) <= limit {
                continue;
            }
            let downloader = match &inner.session {
                SessionVariant::Content(c) => c.downloader.clone(),
                _ => continue,
            };
            inner.session = SessionVariant::None;
            {
                let mut sites = self.write_sites();
                if sites.get(&host).is_some_and(|s| Arc::ptr_eq(s, &site)) {
                    sites.remove(&host);
                }
            }
            downloader.close();
            info!(host, "idle bag released");
            released += 1;
        }
        released
    }

    /// Periodic sweep until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(registry.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        registry.sweep();
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    /// Close every cached session.
    pub async fn close_all(&self) {
        let sites: Vec<Arc<SiteState>> = self.write_sites().drain().map(|(_, s)| s).collect();
        for site in sites {
            let mut inner = site.inner.lock().await;
            match std::mem::replace(&mut inner.session, SessionVariant::None) {
                SessionVariant::Peer(PeerSession {
                    connection: Some(c),
                }) => c.close(),
                SessionVariant::Content(c) => c.downloader.close(),
                _ => {}
            }
        }
    }
}
