//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use overlay_core::protocol::{GetNextPayloadPart, Response, HTTP_VERSION};
use overlay_core::{Answer, ContentId, FileSpan, Header, KeyId, PayloadPart, PublicKey, Query};

use crate::resolver::{Directory, DirectoryError, NameError, NameService, SiteRecord};
use crate::rpc::{DisconnectHandler, PeerConnector, QueryHandler, RpcChannel, RpcError};
use crate::storage::{Downloader, StorageEngine, StorageError};

/// Deterministic key pair stand-in.
pub(crate) fn peer_key(seed: u8) -> (KeyId, PublicKey) {
    let public_key = PublicKey([seed; 32]);
    (KeyId::from_public_key(&public_key), public_key)
}

type NameAnswer = Result<SiteRecord, NameError>;

/// Name service answering from a script of (delay, answer), then from a default.
pub(crate) struct ScriptedNames {
    script: Mutex<VecDeque<(Duration, NameAnswer)>>,
    default: Mutex<NameAnswer>,
    pub calls: AtomicUsize,
}

impl Default for ScriptedNames {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Err(NameError::NoSuchRecord)),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedNames {
    pub fn push(&self, delay: Duration, answer: NameAnswer) {
        self.script.lock().unwrap().push_back((delay, answer));
    }

    pub fn set_default(&self, answer: NameAnswer) {
        *self.default.lock().unwrap() = answer;
    }
}

#[async_trait]
impl NameService for ScriptedNames {
    async fn resolve(&self, _name: &str) -> NameAnswer {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let (delay, answer) =
            next.unwrap_or_else(|| (Duration::ZERO, self.default.lock().unwrap().clone()));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        answer
    }
}

#[derive(Default)]
pub(crate) struct MockDirectory {
    entries: Mutex<HashMap<KeyId, (Vec<SocketAddr>, PublicKey)>>,
    pub calls: AtomicUsize,
}

impl MockDirectory {
    pub fn insert(&self, key: KeyId, addrs: Vec<SocketAddr>, public_key: PublicKey) {
        self.entries
            .lock()
            .unwrap()
            .insert(key, (addrs, public_key));
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn find_addresses(
        &self,
        key: &KeyId,
    ) -> Result<(Vec<SocketAddr>, PublicKey), DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(DirectoryError::NotFound)
    }
}

/// Remote site behaviour behind a mock channel.
#[async_trait]
pub(crate) trait MockSite: Send + Sync {
    async fn answer(&self, query: Query, peer: &MockChannel) -> Result<Answer, RpcError>;
}

/// Site answering one response and a fixed list of payload parts.
pub(crate) struct StaticSite {
    pub status: i32,
    pub headers: Vec<Header>,
    pub parts: Vec<Vec<u8>>,
    pub trailer: Vec<Header>,
    pub no_payload: bool,
}

impl StaticSite {
    pub fn ok(parts: &[&str]) -> Self {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        Self {
            status: 200,
            headers: vec![
                Header::new("Content-Type", "text/plain"),
                Header::new("Content-Length", len.to_string()),
            ],
            parts: parts.iter().map(|p| p.as_bytes().to_vec()).collect(),
            trailer: vec![],
            no_payload: false,
        }
    }
}

#[async_trait]
impl MockSite for StaticSite {
    async fn answer(&self, query: Query, _peer: &MockChannel) -> Result<Answer, RpcError> {
        match query {
            Query::Request(_) => Ok(Answer::Response(Response {
                version: HTTP_VERSION.into(),
                status_code: self.status,
                reason: String::new(),
                headers: self.headers.clone(),
                no_payload: self.no_payload,
            })),
            Query::GetNextPayloadPart(GetNextPayloadPart { seqno, .. }) => {
                let i = seqno as usize;
                let data = self
                    .parts
                    .get(i)
                    .cloned()
                    .ok_or_else(|| RpcError::Remote(format!("no part {seqno}")))?;
                let is_last = i + 1 == self.parts.len();
                Ok(Answer::PayloadPart(PayloadPart {
                    data,
                    trailer: if is_last { self.trailer.clone() } else { vec![] },
                    is_last,
                }))
            }
            other => Err(RpcError::UnexpectedQuery(other.name())),
        }
    }
}

pub(crate) struct MockChannel {
    site: Arc<dyn MockSite>,
    handler: Mutex<Option<Arc<dyn QueryHandler>>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    pub closed: AtomicBool,
    queries: Mutex<Vec<Query>>,
}

impl MockChannel {
    pub fn new(site: Arc<dyn MockSite>) -> Arc<Self> {
        Arc::new(Self {
            site,
            handler: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            closed: AtomicBool::new(false),
            queries: Mutex::new(Vec::new()),
        })
    }

    /// Query the gateway side of the channel, as the remote peer would.
    pub async fn ask_gateway(&self, query: Query) -> Result<Answer, RpcError> {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(h) => h.handle(query).await,
            None => Err(RpcError::Closed),
        }
    }

    /// Simulate the transport dropping.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handler = self.on_disconnect.lock().unwrap().take();
        if let Some(h) = handler {
            h();
        }
    }

    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn query(&self, query: Query, _max_answer_size: u64) -> Result<Answer, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        self.queries.lock().unwrap().push(query.clone());
        self.site.answer(query, self).await
    }

    fn set_query_handler(&self, handler: Arc<dyn QueryHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.on_disconnect.lock().unwrap() = Some(handler);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct MockConnector {
    site: Arc<dyn MockSite>,
    refuse: Mutex<HashSet<SocketAddr>>,
    delay: Duration,
    pub connects: AtomicUsize,
    channels: Mutex<Vec<(SocketAddr, Arc<MockChannel>)>>,
}

impl MockConnector {
    pub fn new(site: Arc<dyn MockSite>) -> Self {
        Self::with_delay(site, Duration::ZERO)
    }

    pub fn with_delay(site: Arc<dyn MockSite>, delay: Duration) -> Self {
        Self {
            site,
            refuse: Mutex::new(HashSet::new()),
            delay,
            connects: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn refuse(&self, addr: SocketAddr) {
        self.refuse.lock().unwrap().insert(addr);
    }

    pub fn channels(&self) -> Vec<(SocketAddr, Arc<MockChannel>)> {
        self.channels.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        _key: &PublicKey,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.refuse.lock().unwrap().contains(&addr) {
            return Err(RpcError::Io("connection refused".into()));
        }
        let channel = MockChannel::new(self.site.clone());
        self.channels.lock().unwrap().push((addr, channel.clone()));
        Ok(channel)
    }
}

#[derive(Default)]
pub(crate) struct MemoryStorage {
    bags: Mutex<HashMap<ContentId, Arc<MemoryBag>>>,
    pub opens: AtomicUsize,
}

impl MemoryStorage {
    pub fn insert(&self, id: ContentId, bag: Arc<MemoryBag>) {
        self.bags.lock().unwrap().insert(id, bag);
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn open(&self, id: &ContentId) -> Result<Arc<dyn Downloader>, StorageError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let bag = self.bags.lock().unwrap().get(id).cloned();
        match bag {
            Some(b) => Ok(b),
            None => Err(StorageError::NotFound(id.to_hex())),
        }
    }
}

/// Files concatenated in order and split into pieces of `piece_size`.
pub(crate) struct MemoryBag {
    piece_size: u32,
    files: Vec<(String, FileSpan)>,
    data: Vec<u8>,
    /// Later pieces within a group of 8 complete sooner.
    pub scramble: bool,
    pub fail_piece: Option<u32>,
    pub fetched: Mutex<Vec<u32>>,
    pub closed: AtomicBool,
}

impl MemoryBag {
    pub fn new(piece_size: u32, files: Vec<(&str, Vec<u8>)>) -> Self {
        let mut data = Vec::new();
        let mut spans = Vec::new();
        for (name, contents) in files {
            let span = FileSpan::locate(data.len() as u64, contents.len() as u64, piece_size);
            spans.push((name.to_string(), span));
            data.extend_from_slice(&contents);
        }
        Self {
            piece_size,
            files: spans,
            data,
            scramble: false,
            fail_piece: None,
            fetched: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn fetched(&self) -> Vec<u32> {
        let mut v = self.fetched.lock().unwrap().clone();
        v.sort_unstable();
        v
    }
}

#[async_trait]
impl Downloader for MemoryBag {
    fn piece_size(&self) -> u32 {
        self.piece_size
    }

    fn file_offsets(&self, path: &str) -> Option<FileSpan> {
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, span)| *span)
    }

    async fn download_piece(&self, index: u32) -> Result<Bytes, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        self.fetched.lock().unwrap().push(index);
        if self.scramble {
            tokio::time::sleep(Duration::from_millis(8 - (index % 8) as u64)).await;
        }
        if self.fail_piece == Some(index) {
            return Err(StorageError::Piece {
                index,
                reason: "no peers".into(),
            });
        }
        let ps = self.piece_size as usize;
        let start = index as usize * ps;
        if start >= self.data.len() {
            return Err(StorageError::Piece {
                index,
                reason: "out of range".into(),
            });
        }
        let end = (start + ps).min(self.data.len());
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
