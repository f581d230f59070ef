//! HTTP over the peer RPC channel: one outbound `Request` per HTTP request, response bodies
//! pulled in `GetNextPayloadPart` steps, request bodies served to the peer the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use overlay_core::protocol::{
    random_request_id, Capabilities, GetNextPayloadPart, RequestId, HTTP_VERSION,
};
use overlay_core::{Answer, Header, PayloadPart, Query, Request};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::message::{find_header, GatewayRequest, GatewayResponse, Trailers};
use crate::rpc::{QueryHandler, RpcChannel, RpcError};
use crate::stream::{DataStream, StreamWriter, DEFAULT_STREAM_BUFFER};

/// Response buffers are pre-allocated from `Content-Length` below this size.
const PRESIZE_LIMIT: u64 = 4 << 20; // 4 MiB

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: u32,
    pub query_timeout: Duration,
    pub pending_ttl: Duration,
    pub stream_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 17,
            query_timeout: Duration::from_secs(30),
            pending_ttl: Duration::from_secs(15),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Answer bound for `Request` queries.
    pub fn request_answer_limit(&self) -> u64 {
        2 * self.chunk_size as u64 + 1024
    }

    /// `max_chunk_size` asked for in each payload pull.
    pub fn pull_chunk_size(&self) -> i32 {
        (self.chunk_size as i64 * 100).min(i32::MAX as i64) as i32
    }

    pub fn pull_answer_limit(&self) -> u64 {
        self.pull_chunk_size() as u64 + self.request_answer_limit()
    }
}

/// A request body the peer is pulling from us.
struct PendingStream {
    source: tokio::sync::Mutex<PendingSource>,
    expires_at: Instant,
}

struct PendingSource {
    body: DataStream,
    next_offset: u64,
}

#[derive(Default)]
struct PendingStreams {
    streams: Mutex<HashMap<RequestId, Arc<PendingStream>>>,
}

impl PendingStreams {
    fn register(self: &Arc<Self>, id: RequestId, body: DataStream, ttl: Duration) -> PendingGuard {
        let stream = Arc::new(PendingStream {
            source: tokio::sync::Mutex::new(PendingSource {
                body,
                next_offset: 0,
            }),
            expires_at: Instant::now() + ttl,
        });
        self.lock().insert(id, stream);
        PendingGuard {
            streams: self.clone(),
            id,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Arc<PendingStream>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    async fn next_part(&self, pull: GetNextPayloadPart) -> Result<PayloadPart, RpcError> {
        let stream = self
            .lock()
            .get(&pull.id)
            .cloned()
            .ok_or_else(|| RpcError::Rejected("unknown payload id".into()))?;
        if Instant::now() >= stream.expires_at {
            self.remove(&pull.id);
            return Err(RpcError::Rejected("payload stream expired".into()));
        }
        if pull.seqno < 0 || pull.max_chunk_size <= 0 {
            return Err(RpcError::Rejected(format!(
                "bad pull seqno {} chunk {}",
                pull.seqno, pull.max_chunk_size
            )));
        }

        let mut src = stream.source.lock().await;
        let offset = pull.seqno as u64 * pull.max_chunk_size as u64;
        if offset != src.next_offset {
            let expected = src.next_offset;
            src.body.close();
            drop(src);
            self.remove(&pull.id);
            return Err(RpcError::Rejected(format!(
                "incorrect offset {offset}, expected {expected}"
            )));
        }
        let (data, is_last) = src
            .body
            .read_up_to(pull.max_chunk_size as usize)
            .await
            .map_err(|_| RpcError::Rejected("request body aborted".into()))?;
        src.next_offset += data.len() as u64;
        if is_last {
            src.body.close();
            drop(src);
            self.remove(&pull.id);
        }
        Ok(PayloadPart {
            data: data.to_vec(),
            trailer: vec![],
            is_last,
        })
    }
}

/// Removes the pending stream once the outbound request is answered.
struct PendingGuard {
    streams: Arc<PendingStreams>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
    }
}

/// Answers what the peer asks us on this channel.
struct SessionHandler {
    pending: Arc<PendingStreams>,
}

#[async_trait]
impl QueryHandler for SessionHandler {
    async fn handle(&self, query: Query) -> Result<Answer, RpcError> {
        match query {
            Query::GetNextPayloadPart(pull) => {
                self.pending.next_part(pull).await.map(Answer::PayloadPart)
            }
            // No optional capabilities.
            Query::GetCapabilities(_) => Ok(Answer::Capabilities(Capabilities { value: 0 })),
            other => Err(RpcError::UnexpectedQuery(other.name())),
        }
    }
}

pub struct RldpSession {
    host: String,
    channel: Arc<dyn RpcChannel>,
    pending: Arc<PendingStreams>,
    config: SessionConfig,
}

impl RldpSession {
    pub fn new(host: impl Into<String>, channel: Arc<dyn RpcChannel>, config: SessionConfig) -> Self {
        let pending = Arc::new(PendingStreams::default());
        channel.set_query_handler(Arc::new(SessionHandler {
            pending: pending.clone(),
        }));
        Self {
            host: host.into(),
            channel,
            pending,
            config,
        }
    }

    pub fn channel(&self) -> &Arc<dyn RpcChannel> {
        &self.channel
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub async fn request(
        &self,
        req: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let id = random_request_id();
        let mut headers = Vec::with_capacity(req.headers.len() + 2);
        headers.push(Header::new("Host", req.host.as_str()));
        if let Some(len) = req.content_length {
            headers.push(Header::new("Content-Length", len.to_string()));
        }
        headers.extend(req.headers.into_iter().filter(|h| {
            !h.name.eq_ignore_ascii_case("host") && !h.name.eq_ignore_ascii_case("content-length")
        }));

        let _pending = req
            .body
            .map(|body| self.pending.register(id, body, self.config.pending_ttl));

        debug!(host = %self.host, method = %req.method, url = %req.url, "over rldp");
        let query = Query::Request(Request {
            id,
            method: req.method,
            url: req.url,
            version: HTTP_VERSION.to_string(),
            headers,
        });
        let answer = ask(
            self.channel.as_ref(),
            &self.host,
            self.config.query_timeout,
            query,
            self.config.request_answer_limit(),
            cancel,
        )
        .await?;
        let response = match answer {
            Answer::Response(r) => r,
            other => {
                return Err(GatewayError::ProtocolViolation(format!(
                    "expected http.response, got {}",
                    other.name()
                )))
            }
        };
        let status = u16::try_from(response.status_code)
            .ok()
            .filter(|s| (100..=999).contains(s))
            .ok_or_else(|| {
                GatewayError::ProtocolViolation(format!("status code {}", response.status_code))
            })?;

        let with_payload = !response.no_payload && !(300..400).contains(&status);
        let declared = find_header(&response.headers, "content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let trailers = Trailers::default();

        let (body, content_length) = if with_payload {
            let presize = declared.filter(|len| *len < PRESIZE_LIMIT).unwrap_or(0) as usize;
            let (writer, body) = DataStream::with_capacity(self.config.stream_buffer, presize);
            tokio::spawn(pull_payload(PayloadPull {
                channel: self.channel.clone(),
                host: self.host.clone(),
                id,
                config: self.config.clone(),
                declared,
                writer,
                trailers: trailers.clone(),
                cancel: cancel.clone(),
            }));
            (body, declared)
        } else {
            (DataStream::empty(), Some(0))
        };

        Ok(GatewayResponse {
            status,
            reason: response.reason,
            headers: response.headers,
            content_length,
            body,
            trailers,
        })
    }
}

async fn ask(
    channel: &dyn RpcChannel,
    host: &str,
    timeout: Duration,
    query: Query,
    max_answer_size: u64,
    cancel: &CancellationToken,
) -> Result<Answer, GatewayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        r = tokio::time::timeout(timeout, channel.query(query, max_answer_size)) => match r {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(GatewayError::from_rpc(host, e)),
            Err(_) => Err(GatewayError::UpstreamTimeout(host.to_string())),
        },
    }
}

struct PayloadPull {
    channel: Arc<dyn RpcChannel>,
    host: String,
    id: RequestId,
    config: SessionConfig,
    /// The site's `Content-Length`; the pulled body must match it exactly.
    declared: Option<u64>,
    writer: StreamWriter,
    trailers: Trailers,
    cancel: CancellationToken,
}

/// Pull parts from seqno 0 until `is_last`. Any failure aborts the body, as does a body that
/// disagrees with the declared length.
async fn pull_payload(p: PayloadPull) {
    let mut seqno: i32 = 0;
    let mut received: u64 = 0;
    loop {
        let query = Query::GetNextPayloadPart(GetNextPayloadPart {
            id: p.id,
            seqno,
            max_chunk_size: p.config.pull_chunk_size(),
        });
        let answer = ask(
            p.channel.as_ref(),
            &p.host,
            p.config.query_timeout,
            query,
            p.config.pull_answer_limit(),
            &p.cancel,
        )
        .await;
        let part = match answer {
            Ok(Answer::PayloadPart(part)) => part,
            Ok(other) => {
                warn!(host = %p.host, seqno, answer = other.name(), "unexpected answer to payload pull");
                p.writer.close();
                return;
            }
            Err(e) => {
                warn!(host = %p.host, seqno, error = %e, "payload pull failed");
                p.writer.close();
                return;
            }
        };
        received += part.data.len() as u64;
        if let Some(declared) = p.declared {
            let short = part.is_last && received < declared;
            if received > declared || short {
                warn!(host = %p.host, declared, received, "payload length mismatch");
                p.writer.close();
                return;
            }
        }
        if !part.trailer.is_empty() {
            p.trailers.extend(part.trailer);
        }
        if p.writer.write(&part.data).await.is_err() {
            debug!(host = %p.host, seqno, "response reader gone");
            return;
        }
        if part.is_last {
            p.writer.finish();
            return;
        }
        seqno = match seqno.checked_add(1) {
            Some(next) => next,
            None => {
                p.writer.close();
                return;
            }
        };
    }
}
