//! Local HTTP proxy: listen on localhost, parse requests, send overlay hosts through the
//! transport and forward the rest to the clear web.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use overlay_core::address::{is_overlay_host, strip_port};
use overlay_core::Header;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::message::{find_header, GatewayRequest, GatewayResponse};
use crate::stream::{DataStream, StreamWriter, DEFAULT_STREAM_BUFFER};
use crate::transport::Transport;

/// Removed before forwarding, in both directions.
pub const HOP_HEADERS: [&str; 9] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// Identity header added to forwarded requests.
pub const VERSION_HEADER: &str = "X-Overlay-Proxy";

const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;
const BODY_CHUNK: usize = 64 * 1024;

pub struct ProxyState {
    transport: Arc<Transport>,
    http: reqwest::Client,
    block_http: bool,
    version_tag: String,
    stream_buffer: usize,
}

impl ProxyState {
    pub fn new(
        transport: Arc<Transport>,
        block_http: bool,
        version_tag: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            transport,
            http,
            block_http,
            version_tag: version_tag.into(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        })
    }

    /// Buffer limit for request bodies and clear-web response bodies.
    pub fn with_stream_buffer(mut self, limit: usize) -> Self {
        self.stream_buffer = limit.max(1);
        self
    }
}

/// Accept connections until `shutdown`, each handled on its own task.
pub async fn run_proxy(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "proxy listening");
    }
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = listener.accept() => r,
        };
        let (stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, state, shutdown).await {
                debug!(%peer, error = %e, "client connection ended");
            }
        });
    }
}

struct RequestHead {
    method: String,
    target: String,
    headers: Vec<Header>,
    len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(len) = req.parse(buf)? else {
        return Ok(None);
    };
    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value).trim()))
        .collect();
    Ok(Some(RequestHead {
        method,
        target,
        headers,
        len,
    }))
}

/// Read until the request head is complete. None if the client went away first.
async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<RequestHead>> {
    let mut chunk = [0u8; 8192];
    loop {
        if !buf.is_empty() {
            match parse_head(buf) {
                Ok(Some(head)) => return Ok(Some(head)),
                Ok(None) => {}
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                }
            }
        }
        if buf.len() >= MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RequestUrl {
    url: String,
    host: String,
    path: String,
}

/// Absolute URL for a request target. Origin-form targets take the scheme from
/// `X-Forwarded-Proto` (default http) and the host from `Host`.
fn request_url(target: &str, headers: &[Header]) -> Result<RequestUrl, String> {
    let url = if target.contains("://") {
        target.to_string()
    } else {
        let scheme = find_header(headers, "x-forwarded-proto")
            .filter(|s| !s.is_empty())
            .unwrap_or("http");
        let host = find_header(headers, "host").unwrap_or_default();
        format!("{scheme}://{host}{target}")
    };
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| "malformed url".to_string())?;
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Err(format!("unsupported protocol scheme {scheme}"));
    }
    let split = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..split];
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let host = strip_port(authority).to_ascii_lowercase();
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    let raw_path = rest[split..].split(['?', '#']).next().unwrap_or("");
    let path = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| "invalid path encoding".to_string())?;
    let path = if path.is_empty() {
        "/".to_string()
    } else {
        path.into_owned()
    };
    Ok(RequestUrl { host, path, url })
}

/// Upstream text containing CR or LF must not reach the response head.
fn is_line_safe(s: &str) -> bool {
    !s.contains(['\r', '\n'])
}

fn is_writable_header(h: &Header) -> bool {
    is_line_safe(&h.name) && is_line_safe(&h.value)
}

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Hop-by-hop headers removed, client appended to `X-Forwarded-For`, identity header set.
fn forward_headers(headers: Vec<Header>, client: IpAddr, version_tag: &str) -> Vec<Header> {
    let prior = find_header(&headers, "x-forwarded-for").map(str::to_owned);
    let mut out: Vec<Header> = headers
        .into_iter()
        .filter(|h| {
            !is_hop_header(&h.name)
                && !h.name.eq_ignore_ascii_case("x-forwarded-for")
                && !h.name.eq_ignore_ascii_case(VERSION_HEADER)
        })
        .collect();
    let forwarded = match prior {
        Some(p) if !p.is_empty() => format!("{p}, {client}"),
        _ => client.to_string(),
    };
    out.push(Header::new("X-Forwarded-For", forwarded));
    out.push(Header::new(VERSION_HEADER, version_tag));
    out
}

fn text_response(status: u16, text: &str) -> GatewayResponse {
    let headers = if text.is_empty() {
        vec![]
    } else {
        vec![Header::new("Content-Type", "text/plain; charset=utf-8")]
    };
    GatewayResponse::with_body(status, headers, text.as_bytes())
}

fn error_response(err: &GatewayError, host: &str) -> GatewayResponse {
    let status = err.status();
    let text = match err {
        GatewayError::UpstreamTimeout(_) => format!("Site {host} is not responding."),
        GatewayError::RangeNotSatisfiable(_) => String::new(),
        _ if status == 502 => format!("Proxy Error:\n{err}"),
        _ => err.to_string(),
    };
    text_response(status, &text)
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = Vec::with_capacity(8192);
    let head = match read_head(&mut rd, &mut buf).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            write_response(&mut wr, text_response(400, "Bad Request"), false).await?;
            return Err(e);
        }
    };

    // No tunnelling: the handshake is acknowledged and the connection closed.
    if head.method.eq_ignore_ascii_case("CONNECT") {
        wr.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        return wr.shutdown().await;
    }

    let is_head = head.method.eq_ignore_ascii_case("HEAD");
    let target = match request_url(&head.target, &head.headers) {
        Ok(t) => t,
        Err(msg) => return write_response(&mut wr, text_response(400, &msg), is_head).await,
    };
    let is_chunked = find_header(&head.headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if is_chunked {
        let resp = text_response(411, "chunked request bodies are not supported");
        return write_response(&mut wr, resp, is_head).await;
    }
    let content_length = match find_header(&head.headers, "content-length") {
        Some(v) => match v.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                let resp = text_response(400, "bad Content-Length");
                return write_response(&mut wr, resp, is_head).await;
            }
        },
        None => None,
    };

    let body = match content_length {
        Some(len) if len > 0 => {
            let (writer, body) = DataStream::new(state.stream_buffer);
            let leftover = buf[head.len..].to_vec();
            tokio::spawn(feed_body(leftover, rd, len, writer));
            Some(body)
        }
        _ => None,
    };

    let req = GatewayRequest {
        method: head.method,
        url: target.url,
        host: target.host,
        path: target.path,
        headers: forward_headers(head.headers, peer.ip(), &state.version_tag),
        content_length,
        body,
    };

    let cancel = shutdown.child_token();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let host = req.host.clone();
    let result = if is_overlay_host(&host) {
        state.transport.dispatch(req, &cancel).await
    } else if state.block_http {
        Ok(text_response(400, "HTTP Not allowed"))
    } else {
        forward_http(&state, req, &cancel).await
    };
    let response = match result {
        Ok(r) => r,
        Err(e) => {
            warn!(%host, error = %e, "cannot open");
            error_response(&e, &host)
        }
    };
    debug!(%host, status = response.status, "responding");
    write_response(&mut wr, response, is_head).await
}

/// Copy `len` request body bytes (some possibly already buffered) into the body stream.
async fn feed_body<R: AsyncRead + Unpin>(
    leftover: Vec<u8>,
    mut rd: R,
    len: u64,
    writer: StreamWriter,
) {
    let mut remaining = len;
    let take = (leftover.len() as u64).min(remaining) as usize;
    if take > 0 {
        if writer.write(&leftover[..take]).await.is_err() {
            return;
        }
        remaining -= take as u64;
    }
    let mut chunk = vec![0u8; BODY_CHUNK];
    while remaining > 0 {
        let want = (remaining as usize).min(chunk.len());
        match rd.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => {
                debug!(remaining, "request body cut short");
                writer.close();
                return;
            }
            Ok(n) => {
                if writer.write(&chunk[..n]).await.is_err() {
                    return;
                }
                remaining -= n as u64;
            }
        }
    }
    writer.finish();
}

async fn forward_http(
    state: &ProxyState,
    mut req: GatewayRequest,
    cancel: &CancellationToken,
) -> Result<GatewayResponse, GatewayError> {
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| GatewayError::Http(format!("bad method {}", req.method)))?;
    let mut builder = state.http.request(method, req.url.as_str());
    for h in &req.headers {
        if h.name.eq_ignore_ascii_case("host") || h.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(h.name.as_str(), h.value.as_str());
    }
    if let Some(mut body) = req.body.take() {
        builder = builder.body(body.read_to_end().await?);
    }

    debug!(url = %req.url, method = %req.method, "over http");
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        r = builder.send() => r.map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTimeout(req.host.clone())
            } else {
                GatewayError::Http(e.to_string())
            }
        })?,
    };

    let status = resp.status().as_u16();
    let reason = resp.status().canonical_reason().unwrap_or_default().to_string();
    let headers: Vec<Header> = resp
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_header(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| Header::new(name.as_str(), v))
        })
        .collect();
    let content_length = resp.content_length();

    let (writer, body) = DataStream::new(state.stream_buffer);
    let url = req.url;
    tokio::spawn(async move {
        let mut chunks = resp.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    if writer.write(&bytes).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(%url, error = %e, "upstream body failed");
                    writer.close();
                    return;
                }
            }
        }
        writer.finish();
    });

    Ok(GatewayResponse {
        status,
        reason,
        headers,
        content_length,
        body,
        trailers: Default::default(),
    })
}

/// Write status, headers and body, then close. Bodies of unknown length are sent chunked,
/// with any trailers the payload carried.
async fn write_response<W: AsyncWrite + Unpin>(
    wr: &mut W,
    mut resp: GatewayResponse,
    is_head: bool,
) -> std::io::Result<()> {
    let reason = if resp.reason.is_empty() || !is_line_safe(&resp.reason) {
        reqwest::StatusCode::from_u16(resp.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
    } else {
        resp.reason.as_str()
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", resp.status, reason);
    for h in &resp.headers {
        if is_hop_header(&h.name)
            || h.name.eq_ignore_ascii_case("content-length")
            || !is_writable_header(h)
        {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", h.name, h.value));
    }
    let chunked = resp.content_length.is_none() && !is_head;
    match resp.content_length {
        Some(len) => head.push_str(&format!("Content-Length: {len}\r\n")),
        None if chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        None => {}
    }
    head.push_str("Connection: close\r\n\r\n");
    wr.write_all(head.as_bytes()).await?;

    if !is_head {
        loop {
            let chunk = resp.body.next_chunk(BODY_CHUNK).await.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            if chunked {
                wr.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                wr.write_all(&chunk).await?;
                wr.write_all(b"\r\n").await?;
            } else {
                wr.write_all(&chunk).await?;
            }
        }
        if chunked {
            let mut tail = String::from("0\r\n");
            for t in resp.trailers.snapshot().iter().filter(|t| is_writable_header(t)) {
                tail.push_str(&format!("{}: {}\r\n", t.name, t.value));
            }
            tail.push_str("\r\n");
            wr.write_all(tail.as_bytes()).await?;
        }
    }
    wr.flush().await?;
    wr.shutdown().await
}
