//! Gateway-side request and response shapes shared by the HTTP front and the transport.

use std::fmt;
use std::sync::{Arc, Mutex};

use overlay_core::Header;

use crate::stream::DataStream;

pub struct GatewayRequest {
    pub method: String,
    /// Absolute URL, scheme included.
    pub url: String,
    /// Request host without port.
    pub host: String,
    /// URL path without query string.
    pub path: String,
    /// Forwardable headers; hop-by-hop ones already removed.
    pub headers: Vec<Header>,
    pub content_length: Option<u64>,
    pub body: Option<DataStream>,
}

impl GatewayRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

pub struct GatewayResponse {
    pub status: u16,
    /// Empty means the canonical reason for `status`.
    pub reason: String,
    pub headers: Vec<Header>,
    /// Exact body length when known up front.
    pub content_length: Option<u64>,
    pub body: DataStream,
    /// Filled in while the body streams; complete once it reaches end-of-data.
    pub trailers: Trailers,
}

impl GatewayResponse {
    /// Response with a fully known body.
    pub fn with_body(status: u16, headers: Vec<Header>, body: &[u8]) -> Self {
        Self {
            status,
            reason: String::new(),
            headers,
            content_length: Some(body.len() as u64),
            body: DataStream::from_bytes(body),
            trailers: Trailers::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Trailer headers delivered alongside a streamed payload.
#[derive(Clone, Default)]
pub struct Trailers(Arc<Mutex<Vec<Header>>>);

impl Trailers {
    pub fn extend(&self, headers: impl IntoIterator<Item = Header>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(headers);
    }

    pub fn snapshot(&self) -> Vec<Header> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}
