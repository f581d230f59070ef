//! HTTP-over-RPC wire messages and the frames that carry them on a peer channel.

use serde::{Deserialize, Serialize};

use crate::address::PublicKey;

/// Peer channel protocol version. Exchanged in the `Hello` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// HTTP version string carried in `Request`/`Response`.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// 256-bit request id; also keys payload pulls for that request.
pub type RequestId = [u8; 32];

/// Fresh random request id.
pub fn random_request_id() -> RequestId {
    rand::random()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `http.request`: opens a request; answered by `Response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Vec<Header>,
}

/// `http.response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: String,
    pub status_code: i32,
    pub reason: String,
    pub headers: Vec<Header>,
    pub no_payload: bool,
}

/// `http.getNextPayloadPart`: pull the chunk at offset `seqno * max_chunk_size` of the body keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNextPayloadPart {
    pub id: RequestId,
    pub seqno: i32,
    pub max_chunk_size: i32,
}

/// `http.payloadPart`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPart {
    pub data: Vec<u8>,
    pub trailer: Vec<Header>,
    pub is_last: bool,
}

/// `http.proxy.getCapabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCapabilities {
    pub capabilities: i64,
}

/// `http.proxy.capabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub value: i64,
}

/// Anything one side may ask the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    Request(Request),
    GetNextPayloadPart(GetNextPayloadPart),
    GetCapabilities(GetCapabilities),
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Request(_) => "http.request",
            Query::GetNextPayloadPart(_) => "http.getNextPayloadPart",
            Query::GetCapabilities(_) => "http.proxy.getCapabilities",
        }
    }
}

/// Answers, one per query kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    Response(Response),
    PayloadPart(PayloadPart),
    Capabilities(Capabilities),
}

impl Answer {
    pub fn name(&self) -> &'static str {
        match self {
            Answer::Response(_) => "http.response",
            Answer::PayloadPart(_) => "http.payloadPart",
            Answer::Capabilities(_) => "http.proxy.capabilities",
        }
    }
}

/// Peer channel frames. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction.
    Hello {
        protocol_version: u8,
        public_key: PublicKey,
    },
    Query {
        query_id: u64,
        max_answer_size: u64,
        query: Query,
    },
    Answer {
        query_id: u64,
        answer: Answer,
    },
    /// The query failed on the answering side.
    Error {
        query_id: u64,
        message: String,
    },
}
