//! Overlay gateway core.
//! No I/O: host literal codecs, RPC message types, framing, and the byte/piece arithmetic the daemon drives.

pub mod address;
pub mod protocol;
pub mod wire;

pub use address::{AddressError, ContentId, HostKind, KeyId, PublicKey};
pub use protocol::{Answer, Frame, Header, PayloadPart, Query, Request, Response, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

pub mod mime;
pub mod piece;
pub mod range;

pub use piece::{FileSpan, PieceWindow};
pub use range::{ByteRange, RangeError};
