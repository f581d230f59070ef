//! Host literals: overlay-address hostnames (`<55 chars>.adnl`) and content-hash hostnames (`<64 hex>.bag`).
//! Pure functions; nothing here touches the network.

use crc::{Crc, CRC_16_XMODEM};
use data_encoding::BASE32;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of an overlay-address literal (without the `.adnl` suffix).
pub const OVERLAY_LITERAL_LEN: usize = 55;

/// Length of a content-hash literal (without the `.bag` suffix).
pub const CONTENT_LITERAL_LEN: usize = 64;

/// Scheme tag prefixed to the key before encoding.
const OVERLAY_TAG: u8 = 0x2d;

/// Every tagged literal encodes to 56 base32 chars starting with this one; it is dropped from the hostname.
const OVERLAY_LEAD: char = 'F';

/// Key-type prefix hashed together with a public key to derive its key id.
const PUB_ED25519_PREFIX: [u8; 4] = [0xc6, 0xb4, 0x13, 0x48];

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Suffixes routed through the overlay rather than the clear web.
pub const OVERLAY_SUFFIXES: [&str; 4] = [".adnl", ".bag", ".ton", ".t.me"];

/// 256-bit overlay key id: what an overlay-address literal carries and what the directory is keyed by.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 32]);

impl KeyId {
    /// Key id of a public key: SHA-256 over the key-type prefix and the key bytes.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(PUB_ED25519_PREFIX);
        hasher.update(key.as_bytes());
        KeyId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Peer public key (32 bytes) as handed out by the directory.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Content-addressed object id (bag id).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("wrong literal length {got}, expected {expected}")]
    WrongLength { got: usize, expected: usize },
    #[error("literal is not valid {0}")]
    Encoding(&'static str),
    #[error("invalid scheme tag {0:#04x}")]
    WrongTag(u8),
    #[error("checksum mismatch")]
    Checksum,
}

/// Decode an overlay-address literal (case-insensitive) into its key id.
pub fn decode_overlay_hostname(name: &str) -> Result<KeyId, AddressError> {
    if name.len() != OVERLAY_LITERAL_LEN {
        return Err(AddressError::WrongLength {
            got: name.len(),
            expected: OVERLAY_LITERAL_LEN,
        });
    }
    let mut literal = String::with_capacity(OVERLAY_LITERAL_LEN + 1);
    literal.push(OVERLAY_LEAD);
    literal.push_str(&name.to_ascii_uppercase());
    let buf = BASE32
        .decode(literal.as_bytes())
        .map_err(|_| AddressError::Encoding("base32"))?;
    if buf.len() != 35 {
        return Err(AddressError::Encoding("base32"));
    }
    if buf[0] != OVERLAY_TAG {
        return Err(AddressError::WrongTag(buf[0]));
    }
    let expected = u16::from_be_bytes([buf[33], buf[34]]);
    if CRC16.checksum(&buf[..33]) != expected {
        return Err(AddressError::Checksum);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[1..33]);
    Ok(KeyId(key))
}

/// Encode a key id as a lowercase overlay-address literal (no suffix).
pub fn encode_overlay_hostname(key: &KeyId) -> String {
    let mut buf = Vec::with_capacity(35);
    buf.push(OVERLAY_TAG);
    buf.extend_from_slice(key.as_bytes());
    let crc = CRC16.checksum(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    let encoded = BASE32.encode(&buf);
    encoded[1..].to_ascii_lowercase()
}

/// Decode a 64-hex-char content-hash literal.
pub fn decode_content_hostname(name: &str) -> Result<ContentId, AddressError> {
    if name.len() != CONTENT_LITERAL_LEN {
        return Err(AddressError::WrongLength {
            got: name.len(),
            expected: CONTENT_LITERAL_LEN,
        });
    }
    let mut id = [0u8; 32];
    hex::decode_to_slice(name, &mut id).map_err(|_| AddressError::Encoding("hex"))?;
    Ok(ContentId(id))
}

/// What a request host names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    /// `<literal>.adnl`
    Overlay(KeyId),
    /// `<hex>.bag`
    Content(ContentId),
    /// Anything else: goes to the name service.
    Name(String),
}

/// Classify a request host. Port and trailing dot are ignored; a malformed literal is an error, never a name.
pub fn classify_host(host: &str) -> Result<HostKind, AddressError> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if let Some(literal) = host.strip_suffix(".adnl") {
        return decode_overlay_hostname(literal).map(HostKind::Overlay);
    }
    if let Some(literal) = host.strip_suffix(".bag") {
        return decode_content_hostname(literal).map(HostKind::Content);
    }
    Ok(HostKind::Name(host))
}

/// Whether a host is served through the overlay transport.
pub fn is_overlay_host(host: &str) -> bool {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    OVERLAY_SUFFIXES.iter().any(|s| host.ends_with(s))
}

/// Drop a `:port` suffix. Bracketed IPv6 literals keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}
