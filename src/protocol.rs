//! # Wire Protocol
//!
//! Tags, framing and handshake types shared by every connection.
//!
//! ## Framing
//!
//! Every gossip message on the wire is one transport frame holding a
//! two-byte [`Tag`] followed by an opaque payload:
//!
//! ```text
//! +--------+----------------------+
//! | tag(2) | payload (0..N bytes) |
//! +--------+----------------------+
//! ```
//!
//! The transport adds its own length prefix (see [`crate::transport`]).
//!
//! ## Handshake
//!
//! Before the gossip stream starts, the dialer sends a [`HandshakeRequest`]
//! (gossip path plus header fields) and the acceptor answers with a
//! [`HandshakeResponse`]. Both are bincode-encoded with bounded
//! deserialization.

use std::collections::BTreeMap;
use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

/// Current protocol version announced in [`PROTOCOL_VERSION_HEADER`].
pub const PROTOCOL_VERSION: &str = "1";

/// Versions we are willing to talk to.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1"];

/// Version segment of the gossip endpoint path.
pub const GOSSIP_PATH_VERSION: &str = "v1";

pub const PROTOCOL_VERSION_HEADER: &str = "X-Meshcast-Version";
pub const GENESIS_HEADER: &str = "X-Meshcast-Genesis";
pub const NODE_RANDOM_HEADER: &str = "X-Meshcast-NodeRandom";
pub const TELEMETRY_ID_HEADER: &str = "X-Meshcast-TelId";
pub const INSTANCE_NAME_HEADER: &str = "X-Meshcast-InstanceName";
pub const ADDRESS_HEADER: &str = "X-Meshcast-Location";
pub const PRIORITY_CHALLENGE_HEADER: &str = "X-Meshcast-PriorityChallenge";

/// Maximum size of a single gossip frame (tag + payload).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum encoded size of a handshake request or response.
/// SECURITY: the handshake is read before the peer is known at all.
pub const MAX_HANDSHAKE_SIZE: u64 = 16 * 1024;

/// Messages at least this large trigger digest-skip announcements and are
/// checked against a peer's outgoing filter before being written.
pub const MESSAGE_FILTER_SIZE: usize = 5000;

/// Two-byte message tag selecting the handler on the receiving side.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag([u8; 2]);

impl Tag {
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    pub const fn from_str_const(s: &str) -> Self {
        let b = s.as_bytes();
        Self([b[0], b[1]])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

pub mod tags {
    use super::Tag;

    pub const AGREEMENT_VOTE: Tag = Tag::from_str_const("AV");
    pub const PROPOSAL_PAYLOAD: Tag = Tag::from_str_const("PP");
    pub const VOTE_BUNDLE: Tag = Tag::from_str_const("VB");
    pub const TXN: Tag = Tag::from_str_const("TX");
    /// Digest of a message the sender already has; payload is 32 bytes.
    pub const MSG_DIGEST_SKIP: Tag = Tag::from_str_const("MS");
    /// Signed answer to an acceptor's priority challenge.
    pub const NET_PRIO_RESPONSE: Tag = Tag::from_str_const("NP");
    pub const PING: Tag = Tag::from_str_const("pi");
    pub const PING_REPLY: Tag = Tag::from_str_const("pj");
}

/// Tags routed through the high-priority queues.
#[inline]
pub fn is_high_priority(tag: Tag) -> bool {
    tag == tags::AGREEMENT_VOTE
        || tag == tags::PROPOSAL_PAYLOAD
        || tag == tags::MSG_DIGEST_SKIP
        || tag == tags::NET_PRIO_RESPONSE
}

/// Tags for which dropping an exact duplicate can never lose information.
#[inline]
pub fn is_dedup_safe(tag: Tag) -> bool {
    tag == tags::AGREEMENT_VOTE || tag == tags::PROPOSAL_PAYLOAD
}

/// Build a wire frame from a tag and payload.
pub fn encode_frame(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(tag.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTooShort;

impl fmt::Display for FrameTooShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame shorter than tag length")
    }
}

impl std::error::Error for FrameTooShort {}

/// Split a wire frame into tag and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(Tag, &[u8]), FrameTooShort> {
    if frame.len() < 2 {
        return Err(FrameTooShort);
    }
    Ok((Tag::new([frame[0], frame[1]]), &frame[2..]))
}

// ============================================================================
// Handshake
// ============================================================================

/// Multi-valued header map, modelled on HTTP headers. Keys are compared
/// case-insensitively by normalizing to lowercase on insert and lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Gossip endpoint path, `/v1/{genesis}/gossip`.
    pub path: String,
    pub headers: Headers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    Accepted,
    Rejected { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub headers: Headers,
}

/// Returns bincode options with size limits enforced.
/// SECURITY: always use this for deserialization of peer-supplied bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_HANDSHAKE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Gossip addresses
// ============================================================================

/// Path of the gossip endpoint for a genesis id, with the genesis id
/// percent-encoded as a single path segment.
pub fn gossip_path(genesis_id: &str) -> String {
    let mut url = Url::parse("ws://gossip.invalid/").expect("static URL must parse");
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(GOSSIP_PATH_VERSION).push(genesis_id).push("gossip");
    }
    url.path().to_string()
}

/// Convert a phonebook address (`host:port`, `http://host:port`,
/// `https://host:port`, `ws://...`) into the full gossip URL.
pub fn addr_to_gossip_addr(addr: &str, genesis_id: &str) -> Result<String, url::ParseError> {
    let with_scheme = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };
    let mut url = Url::parse(&with_scheme)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(url::ParseError::RelativeUrlWithoutBase),
    };
    // Switching between special schemes is always permitted.
    let _ = url.set_scheme(scheme);
    url.set_path(&gossip_path(genesis_id));
    Ok(url.to_string())
}

/// `host:port` to dial for a phonebook or gossip address.
pub fn dial_target(addr: &str) -> Result<String, url::ParseError> {
    if !addr.contains("://") {
        return Ok(addr.to_string());
    }
    let url = Url::parse(addr)?;
    let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
    let port = url
        .port_or_known_default()
        .ok_or(url::ParseError::InvalidPort)?;
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(tags::AGREEMENT_VOTE, b"vote");
        let (tag, payload) = decode_frame(&frame).unwrap();
        assert_eq!(tag, tags::AGREEMENT_VOTE);
        assert_eq!(payload, b"vote");

        let (tag, payload) = decode_frame(b"TX").unwrap();
        assert_eq!(tag, tags::TXN);
        assert!(payload.is_empty());

        assert_eq!(decode_frame(b"T"), Err(FrameTooShort));
    }

    #[test]
    fn tag_classification() {
        assert!(is_high_priority(tags::AGREEMENT_VOTE));
        assert!(is_high_priority(tags::PROPOSAL_PAYLOAD));
        assert!(!is_high_priority(tags::TXN));
        assert!(is_dedup_safe(tags::AGREEMENT_VOTE));
        assert!(!is_dedup_safe(tags::TXN));
        assert_eq!(tags::TXN.to_string(), "TX");
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.set(GENESIS_HEADER, "net-1");
        assert_eq!(headers.get("x-meshcast-genesis"), Some("net-1"));
        headers.append("X-Forwarded-For", "1.2.3.4");
        headers.append("x-forwarded-for", "5.6.7.8");
        assert_eq!(headers.get_all("X-FORWARDED-FOR").len(), 2);
        assert_eq!(headers.get("X-Forwarded-For"), Some("1.2.3.4"));
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn handshake_encoding_is_bounded() {
        let mut headers = Headers::new();
        headers.set(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        let request = HandshakeRequest { path: gossip_path("g"), headers };
        let bytes = serialize_bounded(&request).unwrap();
        let decoded: HandshakeRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.path, "/v1/g/gossip");

        let huge = HandshakeRequest {
            path: "x".repeat(MAX_HANDSHAKE_SIZE as usize * 2),
            headers: Headers::new(),
        };
        assert!(serialize_bounded(&huge).is_err());
    }

    #[test]
    fn gossip_addresses() {
        assert_eq!(gossip_path("test genesisID"), "/v1/test%20genesisID/gossip");
        assert_eq!(
            addr_to_gossip_addr("r7.example.network:4166", "test genesisID").unwrap(),
            "ws://r7.example.network:4166/v1/test%20genesisID/gossip"
        );
        assert_eq!(
            addr_to_gossip_addr("http://r7.example.network:4166", "test genesisID").unwrap(),
            "ws://r7.example.network:4166/v1/test%20genesisID/gossip"
        );
        assert_eq!(
            addr_to_gossip_addr("https://r7.example.network:4166", "test genesisID").unwrap(),
            "wss://r7.example.network:4166/v1/test%20genesisID/gossip"
        );
        assert!(addr_to_gossip_addr("ftp://host:21", "g").is_err());
    }

    #[test]
    fn dial_targets() {
        assert_eq!(dial_target("127.0.0.1:4160").unwrap(), "127.0.0.1:4160");
        assert_eq!(
            dial_target("ws://127.0.0.1:4160/v1/g/gossip").unwrap(),
            "127.0.0.1:4160"
        );
        assert_eq!(dial_target("ws://[::1]:4160/v1/g/gossip").unwrap(), "[::1]:4160");
    }
}
