//! Datagram codec.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! +--------+------+----------+-----------------+----------------+
//! | id     | type | body_len | body            | signature      |
//! | 4 B    | 1 B  | 2 B      | body_len bytes  | 64 B           |
//! +--------+------+----------+-----------------+----------------+
//! ```
//!
//! The encoder always reserves the signature trailer; it stays zero for
//! kinds that are not signed. The decoder only insists on the trailer for
//! kinds whose signature is checked, and reads an all-zero trailer as "no
//! signature".

use std::fmt;

use bytes::Bytes;
use meshtree_core::{NodePayload, Sha256Hash, Signature, HASH_LEN, SIGNATURE_LEN};

use crate::error::FrameError;

/// Length of the fixed header: id, type and body length.
pub const HEADER_LEN: usize = 4 + 1 + 2;

/// Length of the reserved flags field at the start of a Hello body.
pub const HELLO_FLAGS_LEN: usize = 4;

/// Longest name a Hello can carry.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Longest body a datagram can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Opaque 4-byte correlation token. Replies echo the id of their request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DatagramId(pub [u8; 4]);

impl DatagramId {
    /// Generate a random id.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Debug for DatagramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatagramId({})", hex::encode(self.0))
    }
}

impl fmt::Display for DatagramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Datagram type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatagramKind {
    Hello = 0,
    RootRequest = 1,
    GetDatum = 2,
    HelloReply = 128,
    Root = 129,
    Datum = 130,
    NoDatum = 131,
    Error = 254,
}

impl DatagramKind {
    pub const ALL: [DatagramKind; 8] = [
        DatagramKind::Hello,
        DatagramKind::RootRequest,
        DatagramKind::GetDatum,
        DatagramKind::HelloReply,
        DatagramKind::Root,
        DatagramKind::Datum,
        DatagramKind::NoDatum,
        DatagramKind::Error,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_u8() == value)
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Reply-class kinds (type value 128 and above, `Error` excluded).
    pub const fn is_reply(self) -> bool {
        self.as_u8() >= 128 && !matches!(self, DatagramKind::Error)
    }

    /// Request-class kinds.
    pub const fn is_request(self) -> bool {
        self.as_u8() < 128
    }

    /// Whether a datagram of this kind must carry a verified signature.
    pub const fn requires_signature(self) -> bool {
        matches!(
            self,
            DatagramKind::Hello
                | DatagramKind::HelloReply
                | DatagramKind::RootRequest
                | DatagramKind::Root
        )
    }

    /// Reply kinds that answer a request of this kind. Empty for kinds
    /// that expect no reply.
    pub const fn expected_replies(self) -> &'static [DatagramKind] {
        match self {
            DatagramKind::Hello => &[DatagramKind::HelloReply],
            DatagramKind::RootRequest => &[DatagramKind::Root],
            DatagramKind::GetDatum => &[DatagramKind::Datum, DatagramKind::NoDatum],
            _ => &[],
        }
    }
}

impl fmt::Display for DatagramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Body shared by Hello and HelloReply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    /// Reserved, sent as zero.
    pub flags: [u8; HELLO_FLAGS_LEN],
    pub name: String,
}

impl HelloBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            flags: [0; HELLO_FLAGS_LEN],
            name: name.into(),
        }
    }
}

/// Typed datagram body, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Hello(HelloBody),
    HelloReply(HelloBody),
    RootRequest,
    Root(Sha256Hash),
    GetDatum(Sha256Hash),
    /// A node: its hash and its encoded payload (type byte included).
    Datum {
        hash: Sha256Hash,
        payload: Bytes,
    },
    NoDatum(Sha256Hash),
    Error(String),
}

impl Body {
    pub fn kind(&self) -> DatagramKind {
        match self {
            Body::Hello(_) => DatagramKind::Hello,
            Body::HelloReply(_) => DatagramKind::HelloReply,
            Body::RootRequest => DatagramKind::RootRequest,
            Body::Root(_) => DatagramKind::Root,
            Body::GetDatum(_) => DatagramKind::GetDatum,
            Body::Datum { .. } => DatagramKind::Datum,
            Body::NoDatum(_) => DatagramKind::NoDatum,
            Body::Error(_) => DatagramKind::Error,
        }
    }

    /// The node hash a `GetDatum`, `Datum` or `NoDatum` is about.
    pub fn node_hash(&self) -> Option<Sha256Hash> {
        match self {
            Body::GetDatum(hash) | Body::NoDatum(hash) | Body::Datum { hash, .. } => Some(*hash),
            _ => None,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        match self {
            Body::Hello(hello) | Body::HelloReply(hello) => {
                let name = hello.name.as_bytes();
                if name.len() > MAX_NAME_LEN {
                    return Err(FrameError::TooLong {
                        what: "name",
                        len: name.len(),
                        max: MAX_NAME_LEN,
                    });
                }
                buf.extend_from_slice(&hello.flags);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
            }
            Body::RootRequest => {}
            Body::Root(hash) | Body::GetDatum(hash) | Body::NoDatum(hash) => {
                buf.extend_from_slice(hash.as_bytes());
            }
            Body::Datum { hash, payload } => {
                buf.extend_from_slice(hash.as_bytes());
                buf.extend_from_slice(payload);
            }
            Body::Error(text) => buf.extend_from_slice(text.as_bytes()),
        }
        Ok(())
    }

    fn decode(kind: DatagramKind, body: &[u8]) -> Result<Self, FrameError> {
        let bad = |reason: String| FrameError::BadBody { kind, reason };
        let exact_hash = |body: &[u8]| {
            Sha256Hash::try_from(body)
                .map_err(|_| bad(format!("expected {} bytes, got {}", HASH_LEN, body.len())))
        };

        match kind {
            DatagramKind::Hello | DatagramKind::HelloReply => {
                if body.len() < HELLO_FLAGS_LEN + 1 {
                    return Err(bad(format!("{} bytes is shorter than flags + name length", body.len())));
                }
                let mut flags = [0u8; HELLO_FLAGS_LEN];
                flags.copy_from_slice(&body[..HELLO_FLAGS_LEN]);
                let name_len = body[HELLO_FLAGS_LEN] as usize;
                let start = HELLO_FLAGS_LEN + 1;
                let name = body
                    .get(start..start + name_len)
                    .ok_or_else(|| bad(format!("name length {} overruns body", name_len)))?;
                let name = String::from_utf8(name.to_vec())
                    .map_err(|e| bad(format!("name is not UTF-8: {}", e)))?;
                let hello = HelloBody { flags, name };
                Ok(if kind == DatagramKind::Hello {
                    Body::Hello(hello)
                } else {
                    Body::HelloReply(hello)
                })
            }
            DatagramKind::RootRequest => {
                if !body.is_empty() {
                    return Err(bad(format!("expected empty body, got {} bytes", body.len())));
                }
                Ok(Body::RootRequest)
            }
            DatagramKind::Root => Ok(Body::Root(exact_hash(body)?)),
            DatagramKind::GetDatum => Ok(Body::GetDatum(exact_hash(body)?)),
            DatagramKind::NoDatum => Ok(Body::NoDatum(exact_hash(body)?)),
            DatagramKind::Datum => {
                if body.len() < HASH_LEN {
                    return Err(bad(format!("{} bytes is shorter than a hash", body.len())));
                }
                let (hash, payload) = body.split_at(HASH_LEN);
                Ok(Body::Datum {
                    hash: exact_hash(hash)?,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            DatagramKind::Error => Ok(Body::Error(String::from_utf8_lossy(body).into_owned())),
        }
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub id: DatagramId,
    pub body: Body,
    /// Trailer contents; `None` if absent or all zero.
    pub signature: Option<Signature>,
}

impl Datagram {
    pub fn new(id: DatagramId, body: Body) -> Self {
        Self {
            id,
            body,
            signature: None,
        }
    }

    pub fn kind(&self) -> DatagramKind {
        self.body.kind()
    }

    /// Encode header, body and trailer. The trailer holds `signature`, or
    /// zeros when there is none.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64 + SIGNATURE_LEN);
        buf.extend_from_slice(&self.id.0);
        buf.push(self.kind().as_u8());
        buf.extend_from_slice(&[0, 0]);
        self.body.encode_into(&mut buf)?;

        let body_len = buf.len() - HEADER_LEN;
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::TooLong {
                what: "body",
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }
        buf[5..7].copy_from_slice(&(body_len as u16).to_be_bytes());

        match &self.signature {
            Some(sig) => buf.extend_from_slice(sig.as_bytes()),
            None => buf.resize(buf.len() + SIGNATURE_LEN, 0),
        }
        Ok(buf)
    }

    /// Decode a datagram. Bytes past the trailer are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(bytes)?;
        let body_end = HEADER_LEN + header.body_len;
        let needed = if header.kind.requires_signature() {
            body_end + SIGNATURE_LEN
        } else {
            body_end
        };
        if bytes.len() < needed {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                needed,
            });
        }

        let body = Body::decode(header.kind, &bytes[HEADER_LEN..body_end])?;
        let signature = bytes
            .get(body_end..body_end + SIGNATURE_LEN)
            .and_then(|raw| <[u8; SIGNATURE_LEN]>::try_from(raw).ok())
            .filter(|raw| raw.iter().any(|b| *b != 0))
            .map(Signature);

        Ok(Self {
            id: header.id,
            body,
            signature,
        })
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.kind())?;
        match &self.body {
            Body::Hello(h) | Body::HelloReply(h) => write!(f, " name={:?}", h.name),
            Body::RootRequest => Ok(()),
            Body::Root(hash) | Body::GetDatum(hash) | Body::NoDatum(hash) => {
                write!(f, " hash={}", hash.to_hex())
            }
            Body::Datum { hash, payload } => {
                write!(f, " hash={} len={}", hash.to_hex(), payload.len())?;
                if let Ok(node) = NodePayload::decode(payload) {
                    for line in node.describe().lines() {
                        write!(f, "\n    {}", line)?;
                    }
                }
                Ok(())
            }
            Body::Error(text) => write!(f, " text={:?}", text),
        }
    }
}

/// The framing fields of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: DatagramId,
    pub kind: DatagramKind,
    pub body_len: usize,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }
        let id = DatagramId([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let kind = DatagramKind::from_u8(bytes[4]).ok_or(FrameError::UnknownKind(bytes[4]))?;
        let body_len = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
        Ok(Self { id, kind, body_len })
    }

    /// Length of the region a signature covers: header and body.
    pub fn signed_len(&self) -> usize {
        HEADER_LEN + self.body_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(body: Body) {
        let dg = Datagram::new(DatagramId([1, 2, 3, 4]), body);
        let bytes = dg.encode().unwrap();
        assert_eq!(Datagram::decode(&bytes).unwrap(), dg);
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let h = Sha256Hash::hash(b"x");
        roundtrip(Body::Hello(HelloBody::new("alice")));
        roundtrip(Body::HelloReply(HelloBody::new("")));
        roundtrip(Body::RootRequest);
        roundtrip(Body::Root(h));
        roundtrip(Body::GetDatum(h));
        roundtrip(Body::Datum {
            hash: h,
            payload: Bytes::from_static(b"\x01payload"),
        });
        roundtrip(Body::NoDatum(h));
        roundtrip(Body::Error("no handshake".into()));
    }

    #[test]
    fn test_root_request_layout() {
        let bytes = Datagram::new(DatagramId([9, 9, 9, 9]), Body::RootRequest)
            .encode()
            .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + SIGNATURE_LEN);
        assert_eq!(&bytes[..HEADER_LEN], &[9, 9, 9, 9, 1, 0, 0]);
    }

    #[test]
    fn test_hello_layout() {
        let bytes = Datagram::new(DatagramId([0; 4]), Body::Hello(HelloBody::new("bob")))
            .encode()
            .unwrap();
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[5..7], &[0, 8]);
        assert_eq!(&bytes[7..11], &[0, 0, 0, 0]);
        assert_eq!(bytes[11], 3);
        assert_eq!(&bytes[12..15], b"bob");
        assert_eq!(bytes.len(), 15 + SIGNATURE_LEN);
    }

    #[test]
    fn test_signed_kind_requires_trailer() {
        let bytes = Datagram::new(DatagramId::random(), Body::Root(Sha256Hash::ZERO))
            .encode()
            .unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            Datagram::decode(truncated),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_unsigned_kind_accepts_missing_trailer() {
        let dg = Datagram::new(DatagramId::random(), Body::GetDatum(Sha256Hash::hash(b"q")));
        let bytes = dg.encode().unwrap();
        let bare = &bytes[..HEADER_LEN + HASH_LEN];
        assert_eq!(Datagram::decode(bare).unwrap(), dg);
    }

    #[test]
    fn test_short_body_rejected() {
        let mut bytes = Datagram::new(DatagramId::random(), Body::GetDatum(Sha256Hash::ZERO))
            .encode()
            .unwrap();
        // Claim a body longer than what follows.
        bytes[5..7].copy_from_slice(&1000u16.to_be_bytes());
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(FrameError::TooShort { .. })
        ));
        assert!(Datagram::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let bytes = [0, 0, 0, 0, 77, 0, 0];
        assert_eq!(Datagram::decode(&bytes), Err(FrameError::UnknownKind(77)));
    }

    #[test]
    fn test_wrong_hash_length_rejected() {
        let mut bytes = vec![0, 0, 0, 0, DatagramKind::NoDatum.as_u8(), 0, 31];
        bytes.extend_from_slice(&[0xab; 31]);
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(FrameError::BadBody { .. })
        ));
    }

    #[test]
    fn test_hello_name_overrun_rejected() {
        let mut bytes = vec![0, 0, 0, 0, 0, 0, 6, 0, 0, 0, 0, 9, b'a'];
        bytes.extend_from_slice(&[0; SIGNATURE_LEN]);
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(FrameError::BadBody { .. })
        ));
    }

    #[test]
    fn test_oversize_rejected() {
        let long_name = Body::Hello(HelloBody::new("n".repeat(MAX_NAME_LEN + 1)));
        assert!(Datagram::new(DatagramId::default(), long_name).encode().is_err());

        let huge = Body::Error("e".repeat(MAX_BODY_LEN + 1));
        assert!(Datagram::new(DatagramId::default(), huge).encode().is_err());
    }

    #[test]
    fn test_near_max_body() {
        roundtrip(Body::Error("e".repeat(MAX_BODY_LEN)));
        roundtrip(Body::Datum {
            hash: Sha256Hash::ZERO,
            payload: Bytes::from(vec![7u8; MAX_BODY_LEN - HASH_LEN]),
        });
    }

    #[test]
    fn test_largest_node_fits_one_udp_datagram() {
        use meshtree_core::{MAX_PAYLOAD_LEN, MAX_UDP_PAYLOAD};

        let datum = Datagram::new(
            DatagramId::default(),
            Body::Datum {
                hash: Sha256Hash::ZERO,
                payload: Bytes::from(vec![0u8; MAX_PAYLOAD_LEN]),
            },
        );
        assert_eq!(datum.encode().unwrap().len(), MAX_UDP_PAYLOAD);
        assert_eq!(HEADER_LEN + SIGNATURE_LEN + HASH_LEN + MAX_PAYLOAD_LEN, MAX_UDP_PAYLOAD);
    }

    #[test]
    fn test_expected_replies() {
        assert_eq!(DatagramKind::Hello.expected_replies(), &[DatagramKind::HelloReply]);
        assert!(DatagramKind::Datum.expected_replies().is_empty());
        assert!(DatagramKind::Root.is_reply());
        assert!(!DatagramKind::Error.is_reply());
        assert!(!DatagramKind::Error.is_request());
        for kind in DatagramKind::ALL {
            assert_eq!(DatagramKind::from_u8(kind.as_u8()), Some(kind));
        }
    }

    #[test]
    fn test_display_mentions_kind() {
        let dg = Datagram::new(DatagramId([0xde, 0xad, 0xbe, 0xef]), Body::RootRequest);
        assert_eq!(dg.to_string(), "[deadbeef] RootRequest");
    }

    fn arb_body() -> impl Strategy<Value = Body> {
        let hash = any::<[u8; 32]>().prop_map(Sha256Hash);
        prop_oneof![
            "[a-z]{0,40}".prop_map(|n| Body::Hello(HelloBody::new(n))),
            "[a-z]{0,40}".prop_map(|n| Body::HelloReply(HelloBody::new(n))),
            Just(Body::RootRequest),
            hash.clone().prop_map(Body::Root),
            hash.clone().prop_map(Body::GetDatum),
            hash.clone().prop_map(Body::NoDatum),
            (hash, prop::collection::vec(any::<u8>(), 0..2048))
                .prop_map(|(hash, p)| Body::Datum { hash, payload: Bytes::from(p) }),
            "[ -~]{0,200}".prop_map(Body::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(id: [u8; 4], body in arb_body(), sig in prop::option::of(any::<[u8; 32]>())) {
            let signature = sig.map(|half| {
                let mut raw = [1u8; SIGNATURE_LEN];
                raw[..32].copy_from_slice(&half);
                Signature(raw)
            });
            let dg = Datagram { id: DatagramId(id), body, signature };
            let bytes = dg.encode().unwrap();
            prop_assert_eq!(Datagram::decode(&bytes).unwrap(), dg);
        }

        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = Datagram::decode(&bytes);
        }
    }
}
