use crate::error::{EngineError, EngineResult, ErrorKind};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashSet;
use std::net::SocketAddr;

pub const HEADER_SIZE: usize = 20;
pub const AUTHENTICATOR_SIZE: usize = 16;
pub const MAX_PACKET_SIZE: usize = 4096;
pub const MAX_ATTR_VALUE: usize = 253;

pub const ATTR_USER_NAME: u8 = 1;
pub const ATTR_USER_PASSWORD: u8 = 2;
pub const ATTR_NAS_PORT: u8 = 5;
pub const ATTR_REPLY_MESSAGE: u8 = 18;
pub const ATTR_STATE: u8 = 24;
pub const ATTR_CLASS: u8 = 25;
pub const ATTR_SESSION_TIMEOUT: u8 = 27;
pub const ATTR_ACCT_STATUS_TYPE: u8 = 40;

/// The packet codes the engine routes on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PacketCode {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
    AccessChallenge = 11,
    StatusServer = 12,
}

impl PacketCode {
    pub fn from_u8(code: u8) -> Option<PacketCode> {
        match code {
            1 => Some(PacketCode::AccessRequest),
            2 => Some(PacketCode::AccessAccept),
            3 => Some(PacketCode::AccessReject),
            4 => Some(PacketCode::AccountingRequest),
            5 => Some(PacketCode::AccountingResponse),
            11 => Some(PacketCode::AccessChallenge),
            12 => Some(PacketCode::StatusServer),
            _ => None,
        }
    }

    /// True for codes that initiate a request, as opposed to replies.
    #[inline]
    pub fn is_request(self) -> bool {
        match self {
            PacketCode::AccessRequest | PacketCode::AccountingRequest | PacketCode::StatusServer => true,
            _ => false,
        }
    }

    /// The reply code for a request of this code, given whether policy accepted it. Fake and
    /// aged-out requests produce no reply at all, which is handled upstream.
    pub fn reply_code(self, accepted: bool) -> Option<PacketCode> {
        match (self, accepted) {
            (PacketCode::AccessRequest, true) | (PacketCode::StatusServer, true) => {
                Some(PacketCode::AccessAccept)
            }
            (PacketCode::AccessRequest, false) | (PacketCode::StatusServer, false) => {
                Some(PacketCode::AccessReject)
            }
            (PacketCode::AccountingRequest, true) => Some(PacketCode::AccountingResponse),
            _ => None,
        }
    }
}

/// Scheduling priority derived from the packet code. Lower values run sooner.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const STATUS: Priority = Priority(1);
    pub const AUTH: Priority = Priority(2);
    pub const ACCT: Priority = Priority(3);

    pub fn for_code(code: PacketCode) -> Priority {
        match code {
            PacketCode::StatusServer => Priority::STATUS,
            PacketCode::AccountingRequest => Priority::ACCT,
            _ => Priority::AUTH,
        }
    }
}

/// The decoded fixed header of a packet plus its addressing, carried alongside the raw
/// attribute bytes through the engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Envelope {
    pub code: PacketCode,
    pub id: u8,
    pub authenticator: [u8; AUTHENTICATOR_SIZE],
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// A decoded attribute value. The dictionary decides which representation an attribute type
/// uses; unknown types default to octets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    Octets(Vec<u8>),
    Text(String),
    Int(u32),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Attr {
    pub typ: u8,
    pub value: Value,
}

/// An ordered attribute list. Duplicate types are legal and preserved in wire order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AttrList {
    attrs: Vec<Attr>,
}

impl AttrList {
    pub fn new() -> AttrList {
        AttrList { attrs: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    #[inline]
    pub fn push(&mut self, typ: u8, value: Value) {
        self.attrs.push(Attr { typ, value });
    }

    /// The first attribute of the supplied type.
    #[inline]
    pub fn first(&self, typ: u8) -> Option<&Value> {
        self.attrs.iter().find(|attr| attr.typ == typ).map(|attr| &attr.value)
    }

    /// All values of the supplied type, in wire order.
    pub fn all(&self, typ: u8) -> Vec<Value> {
        self.attrs
            .iter()
            .filter(|attr| attr.typ == typ)
            .map(|attr| attr.value.clone())
            .collect()
    }

    /// Removes every attribute of the supplied type.
    pub fn remove(&mut self, typ: u8) {
        self.attrs.retain(|attr| attr.typ != typ);
    }

    /// Replaces every attribute of the supplied type with a single value.
    pub fn set(&mut self, typ: u8, value: Value) {
        self.remove(typ);
        self.push(typ, value);
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }
}

/// The dictionary seam: turns raw attribute bytes into an [`AttrList`] and back. The engine
/// treats attribute semantics as entirely the codec's business.
pub trait Codec: Send + Sync {
    fn decode(&self, data: &[u8]) -> EngineResult<AttrList>;
    fn encode(&self, attrs: &AttrList, buf: &mut [u8]) -> EngineResult<usize>;
}

/// Shared-secret verification seam. The cryptographic construction is opaque to the engine.
pub trait Verifier: Send + Sync {
    fn verify(&self, packet: &[u8], secret: &[u8]) -> bool;
}

/// Accepts every packet. The default until a real construction is plugged in.
pub struct NullVerifier;

impl Verifier for NullVerifier {
    #[inline]
    fn verify(&self, _packet: &[u8], _secret: &[u8]) -> bool {
        true
    }
}

/// The standard type/length/value codec. Attribute types registered as text or integer are
/// decoded into those representations; everything else stays octets.
pub struct TlvCodec {
    text_attrs: HashSet<u8>,
    int_attrs: HashSet<u8>,
}

impl TlvCodec {
    pub fn new() -> TlvCodec {
        let mut text_attrs = HashSet::new();
        text_attrs.insert(ATTR_USER_NAME);
        text_attrs.insert(ATTR_USER_PASSWORD);
        text_attrs.insert(ATTR_REPLY_MESSAGE);

        let mut int_attrs = HashSet::new();
        int_attrs.insert(ATTR_NAS_PORT);
        int_attrs.insert(ATTR_SESSION_TIMEOUT);
        int_attrs.insert(ATTR_ACCT_STATUS_TYPE);

        TlvCodec { text_attrs, int_attrs }
    }
}

impl Codec for TlvCodec {
    fn decode(&self, data: &[u8]) -> EngineResult<AttrList> {
        let mut attrs = AttrList::new();
        let mut cursor = 0;

        while cursor < data.len() {
            if data.len() - cursor < 2 {
                return Err(EngineError::Fatal(ErrorKind::Malformed));
            }

            let typ = data[cursor];
            let length = data[cursor + 1] as usize;

            if length < 2 || cursor + length > data.len() {
                return Err(EngineError::Fatal(ErrorKind::Malformed));
            }

            let raw = &data[cursor + 2..cursor + length];

            let value = if self.text_attrs.contains(&typ) {
                match std::str::from_utf8(raw) {
                    Ok(text) => Value::Text(text.to_string()),
                    Err(_) => Value::Octets(raw.to_vec()),
                }
            } else if self.int_attrs.contains(&typ) && raw.len() == 4 {
                Value::Int(BigEndian::read_u32(raw))
            } else {
                Value::Octets(raw.to_vec())
            };

            attrs.push(typ, value);
            cursor += length;
        }

        Ok(attrs)
    }

    fn encode(&self, attrs: &AttrList, buf: &mut [u8]) -> EngineResult<usize> {
        let mut cursor = 0;

        for attr in attrs.iter() {
            let raw: Vec<u8> = match &attr.value {
                Value::Octets(bytes) => bytes.clone(),
                Value::Text(text) => text.as_bytes().to_vec(),
                Value::Int(value) => {
                    let mut bytes = [0u8; 4];
                    BigEndian::write_u32(&mut bytes, *value);
                    bytes.to_vec()
                }
            };

            if raw.len() > MAX_ATTR_VALUE {
                return Err(EngineError::Fatal(ErrorKind::Encode));
            }

            let length = raw.len() + 2;
            if cursor + length > buf.len() {
                return Err(EngineError::Fatal(ErrorKind::Encode));
            }

            buf[cursor] = attr.typ;
            buf[cursor + 1] = length as u8;
            buf[cursor + 2..cursor + length].copy_from_slice(&raw);
            cursor += length;
        }

        Ok(cursor)
    }
}

/// Parses and sanity checks the fixed header of a datagram, returning the envelope and the
/// attribute byte region. Rejects truncated packets, length fields that disagree with the
/// datagram, and unknown codes.
pub fn parse_datagram<'a>(
    data: &'a [u8],
    src: SocketAddr,
    dst: SocketAddr,
) -> EngineResult<(Envelope, &'a [u8])> {
    if data.len() < HEADER_SIZE || data.len() > MAX_PACKET_SIZE {
        return Err(EngineError::Fatal(ErrorKind::Malformed));
    }

    let code = PacketCode::from_u8(data[0]).ok_or(EngineError::Fatal(ErrorKind::Malformed))?;
    let id = data[1];
    let length = BigEndian::read_u16(&data[2..4]) as usize;

    if length < HEADER_SIZE || length > data.len() {
        return Err(EngineError::Fatal(ErrorKind::Malformed));
    }

    let mut authenticator = [0u8; AUTHENTICATOR_SIZE];
    authenticator.copy_from_slice(&data[4..HEADER_SIZE]);

    Ok((
        Envelope {
            code,
            id,
            authenticator,
            src,
            dst,
        },
        &data[HEADER_SIZE..length],
    ))
}

/// Encodes a full packet (header plus attributes) into `buf`, returning the wire length.
pub fn encode_packet(
    code: PacketCode,
    id: u8,
    authenticator: &[u8; AUTHENTICATOR_SIZE],
    attrs: &AttrList,
    codec: &dyn Codec,
    buf: &mut [u8],
) -> EngineResult<usize> {
    if buf.len() < HEADER_SIZE {
        return Err(EngineError::Fatal(ErrorKind::Encode));
    }

    buf[0] = code as u8;
    buf[1] = id;
    buf[4..HEADER_SIZE].copy_from_slice(authenticator);

    let attr_len = {
        let (header, body) = buf.split_at_mut(HEADER_SIZE);
        let attr_len = codec.encode(attrs, body)?;
        BigEndian::write_u16(&mut header[2..4], (HEADER_SIZE + attr_len) as u16);
        attr_len
    };

    Ok(HEADER_SIZE + attr_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn sample_attrs() -> AttrList {
        let mut attrs = AttrList::new();
        attrs.push(ATTR_USER_NAME, Value::Text("alice".to_string()));
        attrs.push(ATTR_NAS_PORT, Value::Int(7));
        attrs.push(ATTR_STATE, Value::Octets(vec![1, 2, 3]));
        attrs
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let codec = TlvCodec::new();
        let attrs = sample_attrs();
        let mut buf = [0u8; MAX_PACKET_SIZE];

        let len = encode_packet(
            PacketCode::AccessRequest,
            7,
            &[0xaa; AUTHENTICATOR_SIZE],
            &attrs,
            &codec,
            &mut buf,
        )
        .unwrap();

        let (envelope, body) = parse_datagram(&buf[..len], addr(1812), addr(9000)).unwrap();

        assert_eq!(envelope.code, PacketCode::AccessRequest);
        assert_eq!(envelope.id, 7);
        assert_eq!(envelope.authenticator, [0xaa; AUTHENTICATOR_SIZE]);

        let decoded = codec.decode(body).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        let result = parse_datagram(&[1u8; 10], addr(1812), addr(9000));
        assert_eq!(result.unwrap_err(), EngineError::Fatal(ErrorKind::Malformed));
    }

    #[test]
    fn test_parse_rejects_bad_length_field() {
        let mut buf = [0u8; 32];
        buf[0] = 1;
        BigEndian::write_u16(&mut buf[2..4], 64);

        let result = parse_datagram(&buf, addr(1812), addr(9000));
        assert_eq!(result.unwrap_err(), EngineError::Fatal(ErrorKind::Malformed));
    }

    #[test]
    fn test_parse_rejects_unknown_code() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 99;
        BigEndian::write_u16(&mut buf[2..4], HEADER_SIZE as u16);

        let result = parse_datagram(&buf, addr(1812), addr(9000));
        assert_eq!(result.unwrap_err(), EngineError::Fatal(ErrorKind::Malformed));
    }

    #[test]
    fn test_decode_rejects_truncated_attr() {
        let codec = TlvCodec::new();

        // Claims 10 bytes but only 4 are present.
        let result = codec.decode(&[1, 10, 0, 0]);
        assert_eq!(result.unwrap_err(), EngineError::Fatal(ErrorKind::Malformed));
    }

    #[test]
    fn test_decode_rejects_zero_length_attr() {
        let codec = TlvCodec::new();
        let result = codec.decode(&[1, 0, 0, 0]);
        assert_eq!(result.unwrap_err(), EngineError::Fatal(ErrorKind::Malformed));
    }

    #[test]
    fn test_attr_list_ops() {
        let mut attrs = sample_attrs();

        assert_eq!(attrs.first(ATTR_USER_NAME).unwrap().as_text(), Some("alice"));
        assert_eq!(attrs.first(ATTR_NAS_PORT).unwrap().as_int(), Some(7));

        attrs.push(ATTR_USER_NAME, Value::Text("bob".to_string()));
        assert_eq!(attrs.all(ATTR_USER_NAME).len(), 2);

        attrs.set(ATTR_USER_NAME, Value::Text("carol".to_string()));
        assert_eq!(attrs.all(ATTR_USER_NAME).len(), 1);

        attrs.remove(ATTR_USER_NAME);
        assert!(attrs.first(ATTR_USER_NAME).is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::STATUS < Priority::AUTH);
        assert!(Priority::AUTH < Priority::ACCT);
        assert_eq!(Priority::for_code(PacketCode::StatusServer), Priority::STATUS);
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(PacketCode::AccessRequest.reply_code(true), Some(PacketCode::AccessAccept));
        assert_eq!(PacketCode::AccessRequest.reply_code(false), Some(PacketCode::AccessReject));
        assert_eq!(
            PacketCode::AccountingRequest.reply_code(true),
            Some(PacketCode::AccountingResponse)
        );
        assert_eq!(PacketCode::AccountingRequest.reply_code(false), None);
    }
}
