//! Binary wire protocol: frame layout, opcode/status/feature tables, and
//! the tokio-util codec that turns a socket into a stream of frames.
//!
//! A frame is a fixed 24-byte header followed by framing extras (flexible
//! magics only), extras, key, and value. Partial frames never surface
//! above the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ErrorKind, Result};

pub const HEADER_SIZE: usize = 24;

/// Hard cap on a single frame body; anything larger is treated as a
/// corrupted stream rather than an allocation request.
const MAX_BODY_SIZE: usize = 24 * 1024 * 1024;

pub mod magic {
    pub const REQUEST: u8 = 0x80;
    pub const RESPONSE: u8 = 0x81;
    /// Request with flexible framing extras.
    pub const REQUEST_FLEX: u8 = 0x08;
    /// Response with flexible framing extras.
    pub const RESPONSE_FLEX: u8 = 0x18;
    /// Server-initiated request (duplex pushes).
    pub const SERVER_REQUEST: u8 = 0x82;
}

fn magic_is_flex(m: u8) -> bool {
    m == magic::REQUEST_FLEX || m == magic::RESPONSE_FLEX
}

fn magic_is_known(m: u8) -> bool {
    matches!(
        m,
        magic::REQUEST
            | magic::RESPONSE
            | magic::REQUEST_FLEX
            | magic::RESPONSE_FLEX
            | magic::SERVER_REQUEST
    )
}

/// Command opcode. An open set on the wire, so this is a newtype with
/// named constants rather than an exhaustive enum.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const GET: Opcode = Opcode(0x00);
    pub const SET: Opcode = Opcode(0x01);
    pub const ADD: Opcode = Opcode(0x02);
    pub const REPLACE: Opcode = Opcode(0x03);
    pub const DELETE: Opcode = Opcode(0x04);
    pub const INCREMENT: Opcode = Opcode(0x05);
    pub const DECREMENT: Opcode = Opcode(0x06);
    pub const NOOP: Opcode = Opcode(0x0a);
    pub const APPEND: Opcode = Opcode(0x0e);
    pub const PREPEND: Opcode = Opcode(0x0f);
    pub const STAT: Opcode = Opcode(0x10);
    pub const TOUCH: Opcode = Opcode(0x1c);
    pub const GET_AND_TOUCH: Opcode = Opcode(0x1d);
    pub const HELLO: Opcode = Opcode(0x1f);
    pub const SASL_LIST_MECHS: Opcode = Opcode(0x20);
    pub const SASL_AUTH: Opcode = Opcode(0x21);
    pub const SASL_STEP: Opcode = Opcode(0x22);
    pub const SELECT_BUCKET: Opcode = Opcode(0x89);
    pub const GET_LOCKED: Opcode = Opcode(0x94);
    pub const UNLOCK: Opcode = Opcode(0x95);
    pub const GET_CLUSTER_CONFIG: Opcode = Opcode(0xb5);
    pub const COLLECTIONS_GET_MANIFEST: Opcode = Opcode(0xba);
    pub const COLLECTIONS_GET_CID: Opcode = Opcode(0xbb);
    pub const SUBDOC_GET: Opcode = Opcode(0xc5);
    pub const SUBDOC_EXISTS: Opcode = Opcode(0xc6);
    pub const SUBDOC_DICT_ADD: Opcode = Opcode(0xc7);
    pub const SUBDOC_DICT_SET: Opcode = Opcode(0xc8);
    pub const SUBDOC_DELETE: Opcode = Opcode(0xc9);
    pub const SUBDOC_REPLACE: Opcode = Opcode(0xca);
    pub const SUBDOC_ARRAY_PUSH_LAST: Opcode = Opcode(0xcb);
    pub const SUBDOC_ARRAY_PUSH_FIRST: Opcode = Opcode(0xcc);
    pub const SUBDOC_ARRAY_INSERT: Opcode = Opcode(0xcd);
    pub const SUBDOC_ARRAY_ADD_UNIQUE: Opcode = Opcode(0xce);
    pub const SUBDOC_COUNTER: Opcode = Opcode(0xcf);
    pub const SUBDOC_MULTI_LOOKUP: Opcode = Opcode(0xd0);
    pub const SUBDOC_MULTI_MUTATION: Opcode = Opcode(0xd1);
    pub const SUBDOC_GET_COUNT: Opcode = Opcode(0xd2);
    pub const GET_ERROR_MAP: Opcode = Opcode(0xfe);
    /// Opcode of unsolicited cluster-config pushes (server-request magic).
    pub const CLUSTERMAP_CHANGE_NOTIFICATION: Opcode = Opcode(0x01);
}

impl std::fmt::Debug for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opcode(0x{:02x})", self.0)
    }
}

/// Response status. Same newtype-with-constants shape as [`Opcode`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const KEY_NOT_FOUND: Status = Status(0x01);
    pub const KEY_EXISTS: Status = Status(0x02);
    pub const TOO_BIG: Status = Status(0x03);
    pub const INVALID_ARGS: Status = Status(0x04);
    pub const NOT_STORED: Status = Status(0x05);
    pub const BAD_DELTA: Status = Status(0x06);
    pub const NOT_MY_VBUCKET: Status = Status(0x07);
    pub const NO_BUCKET: Status = Status(0x08);
    pub const LOCKED: Status = Status(0x09);
    pub const AUTH_STALE: Status = Status(0x1f);
    pub const AUTH_ERROR: Status = Status(0x20);
    pub const AUTH_CONTINUE: Status = Status(0x21);
    pub const RANGE_ERROR: Status = Status(0x22);
    pub const ACCESS_ERROR: Status = Status(0x24);
    pub const NOT_INITIALIZED: Status = Status(0x25);
    pub const UNKNOWN_COMMAND: Status = Status(0x81);
    pub const OUT_OF_MEMORY: Status = Status(0x82);
    pub const NOT_SUPPORTED: Status = Status(0x83);
    pub const INTERNAL_ERROR: Status = Status(0x84);
    pub const BUSY: Status = Status(0x85);
    pub const TMP_FAIL: Status = Status(0x86);
    pub const UNKNOWN_COLLECTION: Status = Status(0x88);
    pub const DURABILITY_INVALID_LEVEL: Status = Status(0xa0);
    pub const DURABILITY_IMPOSSIBLE: Status = Status(0xa1);
    pub const SYNC_WRITE_IN_PROGRESS: Status = Status(0xa2);
    pub const SYNC_WRITE_AMBIGUOUS: Status = Status(0xa3);
    pub const SYNC_WRITE_RECOMMIT_IN_PROGRESS: Status = Status(0xa4);
    pub const SUBDOC_PATH_NOT_FOUND: Status = Status(0xc0);
    pub const SUBDOC_PATH_MISMATCH: Status = Status(0xc1);
    pub const SUBDOC_PATH_INVALID: Status = Status(0xc2);
    pub const SUBDOC_PATH_TOO_BIG: Status = Status(0xc3);
    pub const SUBDOC_DOC_TOO_DEEP: Status = Status(0xc4);
    pub const SUBDOC_CANNOT_INSERT: Status = Status(0xc5);
    pub const SUBDOC_DOC_NOT_JSON: Status = Status(0xc6);
    pub const SUBDOC_NUM_RANGE: Status = Status(0xc7);
    pub const SUBDOC_DELTA_RANGE: Status = Status(0xc8);
    pub const SUBDOC_PATH_EXISTS: Status = Status(0xc9);
    pub const SUBDOC_VALUE_TOO_DEEP: Status = Status(0xca);
    pub const SUBDOC_INVALID_COMBO: Status = Status(0xcb);
    pub const SUBDOC_BAD_MULTI: Status = Status(0xcc);
    pub const SUBDOC_SUCCESS_DELETED: Status = Status(0xcd);

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS || self == Status::SUBDOC_SUCCESS_DELETED
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status(0x{:04x})", self.0)
    }
}

/// HELLO feature codes.
pub mod feature {
    pub const DATATYPE: u16 = 0x01;
    pub const TCP_NODELAY: u16 = 0x03;
    pub const MUTATION_SEQNO: u16 = 0x04;
    pub const XATTR: u16 = 0x06;
    pub const XERROR: u16 = 0x07;
    pub const SELECT_BUCKET: u16 = 0x08;
    pub const SNAPPY: u16 = 0x0a;
    pub const JSON: u16 = 0x0b;
    pub const DUPLEX: u16 = 0x0c;
    pub const CLUSTERMAP_NOTIFICATION: u16 = 0x0d;
    pub const UNORDERED_EXECUTION: u16 = 0x0e;
    pub const DURATIONS: u16 = 0x0f;
    pub const ALT_REQUEST: u16 = 0x10;
    pub const SYNC_REPLICATION: u16 = 0x11;
    pub const COLLECTIONS: u16 = 0x12;
}

/// Datatype bits.
pub mod datatype {
    pub const JSON: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    pub const XATTRS: u8 = 0x04;
}

/// One complete protocol frame, request or response.
#[derive(Debug, Clone)]
pub struct Frame {
    pub magic: u8,
    pub opcode: Opcode,
    pub datatype: u8,
    /// vBucket id on requests, status code on responses.
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode) -> Self {
        Self {
            magic: magic::REQUEST,
            opcode,
            datatype: 0,
            vbucket_or_status: 0,
            opaque: 0,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn response(opcode: Opcode, status: Status) -> Self {
        let mut frame = Self::request(opcode);
        frame.magic = magic::RESPONSE;
        frame.vbucket_or_status = status.0;
        frame
    }

    pub fn status(&self) -> Status {
        Status(self.vbucket_or_status)
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn is_server_request(&self) -> bool {
        self.magic == magic::SERVER_REQUEST
    }

    pub fn total_body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Frame codec for [`tokio_util::codec::Framed`]. Stateless; the length
/// prefix lives in the fixed header.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if !frame.framing_extras.is_empty() && !magic_is_flex(frame.magic) {
            return Err(Error::new(ErrorKind::Protocol)
                .with_context("framing extras require a flexible magic"));
        }
        let body_len = frame.total_body_len();
        dst.reserve(HEADER_SIZE + body_len);
        dst.put_u8(frame.magic);
        dst.put_u8(frame.opcode.0);
        if magic_is_flex(frame.magic) {
            if frame.framing_extras.len() > u8::MAX as usize || frame.key.len() > u8::MAX as usize
            {
                return Err(Error::new(ErrorKind::Protocol)
                    .with_context("framing extras or key too long for flexible header"));
            }
            dst.put_u8(frame.framing_extras.len() as u8);
            dst.put_u8(frame.key.len() as u8);
        } else {
            if frame.key.len() > u16::MAX as usize {
                return Err(Error::new(ErrorKind::Protocol).with_context("key too long"));
            }
            dst.put_u16(frame.key.len() as u16);
        }
        if frame.extras.len() > u8::MAX as usize {
            return Err(Error::new(ErrorKind::Protocol).with_context("extras too long"));
        }
        dst.put_u8(frame.extras.len() as u8);
        dst.put_u8(frame.datatype);
        dst.put_u16(frame.vbucket_or_status);
        dst.put_u32(body_len as u32);
        dst.put_u32(frame.opaque);
        dst.put_u64(frame.cas);
        dst.put_slice(&frame.framing_extras);
        dst.put_slice(&frame.extras);
        dst.put_slice(&frame.key);
        dst.put_slice(&frame.value);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let magic = src[0];
        if !magic_is_known(magic) {
            return Err(Error::new(ErrorKind::Protocol)
                .with_context(format!("bad magic 0x{magic:02x}")));
        }

        let (framing_len, key_len) = if magic_is_flex(magic) {
            (src[2] as usize, src[3] as usize)
        } else {
            (0usize, u16::from_be_bytes([src[2], src[3]]) as usize)
        };
        let extras_len = src[4] as usize;
        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if body_len > MAX_BODY_SIZE {
            return Err(Error::new(ErrorKind::Protocol)
                .with_context(format!("frame body of {body_len} bytes exceeds cap")));
        }
        if framing_len + extras_len + key_len > body_len {
            return Err(Error::new(ErrorKind::Protocol)
                .with_context("header lengths exceed total body length"));
        }
        if src.len() < HEADER_SIZE + body_len {
            src.reserve(HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_SIZE);
        let opcode = Opcode(header[1]);
        let datatype = header[5];
        let vbucket_or_status = u16::from_be_bytes([header[6], header[7]]);
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        header.advance(16);
        let cas = header.get_u64();

        let framing_extras = src.split_to(framing_len).freeze();
        let extras = src.split_to(extras_len).freeze();
        let key = src.split_to(key_len).freeze();
        let value = src
            .split_to(body_len - framing_len - extras_len - key_len)
            .freeze();

        Ok(Some(Frame {
            magic,
            opcode,
            datatype,
            vbucket_or_status,
            opaque,
            cas,
            framing_extras,
            extras,
            key,
            value,
        }))
    }
}

/// Map a key to its vBucket: CRC32 of the key, folded to 15 bits, modulo
/// the vBucket count.
pub fn vbucket_for_key(key: &[u8], num_vbuckets: usize) -> u16 {
    debug_assert!(num_vbuckets > 0);
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize % num_vbuckets) as u16
}

/// Append an unsigned LEB128 value (collection id key prefixes).
pub fn put_uleb128(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Decode an unsigned LEB128 prefix, returning the value and its width.
pub fn take_uleb128(buf: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    for (idx, byte) in buf.iter().enumerate() {
        if idx > 4 {
            break;
        }
        value |= u32::from(byte & 0x7f) << (idx * 7);
        if byte & 0x80 == 0 {
            return Ok((value, idx + 1));
        }
    }
    Err(Error::new(ErrorKind::Protocol).with_context("unterminated leb128 prefix"))
}

/// Prefix a logical key with its collection id.
pub fn collection_key(cid: u32, key: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(key.len() + 5);
    put_uleb128(&mut out, cid);
    out.extend_from_slice(key);
    Bytes::from(out)
}

/// Encode a HELLO body from feature codes.
pub fn encode_features(features: &[u16]) -> Bytes {
    let mut out = BytesMut::with_capacity(features.len() * 2);
    for feat in features {
        out.put_u16(*feat);
    }
    out.freeze()
}

/// Decode a HELLO body into feature codes. Trailing odd bytes are a
/// protocol violation.
pub fn decode_features(body: &[u8]) -> Result<Vec<u16>> {
    if body.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::Protocol).with_context("odd HELLO body length"));
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        codec.decode(&mut buf).expect("decode").expect("complete")
    }

    #[test]
    fn header_layout_is_fixed() {
        let mut frame = Frame::request(Opcode::GET);
        frame.vbucket_or_status = 115;
        frame.opaque = 0xdeadbeef;
        frame.cas = 0x1122334455667788;
        frame.key = Bytes::from_static(b"foo");

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");

        assert_eq!(buf.len(), HEADER_SIZE + 3);
        assert_eq!(buf[0], magic::REQUEST);
        assert_eq!(buf[1], 0x00);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(buf[4], 0);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 115);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 3);
        assert_eq!(
            u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            0xdeadbeef
        );
        assert_eq!(&buf[24..], b"foo");
    }

    #[test]
    fn partial_frames_never_surface() {
        let mut frame = Frame::request(Opcode::SET);
        frame.key = Bytes::from_static(b"key");
        frame.value = Bytes::from_static(b"value");
        frame.extras = Bytes::from_static(&[0u8; 8]);

        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).expect("encode");

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 4]);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.extend_from_slice(&full[HEADER_SIZE + 4..]);
        let decoded = codec.decode(&mut partial).expect("decode").expect("full");
        assert_eq!(decoded.key.as_ref(), b"key");
        assert_eq!(decoded.value.as_ref(), b"value");
        assert_eq!(decoded.extras.len(), 8);
    }

    #[test]
    fn flexible_framing_roundtrips() {
        let mut frame = Frame::request(Opcode::SET);
        frame.magic = magic::REQUEST_FLEX;
        frame.framing_extras = Bytes::from_static(&[0x11, 0x01]);
        frame.key = Bytes::from_static(b"k");
        frame.value = Bytes::from_static(b"v");

        let decoded = roundtrip(frame);
        assert_eq!(decoded.framing_extras.as_ref(), &[0x11, 0x01]);
        assert_eq!(decoded.key.as_ref(), b"k");
        assert_eq!(decoded.value.as_ref(), b"v");
    }

    #[test]
    fn bad_magic_is_a_protocol_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x55u8; HEADER_SIZE][..]);
        let err = codec.decode(&mut buf).expect_err("bad magic");
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn inconsistent_lengths_are_a_protocol_error() {
        let mut frame = Frame::request(Opcode::GET);
        frame.key = Bytes::from_static(b"abc");
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        // Claim a body shorter than the key length.
        buf[8..12].copy_from_slice(&1u32.to_be_bytes());
        let err = codec.decode(&mut buf).expect_err("length mismatch");
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn foo_hashes_to_vbucket_115() {
        assert_eq!(vbucket_for_key(b"foo", 1024), 115);
    }

    #[test]
    fn uleb128_roundtrips() {
        for value in [0u32, 1, 42, 127, 128, 300, 0xffff, 0x0fff_ffff] {
            let mut buf = Vec::new();
            put_uleb128(&mut buf, value);
            let (decoded, width) = take_uleb128(&buf).expect("decode");
            assert_eq!(decoded, value);
            assert_eq!(width, buf.len());
        }
    }

    #[test]
    fn feature_bodies_roundtrip() {
        let feats = vec![feature::XERROR, feature::COLLECTIONS, feature::DUPLEX];
        let body = encode_features(&feats);
        assert_eq!(decode_features(&body).expect("decode"), feats);
        assert!(decode_features(&body[..3]).is_err());
    }
}
