//! Sub-document multi operations: request body encoding and response
//! decoding.
//!
//! The wire framing is asymmetric and that asymmetry is preserved here:
//! a multi *lookup* returns a result for every op even when the envelope
//! status is SUBDOC_BAD_MULTI, while a failed multi *mutation* reports
//! only the index of the first failing op (3-byte body). Successful
//! mutations list entries only for ops that produced a value.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::mux::KvResponse;
use crate::ops::{mutation_token, MutationToken};
use crate::wire::{Opcode, Status};

/// Sub-document op flags (path-level).
pub mod subdoc_flag {
    pub const MKDIR_P: u8 = 0x01;
    pub const XATTR: u8 = 0x04;
    pub const EXPAND_MACROS: u8 = 0x10;
}

/// Document-level flags for multi operations.
pub mod doc_flag {
    pub const MKDOC: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const ACCESS_DELETED: u8 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupInOpKind {
    Get,
    Exists,
    GetCount,
}

impl LookupInOpKind {
    fn opcode(self) -> Opcode {
        match self {
            LookupInOpKind::Get => Opcode::SUBDOC_GET,
            LookupInOpKind::Exists => Opcode::SUBDOC_EXISTS,
            LookupInOpKind::GetCount => Opcode::SUBDOC_GET_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateInOpKind {
    DictAdd,
    DictSet,
    Delete,
    Replace,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Counter,
}

impl MutateInOpKind {
    fn opcode(self) -> Opcode {
        match self {
            MutateInOpKind::DictAdd => Opcode::SUBDOC_DICT_ADD,
            MutateInOpKind::DictSet => Opcode::SUBDOC_DICT_SET,
            MutateInOpKind::Delete => Opcode::SUBDOC_DELETE,
            MutateInOpKind::Replace => Opcode::SUBDOC_REPLACE,
            MutateInOpKind::ArrayPushLast => Opcode::SUBDOC_ARRAY_PUSH_LAST,
            MutateInOpKind::ArrayPushFirst => Opcode::SUBDOC_ARRAY_PUSH_FIRST,
            MutateInOpKind::ArrayInsert => Opcode::SUBDOC_ARRAY_INSERT,
            MutateInOpKind::ArrayAddUnique => Opcode::SUBDOC_ARRAY_ADD_UNIQUE,
            MutateInOpKind::Counter => Opcode::SUBDOC_COUNTER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupInOp {
    pub kind: LookupInOpKind,
    pub flags: u8,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct MutateInOp {
    pub kind: MutateInOpKind,
    pub flags: u8,
    pub path: String,
    pub value: Bytes,
}

/// Outcome of one op within a multi.
#[derive(Debug, Clone)]
pub struct SubDocResult {
    pub error: Option<Error>,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct LookupInResult {
    pub cas: u64,
    pub results: Vec<SubDocResult>,
}

#[derive(Debug, Clone)]
pub struct MutateInResult {
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
    pub results: Vec<SubDocResult>,
}

/// Body for SUBDOC_MULTI_LOOKUP: per op, opcode, flags, path length,
/// path.
pub(crate) fn encode_lookup_ops(ops: &[LookupInOp]) -> Result<Bytes> {
    if ops.is_empty() || ops.len() > u8::MAX as usize {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_context("lookup_in takes between 1 and 255 ops"));
    }
    let mut body = BytesMut::new();
    for op in ops {
        let path = op.path.as_bytes();
        if path.len() > u16::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidArgument).with_context("path too long"));
        }
        body.put_u8(op.kind.opcode().0);
        body.put_u8(op.flags);
        body.put_u16(path.len() as u16);
        body.put_slice(path);
    }
    Ok(body.freeze())
}

/// Body for SUBDOC_MULTI_MUTATION: per op, opcode, flags, path length,
/// value length, path, value.
pub(crate) fn encode_mutate_ops(ops: &[MutateInOp]) -> Result<Bytes> {
    if ops.is_empty() || ops.len() > u8::MAX as usize {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_context("mutate_in takes between 1 and 255 ops"));
    }
    let mut body = BytesMut::new();
    for op in ops {
        let path = op.path.as_bytes();
        if path.len() > u16::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidArgument).with_context("path too long"));
        }
        body.put_u8(op.kind.opcode().0);
        body.put_u8(op.flags);
        body.put_u16(path.len() as u16);
        body.put_u32(op.value.len() as u32);
        body.put_slice(path);
        body.put_slice(&op.value);
    }
    Ok(body.freeze())
}

/// Decode a multi-lookup response: one (status, length, value) record per
/// op, present even when the envelope status is SUBDOC_BAD_MULTI.
pub(crate) fn decode_lookup_response(resp: KvResponse, op_count: usize) -> Result<LookupInResult> {
    let status = resp.frame.status();
    if !status.is_success() && status != Status::SUBDOC_BAD_MULTI {
        return Err(crate::ops::error_from_response(&resp));
    }

    let body = &resp.frame.value;
    let mut results = Vec::with_capacity(op_count);
    let mut pos = 0usize;
    for _ in 0..op_count {
        if pos + 6 > body.len() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_endpoint(&resp.endpoint)
                .with_context("truncated multi-lookup response"));
        }
        let op_status = Status(u16::from_be_bytes([body[pos], body[pos + 1]]));
        let value_len =
            u32::from_be_bytes([body[pos + 2], body[pos + 3], body[pos + 4], body[pos + 5]])
                as usize;
        if pos + 6 + value_len > body.len() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_endpoint(&resp.endpoint)
                .with_context("truncated multi-lookup value"));
        }
        let value = resp.frame.value.slice(pos + 6..pos + 6 + value_len);
        results.push(SubDocResult {
            error: if op_status.is_success() {
                None
            } else {
                Some(Error::from_status(op_status))
            },
            value,
        });
        pos += 6 + value_len;
    }

    Ok(LookupInResult {
        cas: resp.frame.cas,
        results,
    })
}

/// Decode a multi-mutation response. A SUBDOC_BAD_MULTI envelope carries
/// a 3-byte body naming the failing op; success carries records only for
/// ops with a value.
pub(crate) fn decode_mutate_response(resp: KvResponse, op_count: usize) -> Result<MutateInResult> {
    let status = resp.frame.status();
    if status == Status::SUBDOC_BAD_MULTI {
        let body = &resp.frame.value;
        if body.len() != 3 {
            return Err(Error::new(ErrorKind::Protocol)
                .with_endpoint(&resp.endpoint)
                .with_context("malformed multi-mutation failure body"));
        }
        let index = body[0];
        let op_status = Status(u16::from_be_bytes([body[1], body[2]]));
        return Err(Error::from_status(op_status)
            .with_endpoint(&resp.endpoint)
            .with_op_index(index)
            .with_attempts(&resp.reasons, resp.attempts));
    }
    if !status.is_success() {
        return Err(crate::ops::error_from_response(&resp));
    }

    let mut results = vec![
        SubDocResult {
            error: None,
            value: Bytes::new(),
        };
        op_count
    ];
    let body = &resp.frame.value;
    let mut pos = 0usize;
    while pos < body.len() {
        if pos + 3 > body.len() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_endpoint(&resp.endpoint)
                .with_context("truncated multi-mutation response"));
        }
        let index = body[pos] as usize;
        let op_status = Status(u16::from_be_bytes([body[pos + 1], body[pos + 2]]));
        pos += 3;
        if index >= op_count {
            return Err(Error::new(ErrorKind::Protocol)
                .with_endpoint(&resp.endpoint)
                .with_context("multi-mutation index out of range"));
        }
        if op_status.is_success() {
            if pos + 4 > body.len() {
                return Err(Error::new(ErrorKind::Protocol)
                    .with_endpoint(&resp.endpoint)
                    .with_context("truncated multi-mutation value length"));
            }
            let value_len =
                u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
                    as usize;
            pos += 4;
            if pos + value_len > body.len() {
                return Err(Error::new(ErrorKind::Protocol)
                    .with_endpoint(&resp.endpoint)
                    .with_context("truncated multi-mutation value"));
            }
            results[index].value = resp.frame.value.slice(pos..pos + value_len);
            pos += value_len;
        } else {
            results[index].error = Some(Error::from_status(op_status));
        }
    }

    Ok(MutateInResult {
        cas: resp.frame.cas,
        mutation_token: mutation_token(&resp),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Frame;

    fn response(opcode: Opcode, status: Status, value: Bytes) -> KvResponse {
        let mut frame = Frame::response(opcode, status);
        frame.value = value;
        frame.cas = 0x77;
        KvResponse {
            frame,
            endpoint: "a:11210".into(),
            vbucket: 3,
            attempts: 1,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn lookup_body_layout() {
        let ops = vec![
            LookupInOp {
                kind: LookupInOpKind::Get,
                flags: 0,
                path: "user.name".into(),
            },
            LookupInOp {
                kind: LookupInOpKind::Exists,
                flags: subdoc_flag::XATTR,
                path: "meta".into(),
            },
        ];
        let body = encode_lookup_ops(&ops).expect("encode");
        assert_eq!(body[0], Opcode::SUBDOC_GET.0);
        assert_eq!(body[1], 0);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), 9);
        assert_eq!(&body[4..13], b"user.name");
        assert_eq!(body[13], Opcode::SUBDOC_EXISTS.0);
        assert_eq!(body[14], subdoc_flag::XATTR);
    }

    #[test]
    fn mutate_body_layout() {
        let ops = vec![MutateInOp {
            kind: MutateInOpKind::DictSet,
            flags: subdoc_flag::MKDIR_P,
            path: "a.b".into(),
            value: Bytes::from_static(b"42"),
        }];
        let body = encode_mutate_ops(&ops).expect("encode");
        assert_eq!(body[0], Opcode::SUBDOC_DICT_SET.0);
        assert_eq!(body[1], subdoc_flag::MKDIR_P);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), 3);
        assert_eq!(
            u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            2
        );
        assert_eq!(&body[8..11], b"a.b");
        assert_eq!(&body[11..13], b"42");
    }

    #[test]
    fn lookup_returns_per_op_results_even_under_bad_multi() {
        // Op 0 succeeds with a value, op 1 fails with path-not-found.
        let mut body = BytesMut::new();
        body.put_u16(Status::SUCCESS.0);
        body.put_u32(5);
        body.put_slice(b"\"bob\"");
        body.put_u16(Status::SUBDOC_PATH_NOT_FOUND.0);
        body.put_u32(0);

        let resp = response(
            Opcode::SUBDOC_MULTI_LOOKUP,
            Status::SUBDOC_BAD_MULTI,
            body.freeze(),
        );
        let result = decode_lookup_response(resp, 2).expect("decode");
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].error.is_none());
        assert_eq!(result.results[0].value.as_ref(), b"\"bob\"");
        assert_eq!(
            result.results[1].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::PathNotFound)
        );
    }

    #[test]
    fn failed_mutation_reports_only_the_failing_index() {
        let mut body = BytesMut::new();
        body.put_u8(2);
        body.put_u16(Status::SUBDOC_PATH_EXISTS.0);
        let resp = response(
            Opcode::SUBDOC_MULTI_MUTATION,
            Status::SUBDOC_BAD_MULTI,
            body.freeze(),
        );
        let err = decode_mutate_response(resp, 4).expect_err("bad multi");
        assert_eq!(err.kind, ErrorKind::PathExists);
        assert_eq!(err.op_index, Some(2));
    }

    #[test]
    fn successful_mutation_lists_only_value_ops() {
        // Counter at index 1 returned "7"; the dict-set at index 0 did not
        // produce a record.
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u16(Status::SUCCESS.0);
        body.put_u32(1);
        body.put_slice(b"7");
        let resp = response(
            Opcode::SUBDOC_MULTI_MUTATION,
            Status::SUCCESS,
            body.freeze(),
        );
        let result = decode_mutate_response(resp, 2).expect("decode");
        assert!(result.results[0].error.is_none());
        assert!(result.results[0].value.is_empty());
        assert_eq!(result.results[1].value.as_ref(), b"7");
        assert_eq!(result.cas, 0x77);
    }
}
