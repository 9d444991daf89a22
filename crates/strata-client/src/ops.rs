//! Typed operation payloads: extras builders for requests and decoders
//! for responses. The dispatcher hands back raw frames; everything here
//! turns them into caller-facing results or taxonomy errors.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::mux::KvResponse;
use crate::wire::Status;

/// Synchronous-replication durability requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

impl DurabilityLevel {
    fn wire_byte(self) -> u8 {
        match self {
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistOnMaster => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

/// Flexible framing extra carrying a durability requirement:
/// type 1, length 1, then the level byte.
pub(crate) fn durability_framing(level: DurabilityLevel) -> Bytes {
    Bytes::from(vec![0x11, level.wire_byte()])
}

/// Token identifying a mutation's position in its vBucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket_id: u16,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
}

#[derive(Debug, Clone)]
pub struct MutationResult {
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
}

#[derive(Debug, Clone)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
}

/// Extras for SET/ADD/REPLACE: flags then expiry.
pub(crate) fn store_extras(flags: u32, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(flags);
    extras.put_u32(expiry);
    extras.freeze()
}

/// Extras for TOUCH / GET_AND_TOUCH / GET_LOCKED: an expiry or lock time.
pub(crate) fn expiry_extras(expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(expiry);
    extras.freeze()
}

/// Extras for INCREMENT/DECREMENT: delta, initial value, expiry.
pub(crate) fn counter_extras(delta: u64, initial: u64, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    extras.put_u64(initial);
    extras.put_u32(expiry);
    extras.freeze()
}

/// Turn an error-status response into a taxonomy error with dispatch
/// context attached.
pub(crate) fn error_from_response(resp: &KvResponse) -> Error {
    let status = resp.frame.status();
    let mut err = Error::from_status(status).with_endpoint(&resp.endpoint);
    if !resp.frame.value.is_empty() {
        err = err.absorb_enhanced_body(&resp.frame.value);
    }
    err.with_attempts(&resp.reasons, resp.attempts)
}

/// Mutation token from response extras, present when mutation seqno
/// reporting was negotiated.
pub(crate) fn mutation_token(resp: &KvResponse) -> Option<MutationToken> {
    let extras = &resp.frame.extras;
    if extras.len() < 16 {
        return None;
    }
    Some(MutationToken {
        vbucket_id: resp.vbucket,
        vbucket_uuid: u64::from_be_bytes(extras[0..8].try_into().unwrap()),
        seqno: u64::from_be_bytes(extras[8..16].try_into().unwrap()),
    })
}

pub(crate) fn decode_get(resp: KvResponse) -> Result<GetResult> {
    if !resp.frame.status().is_success() {
        return Err(error_from_response(&resp));
    }
    let flags = if resp.frame.extras.len() >= 4 {
        u32::from_be_bytes(resp.frame.extras[0..4].try_into().unwrap())
    } else {
        0
    };
    Ok(GetResult {
        flags,
        datatype: resp.frame.datatype,
        cas: resp.frame.cas,
        value: resp.frame.value,
    })
}

pub(crate) fn decode_mutation(resp: KvResponse) -> Result<MutationResult> {
    if !resp.frame.status().is_success() {
        return Err(error_from_response(&resp));
    }
    Ok(MutationResult {
        cas: resp.frame.cas,
        mutation_token: mutation_token(&resp),
    })
}

pub(crate) fn decode_counter(resp: KvResponse) -> Result<CounterResult> {
    if !resp.frame.status().is_success() {
        return Err(error_from_response(&resp));
    }
    if resp.frame.value.len() < 8 {
        return Err(Error::new(ErrorKind::Protocol)
            .with_endpoint(&resp.endpoint)
            .with_context("short counter response body"));
    }
    Ok(CounterResult {
        value: u64::from_be_bytes(resp.frame.value[0..8].try_into().unwrap()),
        cas: resp.frame.cas,
        mutation_token: mutation_token(&resp),
    })
}

/// A replace with a CAS that no longer matches comes back as KEY_EXISTS;
/// surface it as the dedicated cas-mismatch kind.
pub(crate) fn decode_cas_mutation(resp: KvResponse, cas_supplied: bool) -> Result<MutationResult> {
    if resp.frame.status() == Status::KEY_EXISTS && cas_supplied {
        let mut err = error_from_response(&resp);
        err.kind = ErrorKind::CasMismatch;
        return Err(err);
    }
    decode_mutation(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Frame, Opcode};

    fn response(status: Status) -> KvResponse {
        KvResponse {
            frame: Frame::response(Opcode::SET, status),
            endpoint: "a:11210".into(),
            vbucket: 7,
            attempts: 1,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn mutation_token_requires_negotiated_extras() {
        let mut resp = response(Status::SUCCESS);
        assert!(mutation_token(&resp).is_none());

        let mut extras = BytesMut::new();
        extras.put_u64(0xaaaa_bbbb_cccc_dddd);
        extras.put_u64(42);
        resp.frame.extras = extras.freeze();
        let token = mutation_token(&resp).expect("token");
        assert_eq!(token.vbucket_id, 7);
        assert_eq!(token.vbucket_uuid, 0xaaaa_bbbb_cccc_dddd);
        assert_eq!(token.seqno, 42);
    }

    #[test]
    fn cas_mismatch_surfaces_as_its_own_kind() {
        let err = decode_cas_mutation(response(Status::KEY_EXISTS), true)
            .expect_err("mismatch");
        assert_eq!(err.kind, ErrorKind::CasMismatch);

        let err = decode_cas_mutation(response(Status::KEY_EXISTS), false)
            .expect_err("exists");
        assert_eq!(err.kind, ErrorKind::KeyExists);
    }

    #[test]
    fn counter_value_decodes_from_body() {
        let mut resp = response(Status::SUCCESS);
        resp.frame.value = Bytes::copy_from_slice(&99u64.to_be_bytes());
        let result = decode_counter(resp).expect("counter");
        assert_eq!(result.value, 99);
    }

    #[test]
    fn durability_framing_layout() {
        let framing = durability_framing(DurabilityLevel::Majority);
        assert_eq!(framing.as_ref(), &[0x11, 0x01]);
    }
}
