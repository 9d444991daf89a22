//! Error taxonomy for the driver.
//!
//! Every error surfaced to a caller carries the endpoint last tried, the
//! retry reasons accumulated across attempts, and the attempt count, so a
//! single log line is enough to reconstruct what the dispatcher did.

use std::fmt;

use thiserror::Error;

use crate::retry::RetryReason;
use crate::wire::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds. Callers match on this instead of comparing
/// sentinel values; two errors are "the same" iff their kinds are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // Transport failures. Always retryable.
    #[error("dial failed")]
    DialFailed,
    #[error("socket closed")]
    SocketClosed,
    #[error("socket write failed")]
    WriteFailed,
    #[error("socket read failed")]
    ReadFailed,

    // Protocol violations. Never retryable; either a driver bug or a
    // corrupted stream.
    #[error("protocol violation")]
    Protocol,

    // Routing failures, retryable after a routing-table refresh.
    #[error("not my vbucket")]
    NotMyVbucket,
    #[error("collection id outdated")]
    CollectionOutdated,
    #[error("no endpoints available")]
    NoEndpointsAvailable,
    #[error("invalid vbucket")]
    InvalidVbucket,
    #[error("invalid replica")]
    InvalidReplica,

    // Congestion, retryable with backoff.
    #[error("temporary failure")]
    TmpFail,
    #[error("server busy")]
    Busy,
    #[error("dispatch queue full")]
    QueueFull,
    #[error("circuit breaker open")]
    CircuitBreakerOpen,
    #[error("service not available")]
    ServiceNotAvailable,

    // Authorization failures, fatal per endpoint.
    #[error("authentication failed")]
    AuthFailure,
    #[error("access denied")]
    AccessDenied,
    #[error("no supported SASL mechanisms")]
    NoSupportedMechanisms,

    // Deadline and lifecycle.
    #[error("unambiguous timeout")]
    UnambiguousTimeout,
    #[error("ambiguous timeout")]
    AmbiguousTimeout,
    #[error("request canceled")]
    RequestCanceled,
    #[error("agent shut down")]
    Shutdown,

    // Logical outcomes, returned verbatim to the caller.
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists")]
    KeyExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("document locked")]
    Locked,
    #[error("not stored")]
    NotStored,
    #[error("value too large")]
    ValueTooLarge,
    #[error("bad delta")]
    DeltaBadValue,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("unknown collection")]
    UnknownCollection,
    #[error("durability level invalid")]
    DurabilityInvalidLevel,
    #[error("durability impossible")]
    DurabilityImpossible,
    #[error("sync write in progress")]
    SyncWriteInProgress,
    #[error("sync write ambiguous")]
    SyncWriteAmbiguous,
    #[error("sync write re-commit in progress")]
    SyncWriteRecommitInProgress,

    // Sub-document path level outcomes.
    #[error("sub-document path not found")]
    PathNotFound,
    #[error("sub-document path mismatch")]
    PathMismatch,
    #[error("sub-document path invalid")]
    PathInvalid,
    #[error("sub-document path too big")]
    PathTooBig,
    #[error("sub-document document too deep")]
    DocTooDeep,
    #[error("sub-document cannot insert")]
    CannotInsert,
    #[error("sub-document target not json")]
    DocNotJson,
    #[error("sub-document number out of range")]
    NumberTooBig,
    #[error("sub-document delta out of range")]
    DeltaInvalid,
    #[error("sub-document path exists")]
    PathExists,
    #[error("sub-document value too deep")]
    ValueTooDeep,
    #[error("sub-document invalid flag combination")]
    InvalidFlagCombo,
    #[error("sub-document multi operation failed")]
    SubDocMultiFailure,

    // Everything else.
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
    #[error("unknown command")]
    UnknownCommand,
    #[error("internal server error")]
    InternalServerError,
    #[error("server out of memory")]
    OutOfMemory,
    #[error("unknown status code")]
    UnknownStatus,
}

impl ErrorKind {
    /// Whether the failure is a transport-level one (the op may or may not
    /// have reached the server, but the socket itself is to blame).
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            ErrorKind::DialFailed
                | ErrorKind::SocketClosed
                | ErrorKind::WriteFailed
                | ErrorKind::ReadFailed
        )
    }

    /// Whether the failure is fatal for the endpoint that produced it.
    pub fn is_authorization(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthFailure | ErrorKind::AccessDenied | ErrorKind::NoSupportedMechanisms
        )
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ErrorKind::UnambiguousTimeout | ErrorKind::AmbiguousTimeout
        )
    }
}

/// Driver error. Construction starts from a kind; dispatch layers attach
/// endpoint/attempt context as the request travels.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    /// Endpoint last tried, when the request made it to routing.
    pub endpoint: Option<String>,
    /// Raw server status, when the failure came from a response frame.
    pub status: Option<Status>,
    pub retry_reasons: Vec<RetryReason>,
    pub retry_attempts: u32,
    /// Server-provided error description (enhanced errors), if any.
    pub context: Option<String>,
    /// Server-provided reference id for log correlation, if any.
    pub error_ref: Option<String>,
    /// Index of the failing op inside a sub-document multi mutation.
    pub op_index: Option<u8>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            endpoint: None,
            status: None,
            retry_reasons: Vec::new(),
            retry_attempts: 0,
            context: None,
            error_ref: None,
            op_index: None,
        }
    }

    /// Map a wire status code onto an error kind. Statuses that are not
    /// errors (Success, SubDocSuccessDeleted) still map, for uniformity at
    /// call sites that have already excluded them.
    pub fn from_status(status: Status) -> Self {
        let kind = match status {
            Status::KEY_NOT_FOUND => ErrorKind::KeyNotFound,
            Status::KEY_EXISTS => ErrorKind::KeyExists,
            Status::TOO_BIG => ErrorKind::ValueTooLarge,
            Status::INVALID_ARGS => ErrorKind::InvalidArgument,
            Status::NOT_STORED => ErrorKind::NotStored,
            Status::BAD_DELTA => ErrorKind::DeltaBadValue,
            Status::NOT_MY_VBUCKET => ErrorKind::NotMyVbucket,
            Status::NO_BUCKET => ErrorKind::BucketNotFound,
            Status::LOCKED => ErrorKind::Locked,
            Status::AUTH_STALE | Status::AUTH_ERROR => ErrorKind::AuthFailure,
            Status::ACCESS_ERROR => ErrorKind::AccessDenied,
            Status::RANGE_ERROR => ErrorKind::InvalidArgument,
            Status::UNKNOWN_COMMAND => ErrorKind::UnknownCommand,
            Status::OUT_OF_MEMORY => ErrorKind::OutOfMemory,
            Status::NOT_SUPPORTED => ErrorKind::NotSupported,
            Status::INTERNAL_ERROR => ErrorKind::InternalServerError,
            Status::BUSY => ErrorKind::Busy,
            Status::TMP_FAIL => ErrorKind::TmpFail,
            Status::UNKNOWN_COLLECTION => ErrorKind::UnknownCollection,
            Status::DURABILITY_INVALID_LEVEL => ErrorKind::DurabilityInvalidLevel,
            Status::DURABILITY_IMPOSSIBLE => ErrorKind::DurabilityImpossible,
            Status::SYNC_WRITE_IN_PROGRESS => ErrorKind::SyncWriteInProgress,
            Status::SYNC_WRITE_AMBIGUOUS => ErrorKind::SyncWriteAmbiguous,
            Status::SYNC_WRITE_RECOMMIT_IN_PROGRESS => ErrorKind::SyncWriteRecommitInProgress,
            Status::SUBDOC_PATH_NOT_FOUND => ErrorKind::PathNotFound,
            Status::SUBDOC_PATH_MISMATCH => ErrorKind::PathMismatch,
            Status::SUBDOC_PATH_INVALID => ErrorKind::PathInvalid,
            Status::SUBDOC_PATH_TOO_BIG => ErrorKind::PathTooBig,
            Status::SUBDOC_DOC_TOO_DEEP => ErrorKind::DocTooDeep,
            Status::SUBDOC_CANNOT_INSERT => ErrorKind::CannotInsert,
            Status::SUBDOC_DOC_NOT_JSON => ErrorKind::DocNotJson,
            Status::SUBDOC_NUM_RANGE => ErrorKind::NumberTooBig,
            Status::SUBDOC_DELTA_RANGE => ErrorKind::DeltaInvalid,
            Status::SUBDOC_PATH_EXISTS => ErrorKind::PathExists,
            Status::SUBDOC_VALUE_TOO_DEEP => ErrorKind::ValueTooDeep,
            Status::SUBDOC_INVALID_COMBO => ErrorKind::InvalidFlagCombo,
            Status::SUBDOC_BAD_MULTI => ErrorKind::SubDocMultiFailure,
            _ => ErrorKind::UnknownStatus,
        };
        let mut err = Self::new(kind);
        err.status = Some(status);
        err
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_op_index(mut self, index: u8) -> Self {
        self.op_index = Some(index);
        self
    }

    pub(crate) fn with_attempts(mut self, reasons: &[RetryReason], attempts: u32) -> Self {
        self.retry_reasons = reasons.to_vec();
        self.retry_attempts = attempts;
        self
    }

    /// Attach an endpoint only when none is recorded yet.
    pub(crate) fn with_endpoint_opt(mut self, endpoint: &Option<String>) -> Self {
        if self.endpoint.is_none() {
            if let Some(endpoint) = endpoint {
                self.endpoint = Some(endpoint.clone());
            }
        }
        self
    }

    /// Parse an enhanced-error JSON value body (`{"error":{"context":...,
    /// "ref":...}}`) into the context/ref fields. Unparseable bodies are
    /// ignored.
    pub(crate) fn absorb_enhanced_body(mut self, body: &[u8]) -> Self {
        #[derive(serde::Deserialize)]
        struct Outer {
            error: Inner,
        }
        #[derive(serde::Deserialize)]
        struct Inner {
            context: Option<String>,
            #[serde(rename = "ref")]
            error_ref: Option<String>,
        }
        if let Ok(outer) = serde_json::from_slice::<Outer>(body) {
            if self.context.is_none() {
                self.context = outer.error.context;
            }
            self.error_ref = outer.error.error_ref;
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " (endpoint={endpoint}")?;
        } else {
            write!(f, " (endpoint=?")?;
        }
        write!(f, ", attempts={}", self.retry_attempts)?;
        if !self.retry_reasons.is_empty() {
            write!(f, ", reasons=[")?;
            for (idx, reason) in self.retry_reasons.iter().enumerate() {
                if idx > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", reason.description())?;
            }
            write!(f, "]")?;
        }
        if let Some(context) = &self.context {
            write!(f, ", context={context:?}")?;
        }
        if let Some(error_ref) = &self.error_ref {
            write!(f, ", ref={error_ref}")?;
        }
        if let Some(index) = self.op_index {
            write!(f, ", op_index={index}")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::ReadFailed).with_context(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_to_closed_kinds() {
        assert_eq!(
            Error::from_status(Status::KEY_NOT_FOUND).kind,
            ErrorKind::KeyNotFound
        );
        assert_eq!(
            Error::from_status(Status::NOT_MY_VBUCKET).kind,
            ErrorKind::NotMyVbucket
        );
        assert_eq!(
            Error::from_status(Status::SUBDOC_BAD_MULTI).kind,
            ErrorKind::SubDocMultiFailure
        );
        assert_eq!(
            Error::from_status(Status(0x7fff)).kind,
            ErrorKind::UnknownStatus
        );
    }

    #[test]
    fn display_carries_dispatch_context() {
        let err = Error::from_status(Status::TMP_FAIL)
            .with_endpoint("10.0.0.1:11210")
            .with_attempts(&[RetryReason::TmpFail, RetryReason::TmpFail], 2);
        let text = err.to_string();
        assert!(text.contains("temporary failure"));
        assert!(text.contains("10.0.0.1:11210"));
        assert!(text.contains("attempts=2"));
        assert!(text.contains("KV_TEMPORARY_FAILURE"));
    }

    #[test]
    fn enhanced_body_fills_context_and_ref() {
        let body = br#"{"error":{"context":"cas mismatch on replace","ref":"e1b2"}}"#;
        let err = Error::from_status(Status::KEY_EXISTS).absorb_enhanced_body(body);
        assert_eq!(err.context.as_deref(), Some("cas mismatch on replace"));
        assert_eq!(err.error_ref.as_deref(), Some("e1b2"));
    }
}
