//! Retry reason taxonomy and strategies.
//!
//! Every failed attempt is classified into a [`RetryReason`]; the
//! request's [`RetryStrategy`] then decides whether to re-drive it and
//! after how long. The orchestrator itself imposes no attempt cap — the
//! request deadline is the only wall-clock bound.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why an attempt failed, from the dispatcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// The contacted node is no longer authoritative for the vBucket.
    NotMyVbucket,
    /// The cached collection id no longer matches the server manifest.
    CollectionOutdated,
    /// The server returned a temporary failure or busy status.
    TmpFail,
    /// The document is locked.
    Locked,
    /// A durable write on the key is still in flight.
    SyncWriteInProgress,
    /// A durable write on the key is being re-committed.
    SyncWriteRecommitInProgress,
    /// The endpoint's circuit breaker is open.
    CircuitBreakerOpen,
    /// The routing table has no endpoints for the service.
    ServiceNotAvailable,
    /// An HTTP endpoint answered with a 5xx.
    ServiceResponseIndicated,
    /// No socket could be obtained for the endpoint.
    SocketNotAvailable,
    /// The socket died while the request was in flight.
    SocketCloseInFlight,
    /// The pool's arrival queue overflowed.
    PipelineOverloaded,
    /// The routed endpoint disappeared from the topology.
    NodeNotAvailable,
    /// The driver has no usable routing table yet.
    NotReady,
}

impl RetryReason {
    /// Whether the server guarantees the operation did not execute, so a
    /// retry is safe even for non-idempotent operations.
    pub fn always_retry(self) -> bool {
        matches!(
            self,
            RetryReason::NotMyVbucket
                | RetryReason::CollectionOutdated
                | RetryReason::CircuitBreakerOpen
                | RetryReason::SocketNotAvailable
                | RetryReason::PipelineOverloaded
                | RetryReason::NotReady
        )
    }

    /// Whether a strategy may retry a non-idempotent operation for this
    /// reason. Reasons where the op may have executed return false only
    /// when a retry could double-apply it.
    pub fn allows_non_idempotent_retry(self) -> bool {
        !matches!(self, RetryReason::SocketCloseInFlight)
    }

    pub fn description(self) -> &'static str {
        match self {
            RetryReason::NotMyVbucket => "KV_NOT_MY_VBUCKET",
            RetryReason::CollectionOutdated => "KV_COLLECTION_OUTDATED",
            RetryReason::TmpFail => "KV_TEMPORARY_FAILURE",
            RetryReason::Locked => "KV_LOCKED",
            RetryReason::SyncWriteInProgress => "KV_SYNC_WRITE_IN_PROGRESS",
            RetryReason::SyncWriteRecommitInProgress => "KV_SYNC_WRITE_RE_COMMIT_IN_PROGRESS",
            RetryReason::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            RetryReason::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            RetryReason::ServiceResponseIndicated => "SERVICE_RESPONSE_CODE_INDICATED",
            RetryReason::SocketNotAvailable => "SOCKET_NOT_AVAILABLE",
            RetryReason::SocketCloseInFlight => "SOCKET_CLOSED_WHILE_IN_FLIGHT",
            RetryReason::PipelineOverloaded => "PIPELINE_OVERLOADED",
            RetryReason::NodeNotAvailable => "NODE_NOT_AVAILABLE",
            RetryReason::NotReady => "NOT_READY",
        }
    }
}

/// Immutable view of a request handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub attempts: u32,
    pub idempotent: bool,
    pub reasons: &'a [RetryReason],
}

/// Pure retry policy: given the request so far and the latest reason,
/// either name a delay or give up.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn retry_after(&self, ctx: RetryContext<'_>, reason: RetryReason) -> Option<Duration>;
}

/// Retries whenever it is safe to, with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct BestEffortRetryStrategy {
    base: Duration,
    max: Duration,
}

impl BestEffortRetryStrategy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(500))
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, ctx: RetryContext<'_>, reason: RetryReason) -> Option<Duration> {
        if ctx.idempotent || reason.allows_non_idempotent_retry() {
            Some(self.backoff(ctx.attempts))
        } else {
            None
        }
    }
}

/// Never retries; the first failure is final.
#[derive(Debug, Clone, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _ctx: RetryContext<'_>, _reason: RetryReason) -> Option<Duration> {
        None
    }
}

/// The strategy applied when a request does not name one.
pub fn default_retry_strategy() -> Arc<dyn RetryStrategy> {
    Arc::new(BestEffortRetryStrategy::default())
}
