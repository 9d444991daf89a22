//! KV multiplexer and dispatch orchestration.
//!
//! [`KvMux`] owns the endpoint pools and circuit breakers and reconciles
//! them against routing-table swaps. [`KvDispatcher`] drives a request
//! through attempts: route, breaker check, pool submit, classify the
//! outcome, consult the retry strategy, and re-drive until success, a
//! terminal failure, or the deadline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::collections::CollectionResolver;
use crate::config::{ConfigManager, ConfigSource};
use crate::connection::{host_of, ConnectionOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::ops::DurabilityLevel;
use crate::pool::{EndpointPool, PoolItem};
use crate::retry::{RetryContext, RetryReason, RetryStrategy};
use crate::routing::RoutingTable;
use crate::wire::{self, Frame, Opcode, Status};

/// One application-level KV request as the dispatcher sees it.
pub(crate) struct KvRequest {
    pub opcode: Opcode,
    pub datatype: u8,
    pub cas: u64,
    pub extras: Bytes,
    /// Logical key, before any collection-id prefix.
    pub key: Bytes,
    pub value: Bytes,
    pub collection: Option<(String, String)>,
    pub durability: Option<DurabilityLevel>,
    pub deadline: Instant,
    pub idempotent: bool,
    /// 0 routes to the primary; >0 selects a replica for read paths.
    pub replica_index: usize,
    pub strategy: Arc<dyn RetryStrategy>,
    pub cancelled: Arc<AtomicBool>,
}

/// Successful dispatch outcome plus the bookkeeping an op decoder needs.
pub(crate) struct KvResponse {
    pub frame: Frame,
    pub endpoint: String,
    pub vbucket: u16,
    pub attempts: u32,
    pub reasons: Vec<RetryReason>,
}

/// Owns pools keyed by endpoint plus their breakers, and applies routing
/// swaps under live traffic.
#[derive(Clone)]
pub(crate) struct KvMux {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    routing: watch::Receiver<Arc<RoutingTable>>,
    pools: Mutex<HashMap<String, EndpointPool>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    conn_opts: Arc<ConnectionOptions>,
    pool_size: usize,
    queue_cap: usize,
    breaker_cfg: BreakerConfig,
    shutdown: AtomicBool,
}

impl KvMux {
    pub fn new(
        routing: watch::Receiver<Arc<RoutingTable>>,
        conn_opts: Arc<ConnectionOptions>,
        pool_size: usize,
        queue_cap: usize,
        breaker_cfg: BreakerConfig,
    ) -> Self {
        let mux = Self {
            inner: Arc::new(MuxInner {
                routing,
                pools: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                conn_opts,
                pool_size,
                queue_cap,
                breaker_cfg,
                shutdown: AtomicBool::new(false),
            }),
        };
        mux.reconcile();
        mux
    }

    pub fn current_table(&self) -> Arc<RoutingTable> {
        self.inner.routing.borrow().clone()
    }

    pub fn subscribe_routing(&self) -> watch::Receiver<Arc<RoutingTable>> {
        self.inner.routing.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Bring the pool set in line with the current routing table: drain
    /// removed endpoints, keep survivors, create added ones (dialed
    /// lazily on first request).
    pub fn reconcile(&self) {
        let table = self.current_table();
        let desired: HashSet<&String> = table.kv_endpoints.iter().collect();

        let mut pools = self.inner.pools.lock().unwrap();
        let mut removed = Vec::new();
        pools.retain(|endpoint, pool| {
            if desired.contains(endpoint) {
                true
            } else {
                removed.push(pool.clone());
                false
            }
        });
        for endpoint in &table.kv_endpoints {
            pools.entry(endpoint.clone()).or_insert_with(|| {
                EndpointPool::new(
                    endpoint.clone(),
                    self.inner.conn_opts.clone(),
                    self.inner.pool_size,
                    self.inner.queue_cap,
                )
            });
        }
        drop(pools);

        if !removed.is_empty() {
            tracing::info!(
                rev = table.rev,
                removed = removed.len(),
                "routing swap removed endpoints, draining their pools"
            );
        }
        for pool in removed {
            pool.drain();
        }
        self.inner
            .breakers
            .lock()
            .unwrap()
            .retain(|endpoint, _| desired.contains(endpoint));
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let pools: Vec<EndpointPool> = {
            let mut pools = self.inner.pools.lock().unwrap();
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.drain();
        }
    }

    /// Look up (or lazily create) the pool for an endpoint. The shutdown
    /// check happens under the pools lock: `shutdown()` sets the flag
    /// before draining, so a pool can never be resurrected — and its
    /// maintenance task never respawned — after close.
    fn pool_for(&self, endpoint: &str) -> Result<EndpointPool> {
        let mut pools = self.inner.pools.lock().unwrap();
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Shutdown).with_endpoint(endpoint));
        }
        Ok(pools
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                EndpointPool::new(
                    endpoint.to_string(),
                    self.inner.conn_opts.clone(),
                    self.inner.pool_size,
                    self.inner.queue_cap,
                )
            })
            .clone())
    }

    pub fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.inner.breakers.lock().unwrap();
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.inner.breaker_cfg.clone())))
            .clone()
    }

    /// Submit a pre-built frame to an endpoint's pool and wait for its
    /// reply, bounded by `deadline`. Used by the dispatcher and by the
    /// config/collection paths that route by endpoint rather than key.
    pub async fn submit_to_endpoint(
        &self,
        endpoint: &str,
        frame: Frame,
        deadline: Instant,
        dispatched: Arc<AtomicBool>,
    ) -> Result<Frame> {
        let pool = self.pool_for(endpoint)?;
        let (tx, rx) = oneshot::channel();
        pool.submit(PoolItem {
            frame,
            tx,
            dispatched: dispatched.clone(),
            deadline,
        })
        .await;
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(ErrorKind::SocketClosed).with_endpoint(endpoint)),
            Err(_) => {
                let kind = if dispatched.load(Ordering::SeqCst) {
                    ErrorKind::AmbiguousTimeout
                } else {
                    ErrorKind::UnambiguousTimeout
                };
                Err(Error::new(kind).with_endpoint(endpoint))
            }
        }
    }
}

/// Classify an attempt failure into a retry reason, or `None` when the
/// failure is terminal.
fn classify(kind: ErrorKind, attempt_dispatched: bool) -> Option<RetryReason> {
    match kind {
        ErrorKind::DialFailed => Some(RetryReason::SocketNotAvailable),
        ErrorKind::SocketClosed | ErrorKind::ReadFailed | ErrorKind::WriteFailed => {
            if attempt_dispatched {
                Some(RetryReason::SocketCloseInFlight)
            } else {
                Some(RetryReason::SocketNotAvailable)
            }
        }
        ErrorKind::QueueFull => Some(RetryReason::PipelineOverloaded),
        ErrorKind::CircuitBreakerOpen => Some(RetryReason::CircuitBreakerOpen),
        ErrorKind::NoEndpointsAvailable => Some(RetryReason::ServiceNotAvailable),
        ErrorKind::InvalidVbucket | ErrorKind::InvalidReplica => Some(RetryReason::NotReady),
        _ => None,
    }
}

/// Map a retryable response status onto its reason.
fn status_reason(status: Status) -> Option<RetryReason> {
    match status {
        Status::NOT_MY_VBUCKET => Some(RetryReason::NotMyVbucket),
        Status::TMP_FAIL | Status::BUSY | Status::OUT_OF_MEMORY => Some(RetryReason::TmpFail),
        Status::LOCKED => Some(RetryReason::Locked),
        Status::SYNC_WRITE_IN_PROGRESS => Some(RetryReason::SyncWriteInProgress),
        Status::SYNC_WRITE_RECOMMIT_IN_PROGRESS => {
            Some(RetryReason::SyncWriteRecommitInProgress)
        }
        Status::UNKNOWN_COLLECTION => Some(RetryReason::CollectionOutdated),
        _ => None,
    }
}

/// Drives requests through the mux with retry/NMV/collection handling.
#[derive(Clone)]
pub(crate) struct KvDispatcher {
    pub mux: KvMux,
    pub resolver: Arc<CollectionResolver>,
    pub manager: Arc<ConfigManager>,
    pub nmv_retry_delay: Duration,
}

impl KvDispatcher {
    pub async fn execute(&self, req: KvRequest) -> Result<KvResponse> {
        let mut attempts: u32 = 0;
        let mut reasons: Vec<RetryReason> = Vec::new();
        let ever_dispatched = Arc::new(AtomicBool::new(false));
        let mut last_endpoint: Option<String> = None;
        let mut last_vbucket: u16 = 0;
        let mut cid: Option<u32> = None;
        let mut routing_rx = self.mux.subscribe_routing();

        loop {
            if self.mux.is_shut_down() {
                return Err(self.enrich(Error::new(ErrorKind::Shutdown), &reasons, attempts, &last_endpoint));
            }
            if req.cancelled.load(Ordering::SeqCst) {
                return Err(self.enrich(
                    Error::new(ErrorKind::RequestCanceled),
                    &reasons,
                    attempts,
                    &last_endpoint,
                ));
            }
            if Instant::now() >= req.deadline {
                return Err(self.enrich(
                    Error::new(timeout_kind(ever_dispatched.load(Ordering::SeqCst))),
                    &reasons,
                    attempts,
                    &last_endpoint,
                ));
            }

            let table = self.mux.current_table();

            // Collection resolution happens on the dispatch path so a
            // manifest change between attempts picks up the new id.
            let attempt_flag = Arc::new(AtomicBool::new(false));
            let attempt_result: Result<Frame> = match (&req.collection, cid) {
                (Some((scope, collection)), None) if table.capabilities.collections => {
                    match self.resolver.resolve(scope, collection, req.deadline).await {
                        Ok(id) => {
                            cid = Some(id);
                            continue;
                        }
                        Err(err) => Err(err),
                    }
                }
                _ => {
                    self.dispatch_once(
                        &table,
                        &req,
                        cid,
                        &attempt_flag,
                        &mut last_endpoint,
                        &mut last_vbucket,
                    )
                    .await
                }
            };
            attempts += 1;
            if attempt_flag.load(Ordering::SeqCst) {
                ever_dispatched.store(true, Ordering::SeqCst);
            }

            let (reason, failure) = match attempt_result {
                Ok(frame) => {
                    let status = frame.status();
                    match status_reason(status) {
                        None => {
                            // Success or a logical outcome; either way the
                            // op layer owns the interpretation.
                            return Ok(KvResponse {
                                frame,
                                endpoint: last_endpoint.unwrap_or_default(),
                                vbucket: last_vbucket,
                                attempts,
                                reasons,
                            });
                        }
                        Some(RetryReason::NotMyVbucket) => {
                            // Arm change detection before ingesting so the
                            // publish we trigger is observed below.
                            let _ = routing_rx.borrow_and_update();
                            if !frame.value.is_empty() {
                                if let Some(endpoint) = &last_endpoint {
                                    self.manager.ingest_raw(
                                        &frame.value,
                                        host_of(endpoint),
                                        ConfigSource::NotMyVbucket,
                                    );
                                }
                            }
                            (
                                RetryReason::NotMyVbucket,
                                Error::from_status(status)
                                    .absorb_enhanced_body(&frame.value),
                            )
                        }
                        Some(RetryReason::CollectionOutdated) => {
                            if let Some((scope, collection)) = &req.collection {
                                self.resolver.invalidate(scope, collection);
                            }
                            cid = None;
                            (RetryReason::CollectionOutdated, Error::from_status(status))
                        }
                        Some(reason) => (reason, Error::from_status(status)),
                    }
                }
                Err(mut err) => {
                    if err.kind.is_timeout() {
                        // The attempt-local view can say "never dispatched"
                        // even when an earlier attempt reached the server;
                        // the request-level flag decides the ambiguity.
                        err.kind = timeout_kind(ever_dispatched.load(Ordering::SeqCst));
                        return Err(self.enrich(err, &reasons, attempts, &last_endpoint));
                    }
                    if err.kind == ErrorKind::RequestCanceled
                        || err.kind.is_authorization()
                        || err.kind == ErrorKind::Protocol
                        || err.kind == ErrorKind::Shutdown
                    {
                        return Err(self.enrich(err, &reasons, attempts, &last_endpoint));
                    }
                    match classify(err.kind, attempt_flag.load(Ordering::SeqCst)) {
                        Some(reason) => (reason, err),
                        None => {
                            return Err(self.enrich(err, &reasons, attempts, &last_endpoint))
                        }
                    }
                }
            };

            // Consult the request's strategy.
            let ctx = RetryContext {
                attempts,
                idempotent: req.idempotent,
                reasons: &reasons,
            };
            let Some(delay) = req.strategy.retry_after(ctx, reason) else {
                let failure = failure.with_endpoint_opt(&last_endpoint);
                return Err(self.enrich(failure, &reasons, attempts, &last_endpoint));
            };
            reasons.push(reason);

            if reason == RetryReason::NotMyVbucket {
                // No backoff: the wait is the config manager's
                // reconciliation, with a floor so an empty NMV body cannot
                // spin.
                let wait_until = req
                    .deadline
                    .min(Instant::now() + self.nmv_retry_delay.max(Duration::from_millis(1)));
                tokio::select! {
                    _ = routing_rx.changed() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wait_until)) => {}
                }
            } else {
                let wake = Instant::now() + delay;
                if wake >= req.deadline {
                    return Err(self.enrich(
                        Error::new(timeout_kind(ever_dispatched.load(Ordering::SeqCst))),
                        &reasons,
                        attempts,
                        &last_endpoint,
                    ));
                }
                tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
            }
        }
    }

    async fn dispatch_once(
        &self,
        table: &RoutingTable,
        req: &KvRequest,
        cid: Option<u32>,
        attempt_dispatched: &Arc<AtomicBool>,
        last_endpoint: &mut Option<String>,
        last_vbucket: &mut u16,
    ) -> Result<Frame> {
        let encoded_key = match cid {
            Some(id) => wire::collection_key(id, &req.key),
            None => req.key.clone(),
        };

        // Route: hash the encoded key, pick the replica target.
        let (vbucket, endpoint) = if encoded_key.is_empty() {
            let endpoint = table
                .kv_endpoints
                .first()
                .ok_or_else(|| Error::new(ErrorKind::NoEndpointsAvailable))?;
            (0u16, endpoint.as_str())
        } else {
            table.endpoint_for_key(&encoded_key, req.replica_index)?
        };
        *last_vbucket = vbucket;
        *last_endpoint = Some(endpoint.to_string());

        let breaker = self.mux.breaker_for(endpoint);
        if !breaker.admit() {
            return Err(Error::new(ErrorKind::CircuitBreakerOpen).with_endpoint(endpoint));
        }

        let mut frame = Frame::request(req.opcode);
        frame.datatype = req.datatype;
        frame.cas = req.cas;
        frame.extras = req.extras.clone();
        frame.key = encoded_key;
        frame.value = req.value.clone();
        frame.vbucket_or_status = vbucket;
        if let Some(level) = req.durability {
            frame.magic = wire::magic::REQUEST_FLEX;
            frame.framing_extras = crate::ops::durability_framing(level);
        }

        let result = self
            .mux
            .submit_to_endpoint(endpoint, frame, req.deadline, attempt_dispatched.clone())
            .await;

        match &result {
            Ok(_) => breaker.record_success(),
            Err(err) => {
                if err.kind.is_timeout() || breaker.counts_as_failure(&err.kind) {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
            }
        }
        result
    }

    fn enrich(
        &self,
        mut err: Error,
        reasons: &[RetryReason],
        attempts: u32,
        last_endpoint: &Option<String>,
    ) -> Error {
        if err.endpoint.is_none() {
            if let Some(endpoint) = last_endpoint {
                err.endpoint = Some(endpoint.clone());
            }
        }
        err.with_attempts(reasons, attempts)
    }
}

fn timeout_kind(ever_dispatched: bool) -> ErrorKind {
    if ever_dispatched {
        ErrorKind::AmbiguousTimeout
    } else {
        ErrorKind::UnambiguousTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_classify_by_dispatch_state() {
        assert_eq!(
            classify(ErrorKind::SocketClosed, false),
            Some(RetryReason::SocketNotAvailable)
        );
        assert_eq!(
            classify(ErrorKind::SocketClosed, true),
            Some(RetryReason::SocketCloseInFlight)
        );
        assert_eq!(
            classify(ErrorKind::QueueFull, false),
            Some(RetryReason::PipelineOverloaded)
        );
        assert_eq!(classify(ErrorKind::AuthFailure, false), None);
    }

    #[test]
    fn retryable_statuses_map_to_reasons() {
        assert_eq!(
            status_reason(Status::NOT_MY_VBUCKET),
            Some(RetryReason::NotMyVbucket)
        );
        assert_eq!(status_reason(Status::TMP_FAIL), Some(RetryReason::TmpFail));
        assert_eq!(
            status_reason(Status::UNKNOWN_COLLECTION),
            Some(RetryReason::CollectionOutdated)
        );
        assert_eq!(status_reason(Status::SUCCESS), None);
        assert_eq!(status_reason(Status::KEY_NOT_FOUND), None);
    }
}
