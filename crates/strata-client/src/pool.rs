//! Per-endpoint connection pool.
//!
//! Holds up to `pool_size` bootstrapped connections and a bounded arrival
//! queue for requests that show up while none is ready. A maintenance
//! task dials lazily on first demand, keeps the pool at target size, and
//! flushes or fails the queue as connections come and go.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::wire::Frame;

const STATE_ACTIVE: u8 = 0;
const STATE_DRAINING: u8 = 1;

const DIAL_BACKOFF_MIN: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(3);
/// How often the maintenance task re-checks the pool without demand.
const MAINTAIN_TICK: Duration = Duration::from_millis(250);

/// One request handed to a pool: a fully built frame plus its completion
/// channel and the flag that records whether bytes ever hit a socket.
pub(crate) struct PoolItem {
    pub frame: Frame,
    pub tx: oneshot::Sender<Result<Frame>>,
    pub dispatched: Arc<AtomicBool>,
    pub deadline: Instant,
}

#[derive(Clone)]
pub(crate) struct EndpointPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    endpoint: String,
    opts: Arc<ConnectionOptions>,
    target_size: usize,
    queue_cap: usize,
    conns: Mutex<Vec<Arc<Connection>>>,
    rr: AtomicUsize,
    queue: Mutex<VecDeque<PoolItem>>,
    state: AtomicU8,
    /// Set once any request has arrived; dialing starts only then.
    demanded: AtomicBool,
    wake: Notify,
}

impl EndpointPool {
    pub fn new(
        endpoint: String,
        opts: Arc<ConnectionOptions>,
        target_size: usize,
        queue_cap: usize,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            endpoint,
            opts,
            target_size: target_size.max(1),
            queue_cap: queue_cap.max(1),
            conns: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(STATE_ACTIVE),
            demanded: AtomicBool::new(false),
            wake: Notify::new(),
        });
        tokio::spawn(maintain(inner.clone()));
        Self { inner }
    }

    /// Submit a request. If a ready connection exists the frame goes to
    /// it round-robin; otherwise the request parks on the arrival queue.
    /// All failures are delivered through the item's completion channel.
    pub async fn submit(&self, item: PoolItem) {
        if self.inner.state.load(Ordering::SeqCst) != STATE_ACTIVE {
            let _ = item.tx.send(Err(Error::new(ErrorKind::SocketClosed)
                .with_endpoint(&self.inner.endpoint)
                .with_context("endpoint pool draining")));
            return;
        }
        self.inner.demanded.store(true, Ordering::SeqCst);

        if let Some(conn) = self.pick_ready() {
            conn.dispatch(item.frame, item.tx, Some(item.dispatched)).await;
            return;
        }

        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.len() >= self.inner.queue_cap {
                drop(queue);
                let _ = item.tx.send(Err(Error::new(ErrorKind::QueueFull)
                    .with_endpoint(&self.inner.endpoint)));
                return;
            }
            queue.push_back(item);
        }
        // A drain that raced the park above has already emptied the queue
        // once; sweep again so nothing waits out its full deadline here.
        if self.inner.state.load(Ordering::SeqCst) != STATE_ACTIVE {
            fail_queue(
                &self.inner,
                Error::new(ErrorKind::SocketClosed)
                    .with_endpoint(&self.inner.endpoint)
                    .with_context("endpoint pool draining"),
            );
            return;
        }
        self.inner.wake.notify_one();
    }

    fn pick_ready(&self) -> Option<Arc<Connection>> {
        let conns = self.inner.conns.lock().unwrap();
        let live: Vec<&Arc<Connection>> = conns.iter().filter(|c| !c.is_closed()).collect();
        if live.is_empty() {
            return None;
        }
        let idx = self.inner.rr.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live[idx].clone())
    }

    /// Take this pool out of rotation: close every connection (failing
    /// in-flight requests with a retryable error) and fail the queue.
    pub fn drain(&self) {
        if self
            .inner
            .state
            .swap(STATE_DRAINING, Ordering::SeqCst)
            == STATE_DRAINING
        {
            return;
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "draining endpoint pool");
        let conns = {
            let mut conns = self.inner.conns.lock().unwrap();
            std::mem::take(&mut *conns)
        };
        for conn in conns {
            conn.close();
        }
        fail_queue(
            &self.inner,
            Error::new(ErrorKind::SocketClosed)
                .with_endpoint(&self.inner.endpoint)
                .with_context("endpoint removed from topology"),
        );
        self.inner.wake.notify_one();
    }
}

fn fail_queue(inner: &PoolInner, err: Error) {
    let items: Vec<PoolItem> = {
        let mut queue = inner.queue.lock().unwrap();
        queue.drain(..).collect()
    };
    for item in items {
        let _ = item.tx.send(Err(err.clone()));
    }
}

/// Flush parked items onto ready connections. Stops when the queue or
/// the ready set is exhausted.
async fn flush_queue(pool: &EndpointPool) {
    loop {
        let item = {
            let mut queue = pool.inner.queue.lock().unwrap();
            match queue.pop_front() {
                Some(item) => item,
                None => return,
            }
        };
        match pool.pick_ready() {
            Some(conn) => {
                conn.dispatch(item.frame, item.tx, Some(item.dispatched)).await;
            }
            None => {
                pool.inner.queue.lock().unwrap().push_front(item);
                return;
            }
        }
    }
}

async fn maintain(inner: Arc<PoolInner>) {
    let pool = EndpointPool {
        inner: inner.clone(),
    };
    let mut backoff = DIAL_BACKOFF_MIN;
    let mut tick = tokio::time::interval(MAINTAIN_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tick.tick() => {}
        }
        if inner.state.load(Ordering::SeqCst) != STATE_ACTIVE {
            fail_queue(
                &inner,
                Error::new(ErrorKind::SocketClosed)
                    .with_endpoint(&inner.endpoint)
                    .with_context("endpoint pool draining"),
            );
            return;
        }

        // Drop dead connections and expired queue entries.
        inner.conns.lock().unwrap().retain(|conn| !conn.is_closed());
        prune_expired(&inner);

        flush_queue(&pool).await;

        if !inner.demanded.load(Ordering::SeqCst) {
            continue;
        }

        loop {
            let live = inner.conns.lock().unwrap().len();
            if live >= inner.target_size {
                backoff = DIAL_BACKOFF_MIN;
                break;
            }
            match Connection::connect(&inner.endpoint, &inner.opts).await {
                Ok(conn) => {
                    tracing::debug!(endpoint = %inner.endpoint, "connection ready");
                    inner.conns.lock().unwrap().push(Arc::new(conn));
                    backoff = DIAL_BACKOFF_MIN;
                    flush_queue(&pool).await;
                }
                Err(err) => {
                    tracing::debug!(endpoint = %inner.endpoint, error = %err, "dial failed");
                    // Parked requests inherit the bootstrap failure; the
                    // orchestrator decides whether to re-drive them.
                    fail_queue(&inner, err);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
                    break;
                }
            }
        }
    }
}

/// Drop queue entries whose deadline has already passed. Their waiters
/// timed out on their own side; this just keeps the queue from pinning
/// memory. Dropping the sender is enough to close the channel.
fn prune_expired(inner: &PoolInner) {
    let now = Instant::now();
    let mut queue = inner.queue.lock().unwrap();
    let items: Vec<PoolItem> = queue.drain(..).collect();
    for item in items {
        if item.deadline > now {
            queue.push_back(item);
        }
    }
}
