//! One framed, multiplexed connection to a KV node.
//!
//! A connection runs a writer task (fed by an mpsc queue, so frames are
//! never interleaved) and a reader task that owns reply dispatch: every
//! response is matched to its waiter by opaque, independent of arrival
//! order. Server-initiated frames are routed to the config manager
//! instead of the opaque map.
//!
//! `connect` returns only after the bootstrap sequence (HELLO, optional
//! error map, SASL, SELECT_BUCKET) has finished, so application requests
//! can never observe a half-bootstrapped connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::Framed;

use crate::auth::{AuthProvider, SaslClientFactory, SaslMechanism};
use crate::error::{Error, ErrorKind, Result};
use crate::routing::ServiceType;
use crate::wire::{self, feature, Frame, FrameCodec, Opcode, Status};

/// Capacity of the per-connection write queue.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// A cluster config delivered outside the request/response flow.
#[derive(Debug, Clone)]
pub(crate) struct PushedConfig {
    pub raw: Bytes,
    pub origin_host: String,
}

/// Feature set agreed during HELLO.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NegotiatedFeatures {
    pub mutation_seqno: bool,
    pub xattr: bool,
    pub xerror: bool,
    pub select_bucket: bool,
    pub snappy: bool,
    pub json: bool,
    pub duplex: bool,
    pub clustermap_notification: bool,
    pub unordered_execution: bool,
    pub durations: bool,
    pub alt_request: bool,
    pub sync_replication: bool,
    pub collections: bool,
}

impl NegotiatedFeatures {
    fn from_codes(codes: &[u16]) -> Self {
        let mut features = NegotiatedFeatures::default();
        for code in codes {
            match *code {
                feature::MUTATION_SEQNO => features.mutation_seqno = true,
                feature::XATTR => features.xattr = true,
                feature::XERROR => features.xerror = true,
                feature::SELECT_BUCKET => features.select_bucket = true,
                feature::SNAPPY => features.snappy = true,
                feature::JSON => features.json = true,
                feature::DUPLEX => features.duplex = true,
                feature::CLUSTERMAP_NOTIFICATION => features.clustermap_notification = true,
                feature::UNORDERED_EXECUTION => features.unordered_execution = true,
                feature::DURATIONS => features.durations = true,
                feature::ALT_REQUEST => features.alt_request = true,
                feature::SYNC_REPLICATION => features.sync_replication = true,
                feature::COLLECTIONS => features.collections = true,
                _ => {}
            }
        }
        features
    }
}

/// Everything a connection needs to dial and bootstrap.
pub(crate) struct ConnectionOptions {
    pub bucket: Option<String>,
    pub client_id: String,
    pub auth: Arc<dyn AuthProvider>,
    pub sasl_factory: SaslClientFactory,
    pub sasl_mechanisms: Vec<SaslMechanism>,
    pub advertised_features: Vec<u16>,
    pub connect_timeout: Duration,
    pub fetch_error_map: bool,
    pub push_tx: Option<mpsc::Sender<PushedConfig>>,
}

struct Waiter {
    tx: oneshot::Sender<Result<Frame>>,
}

struct WriteOp {
    frame: Frame,
    /// Set just before the frame hits the socket; this is what turns an
    /// eventual deadline into an ambiguous timeout.
    dispatched: Option<Arc<AtomicBool>>,
}

struct Shared {
    endpoint: String,
    inflight: Mutex<HashMap<u32, Waiter>>,
    closed: AtomicBool,
    // One per I/O task; notify_one stores a permit, so neither task can
    // miss a shutdown that lands between its poll cycles.
    shutdown_read: Notify,
    shutdown_write: Notify,
}

impl Shared {
    /// Fail every outstanding waiter once and wake both I/O tasks.
    fn terminate(&self, kind: ErrorKind) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_read.notify_one();
        self.shutdown_write.notify_one();
        let waiters: Vec<Waiter> = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.drain().map(|(_, waiter)| waiter).collect()
        };
        if !waiters.is_empty() {
            tracing::debug!(
                endpoint = %self.endpoint,
                inflight = waiters.len(),
                kind = ?kind,
                "failing in-flight requests on connection teardown"
            );
        }
        for waiter in waiters {
            let _ = waiter
                .tx
                .send(Err(Error::new(kind).with_endpoint(&self.endpoint)));
        }
    }
}

pub(crate) struct Connection {
    shared: Arc<Shared>,
    write_tx: mpsc::Sender<WriteOp>,
    next_opaque: AtomicU32,
    pub features: NegotiatedFeatures,
}

impl Connection {
    /// Dial and fully bootstrap a connection. The returned connection is
    /// `ready`; any failure tears the socket down first.
    pub async fn connect(endpoint: &str, opts: &ConnectionOptions) -> Result<Connection> {
        let deadline = Instant::now() + opts.connect_timeout;
        let stream = match tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            TcpStream::connect(endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(Error::new(ErrorKind::DialFailed)
                    .with_endpoint(endpoint)
                    .with_context(err.to_string()))
            }
            Err(_) => {
                return Err(Error::new(ErrorKind::DialFailed)
                    .with_endpoint(endpoint)
                    .with_context("dial timed out"))
            }
        };
        let _ = stream.set_nodelay(true);

        let framed = Framed::new(stream, FrameCodec);
        let (sink, source) = framed.split();

        let shared = Arc::new(Shared {
            endpoint: endpoint.to_string(),
            inflight: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown_read: Notify::new(),
            shutdown_write: Notify::new(),
        });
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        tokio::spawn(write_loop(sink, write_rx, shared.clone()));
        tokio::spawn(read_loop(source, shared.clone(), opts.push_tx.clone()));

        let mut conn = Connection {
            shared,
            write_tx,
            next_opaque: AtomicU32::new(1),
            features: NegotiatedFeatures::default(),
        };

        match bootstrap(&conn, endpoint, opts, deadline).await {
            Ok(features) => {
                tracing::debug!(
                    endpoint,
                    collections = features.collections,
                    out_of_order = features.unordered_execution,
                    sync_replication = features.sync_replication,
                    mutation_seqno = features.mutation_seqno,
                    "connection bootstrapped"
                );
                conn.features = features;
                Ok(conn)
            }
            Err(err) => {
                conn.close();
                Err(err)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shared.terminate(ErrorKind::SocketClosed);
    }

    /// Enqueue a frame. The result — response frame or transport error —
    /// is always delivered through `tx`, exactly once.
    pub async fn dispatch(
        &self,
        mut frame: Frame,
        tx: oneshot::Sender<Result<Frame>>,
        dispatched: Option<Arc<AtomicBool>>,
    ) {
        if self.is_closed() {
            let _ = tx.send(Err(Error::new(ErrorKind::SocketClosed)
                .with_endpoint(&self.shared.endpoint)));
            return;
        }
        // Flexible framing (durability requirements) needs the negotiated
        // alt-request feature; sending it blind would poison the stream.
        if frame.magic == wire::magic::REQUEST_FLEX && !self.features.alt_request {
            let _ = tx.send(Err(Error::new(ErrorKind::NotSupported)
                .with_endpoint(&self.shared.endpoint)
                .with_context("server lacks flexible framing support")));
            return;
        }
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        frame.opaque = opaque;
        self.shared
            .inflight
            .lock()
            .unwrap()
            .insert(opaque, Waiter { tx });
        if self.write_tx.send(WriteOp { frame, dispatched }).await.is_err() {
            // Writer gone; pull the waiter back out and fail it unless the
            // teardown already did.
            let waiter = self.shared.inflight.lock().unwrap().remove(&opaque);
            if let Some(waiter) = waiter {
                let _ = waiter.tx.send(Err(Error::new(ErrorKind::SocketClosed)
                    .with_endpoint(&self.shared.endpoint)));
            }
        }
    }

    /// Dispatch and wait, bounded by `deadline`. Bootstrap-path helper.
    pub async fn roundtrip(&self, frame: Frame, deadline: Instant) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(frame, tx, None).await;
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(ErrorKind::SocketClosed)
                .with_endpoint(&self.shared.endpoint)),
            Err(_) => Err(Error::new(ErrorKind::AmbiguousTimeout)
                .with_endpoint(&self.shared.endpoint)),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut rx: mpsc::Receiver<WriteOp>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown_write.notified() => break,
            op = rx.recv() => {
                let Some(op) = op else { break };
                if let Some(flag) = &op.dispatched {
                    flag.store(true, Ordering::SeqCst);
                }
                if let Err(err) = sink.send(op.frame).await {
                    tracing::debug!(endpoint = %shared.endpoint, error = %err, "socket write failed");
                    shared.terminate(ErrorKind::WriteFailed);
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: SplitStream<Framed<TcpStream, FrameCodec>>,
    shared: Arc<Shared>,
    push_tx: Option<mpsc::Sender<PushedConfig>>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown_read.notified() => break,
            next = source.next() => {
                match next {
                    Some(Ok(frame)) => handle_frame(&shared, &push_tx, frame),
                    Some(Err(err)) => {
                        tracing::debug!(endpoint = %shared.endpoint, error = %err, "socket read failed");
                        shared.terminate(ErrorKind::ReadFailed);
                        break;
                    }
                    None => {
                        shared.terminate(ErrorKind::SocketClosed);
                        break;
                    }
                }
            }
        }
    }
    shared.terminate(ErrorKind::SocketClosed);
}

fn handle_frame(shared: &Shared, push_tx: &Option<mpsc::Sender<PushedConfig>>, frame: Frame) {
    if frame.is_server_request() {
        // Unsolicited pushes never enter the opaque map.
        if frame.opcode == Opcode::CLUSTERMAP_CHANGE_NOTIFICATION
            || frame.opcode == Opcode::GET_CLUSTER_CONFIG
        {
            if let Some(push_tx) = push_tx {
                let pushed = PushedConfig {
                    raw: frame.value.clone(),
                    origin_host: host_of(&shared.endpoint).to_string(),
                };
                if push_tx.try_send(pushed).is_err() {
                    tracing::debug!(endpoint = %shared.endpoint,
                        "dropping pushed config, ingest queue full");
                }
            }
        } else {
            tracing::debug!(endpoint = %shared.endpoint, opcode = ?frame.opcode,
                "ignoring unexpected server-initiated frame");
        }
        return;
    }

    let waiter = shared.inflight.lock().unwrap().remove(&frame.opaque);
    match waiter {
        Some(waiter) => {
            let _ = waiter.tx.send(Ok(frame));
        }
        None => {
            // Cancelled or already timed out; the reply is late but harmless.
            tracing::trace!(endpoint = %shared.endpoint, opaque = frame.opaque,
                "response for unknown opaque");
        }
    }
}

/// The host half of a `host:port` endpoint.
pub(crate) fn host_of(endpoint: &str) -> &str {
    endpoint
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(endpoint)
}

async fn bootstrap(
    conn: &Connection,
    endpoint: &str,
    opts: &ConnectionOptions,
    deadline: Instant,
) -> Result<NegotiatedFeatures> {
    // HELLO: advertise, record the accepted subset.
    let mut hello = Frame::request(Opcode::HELLO);
    hello.key = Bytes::from(opts.client_id.clone().into_bytes());
    hello.value = wire::encode_features(&opts.advertised_features);
    let resp = conn.roundtrip(hello, deadline).await?;
    let features = if resp.status().is_success() {
        NegotiatedFeatures::from_codes(&wire::decode_features(&resp.value)?)
    } else {
        tracing::debug!(endpoint, status = ?resp.status(), "HELLO not honored, assuming no features");
        NegotiatedFeatures::default()
    };

    // Error map: fetched for completeness of the handshake; enhanced error
    // bodies carry the per-response context the driver actually surfaces.
    if features.xerror && opts.fetch_error_map {
        let mut req = Frame::request(Opcode::GET_ERROR_MAP);
        req.value = Bytes::copy_from_slice(&1u16.to_be_bytes());
        match conn.roundtrip(req, deadline).await {
            Ok(resp) if resp.status().is_success() => {
                match serde_json::from_slice::<serde_json::Value>(&resp.value) {
                    Ok(map) => tracing::debug!(
                        endpoint,
                        entries = map.get("errors").and_then(|e| e.as_object()).map(|o| o.len()),
                        "fetched kv error map"
                    ),
                    Err(err) => tracing::debug!(endpoint, error = %err, "unparseable kv error map"),
                }
            }
            Ok(resp) => {
                tracing::debug!(endpoint, status = ?resp.status(), "error map fetch refused")
            }
            Err(err) => return Err(err),
        }
    }

    // SASL.
    let credentials = opts.auth.credentials(ServiceType::Kv, endpoint).await?;
    if !credentials.username.is_empty() {
        authenticate(conn, endpoint, opts, &credentials, deadline).await?;
    }

    // SELECT_BUCKET.
    if let Some(bucket) = &opts.bucket {
        if features.select_bucket {
            let mut req = Frame::request(Opcode::SELECT_BUCKET);
            req.key = Bytes::from(bucket.clone().into_bytes());
            let resp = conn.roundtrip(req, deadline).await?;
            match resp.status() {
                Status::SUCCESS => {}
                Status::ACCESS_ERROR | Status::AUTH_ERROR => {
                    return Err(Error::new(ErrorKind::AccessDenied)
                        .with_endpoint(endpoint)
                        .with_context(format!("select bucket {bucket:?} denied")))
                }
                Status::KEY_NOT_FOUND => {
                    return Err(Error::new(ErrorKind::BucketNotFound)
                        .with_endpoint(endpoint)
                        .with_context(format!("bucket {bucket:?} not found")))
                }
                other => return Err(Error::from_status(other).with_endpoint(endpoint)),
            }
        } else {
            tracing::debug!(endpoint, "server lacks select-bucket, skipping bucket selection");
        }
    }

    Ok(features)
}

/// Iterate the mechanism preference list, falling back when the server
/// rejects a mechanism as unsupported.
async fn authenticate(
    conn: &Connection,
    endpoint: &str,
    opts: &ConnectionOptions,
    credentials: &crate::auth::Credentials,
    deadline: Instant,
) -> Result<()> {
    // The advertised list narrows the preference order when available.
    let server_mechs = {
        let req = Frame::request(Opcode::SASL_LIST_MECHS);
        match conn.roundtrip(req, deadline).await {
            Ok(resp) if resp.status().is_success() => {
                Some(crate::auth::parse_mech_list(&resp.value))
            }
            Ok(_) | Err(_) => None,
        }
    };

    'mechanisms: for mechanism in &opts.sasl_mechanisms {
        if let Some(server) = &server_mechs {
            if !server.is_empty() && !server.contains(mechanism) {
                continue;
            }
        }
        let Some(mut client) = (*opts.sasl_factory)(*mechanism, credentials) else {
            continue;
        };

        let mut auth = Frame::request(Opcode::SASL_AUTH);
        auth.key = Bytes::copy_from_slice(mechanism.wire_name().as_bytes());
        auth.value = Bytes::from(client.initial_payload()?);
        let mut resp = conn.roundtrip(auth, deadline).await?;

        loop {
            match resp.status() {
                Status::SUCCESS => return Ok(()),
                Status::AUTH_CONTINUE => {
                    let payload = client.step(&resp.value)?.unwrap_or_default();
                    let mut step = Frame::request(Opcode::SASL_STEP);
                    step.key = Bytes::copy_from_slice(mechanism.wire_name().as_bytes());
                    step.value = Bytes::from(payload);
                    resp = conn.roundtrip(step, deadline).await?;
                }
                Status::AUTH_ERROR | Status::AUTH_STALE => {
                    return Err(Error::new(ErrorKind::AuthFailure)
                        .with_endpoint(endpoint)
                        .with_context(format!(
                            "{} authentication rejected",
                            mechanism.wire_name()
                        )))
                }
                Status::ACCESS_ERROR => {
                    return Err(Error::new(ErrorKind::AccessDenied).with_endpoint(endpoint))
                }
                Status::NOT_SUPPORTED | Status::UNKNOWN_COMMAND => {
                    tracing::debug!(endpoint, mechanism = mechanism.wire_name(),
                        "mechanism not supported, falling back");
                    continue 'mechanisms;
                }
                other => return Err(Error::from_status(other).with_endpoint(endpoint)),
            }
        }
    }

    Err(Error::new(ErrorKind::NoSupportedMechanisms).with_endpoint(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_decode_from_codes() {
        let features = NegotiatedFeatures::from_codes(&[
            feature::XERROR,
            feature::SELECT_BUCKET,
            feature::COLLECTIONS,
            0x7777,
        ]);
        assert!(features.xerror);
        assert!(features.select_bucket);
        assert!(features.collections);
        assert!(!features.snappy);
    }

    #[test]
    fn host_of_strips_port() {
        assert_eq!(host_of("10.0.0.1:11210"), "10.0.0.1");
        assert_eq!(host_of("nodename"), "nodename");
    }
}
