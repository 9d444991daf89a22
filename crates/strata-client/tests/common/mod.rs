//! Shared helpers for integration tests: an in-process cluster node that
//! speaks the binary protocol with scripted data-op behavior, plus
//! cluster-config JSON builders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use strata_client::wire::{Frame, FrameCodec, Opcode, Status};

/// What the scripted handler wants done with a data-op frame.
#[allow(dead_code)]
pub enum Action {
    Reply(ReplySpec),
    /// Swallow the request; the client never hears back.
    Silence,
    /// Drop the connection.
    Close,
}

pub struct ReplySpec {
    pub status: Status,
    pub value: Bytes,
    pub extras: Bytes,
    pub cas: u64,
    pub delay: Option<Duration>,
}

#[allow(dead_code)]
impl ReplySpec {
    pub fn ok_value(value: impl Into<Bytes>, cas: u64) -> Self {
        Self {
            status: Status::SUCCESS,
            value: value.into(),
            extras: Bytes::new(),
            cas,
            delay: None,
        }
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            value: Bytes::new(),
            extras: Bytes::new(),
            cas: 0,
            delay: None,
        }
    }

    pub fn status_with_value(status: Status, value: impl Into<Bytes>) -> Self {
        Self {
            status,
            value: value.into(),
            extras: Bytes::new(),
            cas: 0,
            delay: None,
        }
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub type Handler = Arc<dyn Fn(&Frame) -> Action + Send + Sync>;

#[derive(Default)]
pub struct Counters {
    by_opcode: Mutex<HashMap<u8, u64>>,
    frames: Mutex<Vec<Frame>>,
}

/// One scripted cluster node on an ephemeral port.
pub struct FakeNode {
    pub addr: SocketAddr,
    handler: Arc<Mutex<Handler>>,
    config_json: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    /// When set, connections are accepted but nothing is ever answered,
    /// so bootstrap can never complete.
    bootstrap_silent: Arc<AtomicBool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[allow(dead_code)]
impl FakeNode {
    pub async fn start() -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake node");
        let addr = listener.local_addr().expect("local addr");

        let handler: Arc<Mutex<Handler>> = Arc::new(Mutex::new(Arc::new(|_frame: &Frame| {
            Action::Reply(ReplySpec::status(Status::KEY_NOT_FOUND))
        })));
        let config_json = Arc::new(Mutex::new(None));
        let counters = Arc::new(Counters::default());
        let bootstrap_silent = Arc::new(AtomicBool::new(false));

        let accept_task = {
            let handler = handler.clone();
            let config_json = config_json.clone();
            let counters = counters.clone();
            let bootstrap_silent = bootstrap_silent.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(serve_conn(
                        socket,
                        handler.clone(),
                        config_json.clone(),
                        counters.clone(),
                        bootstrap_silent.clone(),
                    ));
                }
            })
        };

        FakeNode {
            addr,
            handler,
            config_json,
            counters,
            bootstrap_silent,
            accept_task,
        }
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_handler(&self, handler: impl Fn(&Frame) -> Action + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn set_config(&self, json: String) {
        *self.config_json.lock().unwrap() = Some(json);
    }

    pub fn set_bootstrap_silent(&self) {
        self.bootstrap_silent.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, opcode: Opcode) -> u64 {
        self.counters
            .by_opcode
            .lock()
            .unwrap()
            .get(&opcode.0)
            .copied()
            .unwrap_or(0)
    }

    pub fn frames_for(&self, opcode: Opcode) -> Vec<Frame> {
        self.counters
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.opcode == opcode)
            .cloned()
            .collect()
    }
}

async fn serve_conn(
    socket: TcpStream,
    handler: Arc<Mutex<Handler>>,
    config_json: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    bootstrap_silent: Arc<AtomicBool>,
) {
    let framed = Framed::new(socket, FrameCodec);
    let (mut sink, mut source) = framed.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
    });

    while let Some(frame) = source.next().await {
        let Ok(frame) = frame else { break };
        *counters
            .by_opcode
            .lock()
            .unwrap()
            .entry(frame.opcode.0)
            .or_insert(0) += 1;

        if bootstrap_silent.load(Ordering::SeqCst) {
            continue;
        }

        let reply = match frame.opcode {
            Opcode::HELLO => {
                // Accept everything the client advertised.
                let mut resp = Frame::response(Opcode::HELLO, Status::SUCCESS);
                resp.value = frame.value.clone();
                Some((resp, None))
            }
            Opcode::SASL_LIST_MECHS => {
                let mut resp = Frame::response(Opcode::SASL_LIST_MECHS, Status::SUCCESS);
                resp.value = Bytes::from_static(b"PLAIN");
                Some((resp, None))
            }
            Opcode::SASL_AUTH | Opcode::SASL_STEP => {
                Some((Frame::response(frame.opcode, Status::SUCCESS), None))
            }
            Opcode::SELECT_BUCKET => {
                Some((Frame::response(Opcode::SELECT_BUCKET, Status::SUCCESS), None))
            }
            Opcode::GET_ERROR_MAP => {
                let mut resp = Frame::response(Opcode::GET_ERROR_MAP, Status::SUCCESS);
                resp.value = Bytes::from_static(br#"{"version":1,"revision":1,"errors":{}}"#);
                Some((resp, None))
            }
            Opcode::GET_CLUSTER_CONFIG => {
                let config = config_json.lock().unwrap().clone();
                match config {
                    Some(json) => {
                        let mut resp =
                            Frame::response(Opcode::GET_CLUSTER_CONFIG, Status::SUCCESS);
                        resp.value = Bytes::from(json.into_bytes());
                        Some((resp, None))
                    }
                    None => Some((
                        Frame::response(Opcode::GET_CLUSTER_CONFIG, Status::TMP_FAIL),
                        None,
                    )),
                }
            }
            _ => {
                counters.frames.lock().unwrap().push(frame.clone());
                let action = {
                    let handler = handler.lock().unwrap().clone();
                    (*handler)(&frame)
                };
                match action {
                    Action::Silence => None,
                    Action::Close => break,
                    Action::Reply(spec) => {
                        let mut resp = Frame::response(frame.opcode, spec.status);
                        resp.value = spec.value;
                        resp.extras = spec.extras;
                        resp.cas = spec.cas;
                        Some((resp, spec.delay))
                    }
                }
            }
        };

        if let Some((mut resp, delay)) = reply {
            resp.opaque = frame.opaque;
            match delay {
                None => {
                    if out_tx.send(resp).await.is_err() {
                        break;
                    }
                }
                Some(delay) => {
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = out_tx.send(resp).await;
                    });
                }
            }
        }
    }
    drop(out_tx);
    let _ = writer.await;
}

/// Build a terse bucket config routing every vBucket to the endpoint
/// index chosen by `owner`.
#[allow(dead_code)]
pub fn cluster_config(
    rev: i64,
    kv_addrs: &[String],
    vbucket_count: usize,
    owner: impl Fn(usize) -> usize,
) -> String {
    let nodes: Vec<serde_json::Value> = kv_addrs
        .iter()
        .map(|addr| {
            let (host, port) = addr.rsplit_once(':').expect("host:port");
            serde_json::json!({
                "services": {"kv": port.parse::<u16>().expect("port"), "mgmt": 8091},
                "hostname": host,
            })
        })
        .collect();
    let map: Vec<Vec<i64>> = (0..vbucket_count)
        .map(|vb| vec![owner(vb) as i64])
        .collect();
    serde_json::json!({
        "rev": rev,
        "name": "default",
        "nodesExt": nodes,
        "vBucketServerMap": {
            "serverList": kv_addrs,
            "numReplicas": 0,
            "vBucketMap": map,
        },
        "bucketCapabilities": ["cccp", "collections"],
        "collectionsManifestUid": "0x1",
    })
    .to_string()
}

/// Agent config against the given fake nodes, tuned for fast tests.
#[allow(dead_code)]
pub fn test_agent_config(nodes: &[&FakeNode]) -> strata_client::AgentConfig {
    use strata_client::{AgentConfig, PasswordAuthProvider};

    let auth = Arc::new(PasswordAuthProvider::new("tester", "hunter2"));
    let mut config = AgentConfig::new(auth);
    config.kv_addrs = nodes.iter().map(|node| node.addr_string()).collect();
    config.bucket = Some("default".to_string());
    config.bootstrap_on = strata_client::BootstrapSource::Cccp;
    config.cccp_poll_period = Duration::from_millis(200);
    config.cccp_poll_floor = Duration::from_millis(20);
    config.cccp_max_wait = Duration::from_millis(1500);
    config.connect_timeout = Duration::from_secs(5);
    config.nmv_retry_delay = Duration::from_millis(50);
    config
}
