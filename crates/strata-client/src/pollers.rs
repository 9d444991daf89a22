//! Cluster-config pollers.
//!
//! Two racing sources feed the config manager: a CCCP poller over the
//! binary protocol (fast path) and an HTTP streaming poller against a
//! management endpoint (fallback, and the only path for buckets without
//! CCCP). Whichever succeeds quiets the other; the quieted source
//! revives itself when the winner goes silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::auth::AuthProvider;
use crate::config::{split_stream_records, ConfigManager, ConfigSource};
use crate::connection::host_of;
use crate::error::{Error, ErrorKind, Result};
use crate::mux::KvMux;
use crate::routing::ServiceType;
use crate::wire::{Frame, Opcode, Status};

/// Which config transports to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapSource {
    Cccp,
    Http,
    #[default]
    Both,
}

impl BootstrapSource {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "cccp" => Ok(BootstrapSource::Cccp),
            "http" => Ok(BootstrapSource::Http),
            "both" => Ok(BootstrapSource::Both),
            other => Err(Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("unknown bootstrap_on value {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PollerConfig {
    pub bootstrap_on: BootstrapSource,
    pub cccp_poll_period: Duration,
    pub cccp_max_wait: Duration,
    pub cccp_poll_floor: Duration,
    pub http_retry_delay: Duration,
    pub http_redial_period: Duration,
}

struct PollerShared {
    last_cccp: Mutex<Option<Instant>>,
    last_http: Mutex<Option<Instant>>,
    cccp_active: AtomicBool,
    http_active: AtomicBool,
}

impl PollerShared {
    fn cccp_silent_for(&self, threshold: Duration) -> bool {
        self.last_cccp
            .lock()
            .unwrap()
            .map(|at| at.elapsed() > threshold)
            .unwrap_or(true)
    }

    fn http_silent_for(&self, threshold: Duration) -> bool {
        self.last_http
            .lock()
            .unwrap()
            .map(|at| at.elapsed() > threshold)
            .unwrap_or(true)
    }
}

/// Spawn the configured pollers. The returned handles are aborted on
/// agent close.
pub(crate) fn spawn_pollers(
    cfg: PollerConfig,
    mux: KvMux,
    manager: Arc<ConfigManager>,
    client: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    bucket: Option<String>,
) -> Vec<JoinHandle<()>> {
    let shared = Arc::new(PollerShared {
        last_cccp: Mutex::new(None),
        last_http: Mutex::new(None),
        cccp_active: AtomicBool::new(cfg.bootstrap_on != BootstrapSource::Http),
        http_active: AtomicBool::new(cfg.bootstrap_on != BootstrapSource::Cccp),
    });

    let mut handles = Vec::new();
    if cfg.bootstrap_on != BootstrapSource::Http {
        handles.push(tokio::spawn(cccp_loop(
            shared.clone(),
            cfg.clone(),
            mux.clone(),
            manager.clone(),
        )));
    }
    if cfg.bootstrap_on != BootstrapSource::Cccp {
        handles.push(tokio::spawn(http_loop(
            shared, cfg, mux, manager, client, auth, bucket,
        )));
    }
    handles
}

async fn cccp_loop(
    shared: Arc<PollerShared>,
    cfg: PollerConfig,
    mux: KvMux,
    manager: Arc<ConfigManager>,
) {
    let period = cfg.cccp_poll_period.max(cfg.cccp_poll_floor);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut rotation = 0usize;

    loop {
        ticker.tick().await;
        if mux.is_shut_down() {
            return;
        }

        let table = mux.current_table();
        if table.is_bootstrapped() && !table.capabilities.cccp {
            // The bucket cannot serve configs over the binary protocol.
            shared.cccp_active.store(false, Ordering::SeqCst);
            shared.http_active.store(true, Ordering::SeqCst);
            continue;
        }

        if !shared.cccp_active.load(Ordering::SeqCst) {
            if shared.http_silent_for(cfg.http_redial_period) {
                tracing::debug!("http config source silent, reviving cccp poller");
                shared.cccp_active.store(true, Ordering::SeqCst);
            } else {
                continue;
            }
        }

        if table.kv_endpoints.is_empty() {
            shared.http_active.store(true, Ordering::SeqCst);
            continue;
        }
        let endpoint = table.kv_endpoints[rotation % table.kv_endpoints.len()].clone();
        rotation += 1;

        let deadline = Instant::now() + cfg.cccp_max_wait;
        let frame = Frame::request(Opcode::GET_CLUSTER_CONFIG);
        let dispatched = Arc::new(AtomicBool::new(false));
        match mux
            .submit_to_endpoint(&endpoint, frame, deadline, dispatched)
            .await
        {
            Ok(resp) if resp.status().is_success() && !resp.value.is_empty() => {
                *shared.last_cccp.lock().unwrap() = Some(Instant::now());
                if cfg.bootstrap_on == BootstrapSource::Both {
                    shared.http_active.store(false, Ordering::SeqCst);
                }
                manager.ingest_raw(&resp.value, host_of(&endpoint), ConfigSource::CccpPoll);
            }
            Ok(resp) => {
                if resp.status() == Status::NOT_SUPPORTED {
                    tracing::debug!(endpoint = %endpoint,
                        "node refuses get-cluster-config, falling back to http");
                    shared.cccp_active.store(false, Ordering::SeqCst);
                    shared.http_active.store(true, Ordering::SeqCst);
                } else {
                    tracing::debug!(endpoint = %endpoint, status = ?resp.status(),
                        "cccp poll rejected");
                }
            }
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "cccp poll failed");
                // Let the fallback have a go while this source struggles.
                shared.http_active.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn http_loop(
    shared: Arc<PollerShared>,
    cfg: PollerConfig,
    mux: KvMux,
    manager: Arc<ConfigManager>,
    client: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    bucket: Option<String>,
) {
    let cccp_silence = cfg.cccp_poll_period * 3 + cfg.cccp_max_wait;
    let mut rotation = 0usize;

    loop {
        if mux.is_shut_down() {
            return;
        }
        if !shared.http_active.load(Ordering::SeqCst) {
            if shared.cccp_silent_for(cccp_silence) {
                tracing::debug!("cccp config source silent, reviving http poller");
                shared.http_active.store(true, Ordering::SeqCst);
            } else {
                tokio::time::sleep(cfg.http_retry_delay).await;
                continue;
            }
        }

        let table = mux.current_table();
        let endpoints = table.mgmt_endpoints.clone();
        if endpoints.is_empty() {
            tokio::time::sleep(cfg.http_retry_delay).await;
            continue;
        }
        let endpoint = endpoints[rotation % endpoints.len()].clone();
        rotation += 1;

        if let Err(err) = stream_once(
            &shared, &cfg, &mux, &manager, &client, &auth, &bucket, &endpoint,
        )
        .await
        {
            tracing::debug!(endpoint = %endpoint, error = %err, "http config stream ended");
        }
        tokio::time::sleep(cfg.http_retry_delay).await;
    }
}

/// Hold one streaming config connection open until redial time, feeding
/// each record into the manager.
#[allow(clippy::too_many_arguments)]
async fn stream_once(
    shared: &PollerShared,
    cfg: &PollerConfig,
    mux: &KvMux,
    manager: &ConfigManager,
    client: &reqwest::Client,
    auth: &Arc<dyn AuthProvider>,
    bucket: &Option<String>,
    endpoint: &str,
) -> Result<()> {
    let path = match bucket {
        Some(bucket) => format!("/pools/default/bs/{bucket}"),
        None => "/pools/default/nodeServicesStreaming".to_string(),
    };
    let url = format!("http://{endpoint}{path}");
    let credentials = auth.credentials(ServiceType::Mgmt, endpoint).await?;

    let response = client
        .get(&url)
        .basic_auth(&credentials.username, Some(&credentials.password))
        .send()
        .await
        .map_err(|err| {
            Error::new(ErrorKind::DialFailed)
                .with_endpoint(endpoint)
                .with_context(err.to_string())
        })?;
    if !response.status().is_success() {
        return Err(Error::new(ErrorKind::ServiceNotAvailable)
            .with_endpoint(endpoint)
            .with_context(format!("config stream returned {}", response.status())));
    }

    *shared.last_http.lock().unwrap() = Some(Instant::now());
    let started = Instant::now();
    let mut response = response;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        if mux.is_shut_down() || started.elapsed() >= cfg.http_redial_period {
            return Ok(());
        }
        match response.chunk().await {
            Ok(Some(chunk)) => {
                buf.extend_from_slice(&chunk);
                for record in split_stream_records(&mut buf) {
                    if manager.ingest_raw(&record, host_of(endpoint), ConfigSource::HttpStream) {
                        *shared.last_http.lock().unwrap() = Some(Instant::now());
                        if cfg.bootstrap_on == BootstrapSource::Both {
                            shared.cccp_active.store(false, Ordering::SeqCst);
                        }
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                return Err(Error::new(ErrorKind::ReadFailed)
                    .with_endpoint(endpoint)
                    .with_context(err.to_string()))
            }
        }
    }
}
