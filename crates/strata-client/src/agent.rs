//! Agent façade: configuration, component wiring, and the typed
//! operation surface.
//!
//! The agent owns every component. Wiring is explicit — channels and
//! watch subscriptions registered at construction — so nothing holds a
//! back-pointer. Operations come in two completion forms over the same
//! dispatch primitive: async methods, and `*_with` callback variants
//! whose callback runs on a driver task, never the submitter's.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::{default_sasl_factory, AuthProvider, SaslClientFactory, SaslMechanism};
use crate::breaker::BreakerConfig;
use crate::collections::CollectionResolver;
use crate::config::{ConfigManager, ConfigSource, NetworkType};
use crate::connection::{ConnectionOptions, PushedConfig};
use crate::connstr::{self, parse_bool, parse_millis, parse_usize};
use crate::error::{Error, ErrorKind, Result};
use crate::http::{HttpDispatcher, HttpRequest, HttpResponse};
use crate::mux::{KvDispatcher, KvMux, KvRequest};
use crate::ops::{
    self, CounterResult, DurabilityLevel, GetResult, MutationResult,
};
use crate::pollers::{spawn_pollers, BootstrapSource, PollerConfig};
use crate::retry::RetryStrategy;
use crate::routing::RoutingTable;
use crate::subdoc::{
    self, LookupInOp, LookupInResult, MutateInOp, MutateInResult,
};
use crate::wire::{feature, Opcode};

/// Default per-operation deadline used by the option constructors.
pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);

/// Scope + collection naming a keyspace within the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub scope: String,
    pub collection: String,
}

impl CollectionSpec {
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

/// Cooperative cancellation for one request. Cancelling drops the
/// request at its next dispatch point; a frame already on the wire
/// cannot be recalled, but its completion is delivered exactly once.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

fn cancel_flag(cancel: &Option<CancelHandle>) -> Arc<AtomicBool> {
    cancel
        .as_ref()
        .map(|handle| handle.flag())
        .unwrap_or_default()
}

/// Agent construction options. `from_connstr` fills one from a
/// connection string; every field can also be set directly.
#[derive(Clone)]
pub struct AgentConfig {
    pub kv_addrs: Vec<String>,
    pub http_addrs: Vec<String>,
    pub bucket: Option<String>,
    pub auth: Arc<dyn AuthProvider>,
    pub network: NetworkType,
    pub bootstrap_on: BootstrapSource,

    pub fetch_mutation_tokens: bool,
    pub use_kv_error_maps: bool,
    pub use_enhanced_errors: bool,
    pub use_compression: bool,
    pub compression_min_size: usize,
    pub compression_min_ratio: f64,
    pub use_server_durations: bool,
    pub use_collections: bool,
    pub use_out_of_order: bool,

    pub kv_pool_size: usize,
    pub max_queue_size: usize,

    pub connect_timeout: Duration,
    pub config_total_timeout: Duration,
    pub cccp_poll_period: Duration,
    pub cccp_max_wait: Duration,
    pub cccp_poll_floor: Duration,
    pub http_retry_delay: Duration,
    pub http_redial_period: Duration,
    pub http_max_idle_conns: usize,
    pub http_max_idle_conns_per_host: usize,
    pub http_idle_conn_timeout: Duration,
    pub nmv_retry_delay: Duration,

    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,

    pub breaker: BreakerConfig,
    pub retry_strategy: Arc<dyn RetryStrategy>,
    pub sasl_mechanisms: Vec<SaslMechanism>,
    pub sasl_factory: SaslClientFactory,
}

impl AgentConfig {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            kv_addrs: Vec::new(),
            http_addrs: Vec::new(),
            bucket: None,
            auth,
            network: NetworkType::Default,
            bootstrap_on: BootstrapSource::Both,
            fetch_mutation_tokens: true,
            use_kv_error_maps: true,
            use_enhanced_errors: true,
            use_compression: false,
            compression_min_size: 32,
            compression_min_ratio: 0.83,
            use_server_durations: true,
            use_collections: true,
            use_out_of_order: true,
            kv_pool_size: 1,
            max_queue_size: 2048,
            connect_timeout: Duration::from_secs(7),
            config_total_timeout: Duration::from_secs(20),
            cccp_poll_period: Duration::from_millis(2500),
            cccp_max_wait: Duration::from_secs(3),
            cccp_poll_floor: Duration::from_millis(50),
            http_retry_delay: Duration::from_secs(10),
            http_redial_period: Duration::from_secs(10),
            http_max_idle_conns: 128,
            http_max_idle_conns_per_host: 16,
            http_idle_conn_timeout: Duration::from_secs(90),
            nmv_retry_delay: Duration::from_millis(100),
            ca_cert_path: None,
            cert_path: None,
            key_path: None,
            breaker: BreakerConfig::default(),
            retry_strategy: crate::retry::default_retry_strategy(),
            sasl_mechanisms: vec![SaslMechanism::Plain],
            sasl_factory: default_sasl_factory(),
        }
    }

    /// Parse a connection string into a config. Options apply in source
    /// order, so a later duplicate overrides an earlier one; unknown
    /// option names are logged and skipped.
    pub fn from_connstr(raw: &str, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let spec = connstr::parse(raw)?;
        let mut config = AgentConfig::new(auth);
        config.kv_addrs = spec.kv_addrs();
        config.http_addrs = spec
            .hosts
            .iter()
            .map(|(host, _)| format!("{host}:{}", connstr::DEFAULT_HTTP_PORT))
            .collect();

        for (name, value) in &spec.options {
            match name.as_str() {
                "bootstrap_on" => config.bootstrap_on = BootstrapSource::parse(value)?,
                "network" => config.network = NetworkType::parse(value)?,
                "cacertpath" => config.ca_cert_path = Some(PathBuf::from(value)),
                "certpath" => config.cert_path = Some(PathBuf::from(value)),
                "keypath" => config.key_path = Some(PathBuf::from(value)),
                "config_total_timeout" => {
                    config.config_total_timeout = parse_millis(name, value)?
                }
                "config_node_timeout" => config.connect_timeout = parse_millis(name, value)?,
                "config_poll_interval" => config.cccp_poll_period = parse_millis(name, value)?,
                "config_poll_floor_interval" => {
                    config.cccp_poll_floor = parse_millis(name, value)?
                }
                "http_redial_period" => config.http_redial_period = parse_millis(name, value)?,
                "http_retry_delay" => config.http_retry_delay = parse_millis(name, value)?,
                "kv_pool_size" => config.kv_pool_size = parse_usize(name, value)?,
                "max_queue_size" => config.max_queue_size = parse_usize(name, value)?,
                "use_kverrmaps" => config.use_kv_error_maps = parse_bool(name, value)?,
                "use_enhanced_errors" => config.use_enhanced_errors = parse_bool(name, value)?,
                "fetch_mutation_tokens" => {
                    config.fetch_mutation_tokens = parse_bool(name, value)?
                }
                "compression" => config.use_compression = parse_bool(name, value)?,
                "compression_min_size" => {
                    config.compression_min_size = parse_usize(name, value)?
                }
                "compression_min_ratio" => {
                    config.compression_min_ratio = value.parse().map_err(|_| {
                        Error::new(ErrorKind::InvalidArgument)
                            .with_context(format!("option {name} expects a float, got {value:?}"))
                    })?
                }
                "server_duration" => config.use_server_durations = parse_bool(name, value)?,
                "http_max_idle_conns" => config.http_max_idle_conns = parse_usize(name, value)?,
                "http_max_idle_conns_per_host" => {
                    config.http_max_idle_conns_per_host = parse_usize(name, value)?
                }
                "http_idle_conn_timeout" => {
                    config.http_idle_conn_timeout = parse_millis(name, value)?
                }
                other => {
                    tracing::warn!(option = other, "ignoring unknown connection-string option")
                }
            }
        }
        Ok(config)
    }

    fn advertised_features(&self) -> Vec<u16> {
        let mut features = vec![
            feature::DATATYPE,
            feature::TCP_NODELAY,
            feature::XATTR,
            feature::XERROR,
            feature::JSON,
            feature::SELECT_BUCKET,
            feature::DUPLEX,
            feature::CLUSTERMAP_NOTIFICATION,
            feature::ALT_REQUEST,
            feature::SYNC_REPLICATION,
        ];
        if self.fetch_mutation_tokens {
            features.push(feature::MUTATION_SEQNO);
        }
        if self.use_compression {
            features.push(feature::SNAPPY);
        }
        if self.use_server_durations {
            features.push(feature::DURATIONS);
        }
        if self.use_out_of_order {
            features.push(feature::UNORDERED_EXECUTION);
        }
        if self.use_collections {
            features.push(feature::COLLECTIONS);
        }
        features
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("kv_addrs", &self.kv_addrs)
            .field("http_addrs", &self.http_addrs)
            .field("bucket", &self.bucket)
            .field("auth", &"<dyn AuthProvider>")
            .field("network", &self.network)
            .field("bootstrap_on", &self.bootstrap_on)
            .field("fetch_mutation_tokens", &self.fetch_mutation_tokens)
            .field("use_kv_error_maps", &self.use_kv_error_maps)
            .field("use_enhanced_errors", &self.use_enhanced_errors)
            .field("use_compression", &self.use_compression)
            .field("compression_min_size", &self.compression_min_size)
            .field("compression_min_ratio", &self.compression_min_ratio)
            .field("use_server_durations", &self.use_server_durations)
            .field("use_collections", &self.use_collections)
            .field("use_out_of_order", &self.use_out_of_order)
            .field("kv_pool_size", &self.kv_pool_size)
            .field("max_queue_size", &self.max_queue_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("config_total_timeout", &self.config_total_timeout)
            .field("cccp_poll_period", &self.cccp_poll_period)
            .field("cccp_max_wait", &self.cccp_max_wait)
            .field("cccp_poll_floor", &self.cccp_poll_floor)
            .field("http_retry_delay", &self.http_retry_delay)
            .field("http_redial_period", &self.http_redial_period)
            .field("http_max_idle_conns", &self.http_max_idle_conns)
            .field(
                "http_max_idle_conns_per_host",
                &self.http_max_idle_conns_per_host,
            )
            .field("http_idle_conn_timeout", &self.http_idle_conn_timeout)
            .field("nmv_retry_delay", &self.nmv_retry_delay)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("breaker", &self.breaker)
            .field("retry_strategy", &"<dyn RetryStrategy>")
            .field("sasl_mechanisms", &self.sasl_mechanisms)
            .field("sasl_factory", &"<SaslClientFactory>")
            .finish()
    }
}

/// Read-only view of the installed routing table.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub rev: i64,
    pub bucket: Option<String>,
    pub kv_endpoints: Vec<String>,
    pub mgmt_endpoints: Vec<String>,
    pub num_vbuckets: usize,
}

struct AgentInner {
    bucket: Option<String>,
    dispatcher: KvDispatcher,
    http: HttpDispatcher,
    routing_rx: watch::Receiver<Arc<RoutingTable>>,
    default_strategy: Arc<dyn RetryStrategy>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The driver façade. Cheap to clone; all clones share one dispatch
/// engine.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Build and start an agent: seed routing from the bootstrap
    /// addresses, start pools lazily, and set both config pollers racing.
    pub async fn connect(config: AgentConfig) -> Result<Agent> {
        if config.kv_addrs.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_context("no bootstrap addresses configured"));
        }
        if config.ca_cert_path.is_some() || config.cert_path.is_some() {
            tracing::warn!("tls material configured but this build dials plaintext only");
        }

        let client_id = format!(
            "strata-agent/{}-{:08x}",
            env!("CARGO_PKG_VERSION"),
            rand::random::<u32>()
        );
        let (push_tx, mut push_rx) = mpsc::channel::<PushedConfig>(16);
        let conn_opts = Arc::new(ConnectionOptions {
            bucket: config.bucket.clone(),
            client_id,
            auth: config.auth.clone(),
            sasl_factory: config.sasl_factory.clone(),
            sasl_mechanisms: config.sasl_mechanisms.clone(),
            advertised_features: config.advertised_features(),
            connect_timeout: config.connect_timeout,
            fetch_error_map: config.use_kv_error_maps,
            push_tx: Some(push_tx),
        });

        let seed = RoutingTable::seed(
            config.kv_addrs.clone(),
            config.http_addrs.clone(),
            config.bucket.clone(),
        );
        let (manager, routing_rx) = ConfigManager::new(seed, config.network);
        let manager = Arc::new(manager);

        let mux = KvMux::new(
            routing_rx.clone(),
            conn_opts,
            config.kv_pool_size,
            config.max_queue_size,
            config.breaker.clone(),
        );
        let resolver = CollectionResolver::new(mux.clone(), 1024);
        let dispatcher = KvDispatcher {
            mux: mux.clone(),
            resolver: resolver.clone(),
            manager: manager.clone(),
            nmv_retry_delay: config.nmv_retry_delay,
        };

        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.http_max_idle_conns_per_host)
            .pool_idle_timeout(config.http_idle_conn_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| {
                Error::new(ErrorKind::InvalidArgument)
                    .with_context(format!("http client construction failed: {err}"))
            })?;
        let http = HttpDispatcher::new(
            http_client.clone(),
            routing_rx.clone(),
            config.auth.clone(),
        );

        let mut tasks = Vec::new();

        // Server pushes → config manager.
        {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(push) = push_rx.recv().await {
                    manager.ingest_raw(&push.raw, &push.origin_host, ConfigSource::CccpPush);
                }
            }));
        }

        // Routing swaps → pool reconciliation + collection cache checks.
        {
            let mux = mux.clone();
            let resolver = resolver.clone();
            let mut rx = routing_rx.clone();
            tasks.push(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let table = rx.borrow().clone();
                    mux.reconcile();
                    resolver.on_routing_change(&table);
                }
            }));
        }

        tasks.extend(spawn_pollers(
            PollerConfig {
                bootstrap_on: config.bootstrap_on,
                cccp_poll_period: config.cccp_poll_period,
                cccp_max_wait: config.cccp_max_wait,
                cccp_poll_floor: config.cccp_poll_floor,
                http_retry_delay: config.http_retry_delay,
                http_redial_period: config.http_redial_period,
            },
            mux,
            manager,
            http_client,
            config.auth.clone(),
            config.bucket.clone(),
        ));

        Ok(Agent {
            inner: Arc::new(AgentInner {
                bucket: config.bucket,
                dispatcher,
                http,
                routing_rx,
                default_strategy: config.retry_strategy,
                tasks: Mutex::new(tasks),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Block until a real routing table (revision ≥ 0) is installed.
    pub async fn wait_until_ready(&self, deadline: Instant) -> Result<()> {
        let mut rx = self.inner.routing_rx.clone();
        loop {
            if rx.borrow().is_bootstrapped() {
                return Ok(());
            }
            match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx.changed())
                .await
            {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::new(ErrorKind::Shutdown)),
                Err(_) => {
                    return Err(Error::new(ErrorKind::UnambiguousTimeout)
                        .with_context("no cluster config before deadline"))
                }
            }
        }
    }

    pub fn bucket(&self) -> Option<&str> {
        self.inner.bucket.as_deref()
    }

    pub fn topology(&self) -> TopologySnapshot {
        let table = self.inner.routing_rx.borrow().clone();
        TopologySnapshot {
            rev: table.rev,
            bucket: table.bucket.clone(),
            kv_endpoints: table.kv_endpoints.clone(),
            mgmt_endpoints: table.mgmt_endpoints.clone(),
            num_vbuckets: table
                .vbucket_map
                .as_ref()
                .map(|map| map.num_vbuckets())
                .unwrap_or(0),
        }
    }

    /// Stop pollers, drain every pool, and fail in-flight operations
    /// with a shutdown error. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(bucket = ?self.inner.bucket, "closing agent");
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.dispatcher.mux.shutdown();
    }

    fn strategy(&self, explicit: &Option<Arc<dyn RetryStrategy>>) -> Arc<dyn RetryStrategy> {
        explicit
            .clone()
            .unwrap_or_else(|| self.inner.default_strategy.clone())
    }

    fn collection_pair(collection: &Option<CollectionSpec>) -> Option<(String, String)> {
        collection
            .as_ref()
            .map(|spec| (spec.scope.clone(), spec.collection.clone()))
    }

    // --- typed operations -------------------------------------------------

    pub async fn get(&self, opts: GetOptions) -> Result<GetResult> {
        let req = KvRequest {
            opcode: Opcode::GET,
            datatype: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: true,
            replica_index: opts.replica_index,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_get(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn get_and_touch(&self, opts: GetAndTouchOptions) -> Result<GetResult> {
        let req = KvRequest {
            opcode: Opcode::GET_AND_TOUCH,
            datatype: 0,
            cas: 0,
            extras: ops::expiry_extras(opts.expiry),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_get(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn get_and_lock(&self, opts: GetAndLockOptions) -> Result<GetResult> {
        let req = KvRequest {
            opcode: Opcode::GET_LOCKED,
            datatype: 0,
            cas: 0,
            extras: ops::expiry_extras(opts.lock_time),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_get(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn unlock(&self, opts: UnlockOptions) -> Result<MutationResult> {
        let req = KvRequest {
            opcode: Opcode::UNLOCK,
            datatype: 0,
            cas: opts.cas,
            extras: Bytes::new(),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_mutation(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn touch(&self, opts: TouchOptions) -> Result<MutationResult> {
        let req = KvRequest {
            opcode: Opcode::TOUCH,
            datatype: 0,
            cas: 0,
            extras: ops::expiry_extras(opts.expiry),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_mutation(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn set(&self, opts: StoreOptions) -> Result<MutationResult> {
        self.store(Opcode::SET, opts).await
    }

    pub async fn add(&self, opts: StoreOptions) -> Result<MutationResult> {
        self.store(Opcode::ADD, opts).await
    }

    pub async fn replace(&self, opts: StoreOptions) -> Result<MutationResult> {
        self.store(Opcode::REPLACE, opts).await
    }

    async fn store(&self, opcode: Opcode, opts: StoreOptions) -> Result<MutationResult> {
        let cas_supplied = opts.cas != 0;
        let req = KvRequest {
            opcode,
            datatype: opts.datatype,
            cas: opts.cas,
            extras: ops::store_extras(opts.flags, opts.expiry),
            key: Bytes::from(opts.key),
            value: Bytes::from(opts.value),
            collection: Self::collection_pair(&opts.collection),
            durability: opts.durability,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_cas_mutation(self.inner.dispatcher.execute(req).await?, cas_supplied)
    }

    pub async fn delete(&self, opts: DeleteOptions) -> Result<MutationResult> {
        let cas_supplied = opts.cas != 0;
        let req = KvRequest {
            opcode: Opcode::DELETE,
            datatype: 0,
            cas: opts.cas,
            extras: Bytes::new(),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: opts.durability,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_cas_mutation(self.inner.dispatcher.execute(req).await?, cas_supplied)
    }

    pub async fn append(&self, opts: AdjoinOptions) -> Result<MutationResult> {
        self.adjoin(Opcode::APPEND, opts).await
    }

    pub async fn prepend(&self, opts: AdjoinOptions) -> Result<MutationResult> {
        self.adjoin(Opcode::PREPEND, opts).await
    }

    async fn adjoin(&self, opcode: Opcode, opts: AdjoinOptions) -> Result<MutationResult> {
        let cas_supplied = opts.cas != 0;
        let req = KvRequest {
            opcode,
            datatype: 0,
            cas: opts.cas,
            extras: Bytes::new(),
            key: Bytes::from(opts.key),
            value: Bytes::from(opts.value),
            collection: Self::collection_pair(&opts.collection),
            durability: opts.durability,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_cas_mutation(self.inner.dispatcher.execute(req).await?, cas_supplied)
    }

    pub async fn increment(&self, opts: CounterOptions) -> Result<CounterResult> {
        self.counter(Opcode::INCREMENT, opts).await
    }

    pub async fn decrement(&self, opts: CounterOptions) -> Result<CounterResult> {
        self.counter(Opcode::DECREMENT, opts).await
    }

    async fn counter(&self, opcode: Opcode, opts: CounterOptions) -> Result<CounterResult> {
        let req = KvRequest {
            opcode,
            datatype: 0,
            cas: 0,
            extras: ops::counter_extras(opts.delta, opts.initial, opts.expiry),
            key: Bytes::from(opts.key),
            value: Bytes::new(),
            collection: Self::collection_pair(&opts.collection),
            durability: opts.durability,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        ops::decode_counter(self.inner.dispatcher.execute(req).await?)
    }

    pub async fn lookup_in(&self, opts: LookupInOptions) -> Result<LookupInResult> {
        let op_count = opts.ops.len();
        let extras = if opts.doc_flags != 0 {
            Bytes::copy_from_slice(&[opts.doc_flags])
        } else {
            Bytes::new()
        };
        let req = KvRequest {
            opcode: Opcode::SUBDOC_MULTI_LOOKUP,
            datatype: 0,
            cas: 0,
            extras,
            key: Bytes::from(opts.key),
            value: subdoc::encode_lookup_ops(&opts.ops)?,
            collection: Self::collection_pair(&opts.collection),
            durability: None,
            deadline: opts.deadline,
            idempotent: true,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        subdoc::decode_lookup_response(self.inner.dispatcher.execute(req).await?, op_count)
    }

    pub async fn mutate_in(&self, opts: MutateInOptions) -> Result<MutateInResult> {
        let op_count = opts.ops.len();
        let mut extras = bytes::BytesMut::new();
        if opts.expiry != 0 {
            bytes::BufMut::put_u32(&mut extras, opts.expiry);
        }
        if opts.doc_flags != 0 {
            bytes::BufMut::put_u8(&mut extras, opts.doc_flags);
        }
        let req = KvRequest {
            opcode: Opcode::SUBDOC_MULTI_MUTATION,
            datatype: 0,
            cas: opts.cas,
            extras: extras.freeze(),
            key: Bytes::from(opts.key),
            value: subdoc::encode_mutate_ops(&opts.ops)?,
            collection: Self::collection_pair(&opts.collection),
            durability: opts.durability,
            deadline: opts.deadline,
            idempotent: false,
            replica_index: 0,
            strategy: self.strategy(&opts.retry_strategy),
            cancelled: cancel_flag(&opts.cancel),
        };
        subdoc::decode_mutate_response(self.inner.dispatcher.execute(req).await?, op_count)
    }

    /// Generic HTTP execution for the non-KV services.
    pub async fn http_request(&self, req: HttpRequest) -> Result<HttpResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        self.inner.http.execute(req).await
    }

    // --- callback completion forms ----------------------------------------

    pub fn get_with(
        &self,
        mut opts: GetOptions,
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.get(opts).await);
        });
        handle
    }

    pub fn set_with(
        &self,
        mut opts: StoreOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.set(opts).await);
        });
        handle
    }

    pub fn delete_with(
        &self,
        mut opts: DeleteOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.delete(opts).await);
        });
        handle
    }

    pub fn get_and_touch_with(
        &self,
        mut opts: GetAndTouchOptions,
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.get_and_touch(opts).await);
        });
        handle
    }

    pub fn get_and_lock_with(
        &self,
        mut opts: GetAndLockOptions,
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.get_and_lock(opts).await);
        });
        handle
    }

    pub fn unlock_with(
        &self,
        mut opts: UnlockOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.unlock(opts).await);
        });
        handle
    }

    pub fn touch_with(
        &self,
        mut opts: TouchOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.touch(opts).await);
        });
        handle
    }

    pub fn add_with(
        &self,
        mut opts: StoreOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.add(opts).await);
        });
        handle
    }

    pub fn replace_with(
        &self,
        mut opts: StoreOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.replace(opts).await);
        });
        handle
    }

    pub fn append_with(
        &self,
        mut opts: AdjoinOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.append(opts).await);
        });
        handle
    }

    pub fn prepend_with(
        &self,
        mut opts: AdjoinOptions,
        callback: impl FnOnce(Result<MutationResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.prepend(opts).await);
        });
        handle
    }

    pub fn increment_with(
        &self,
        mut opts: CounterOptions,
        callback: impl FnOnce(Result<CounterResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.increment(opts).await);
        });
        handle
    }

    pub fn decrement_with(
        &self,
        mut opts: CounterOptions,
        callback: impl FnOnce(Result<CounterResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.decrement(opts).await);
        });
        handle
    }

    pub fn lookup_in_with(
        &self,
        mut opts: LookupInOptions,
        callback: impl FnOnce(Result<LookupInResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.lookup_in(opts).await);
        });
        handle
    }

    pub fn mutate_in_with(
        &self,
        mut opts: MutateInOptions,
        callback: impl FnOnce(Result<MutateInResult>) + Send + 'static,
    ) -> CancelHandle {
        let handle = opts.cancel.get_or_insert_with(CancelHandle::new).clone();
        let agent = self.clone();
        tokio::spawn(async move {
            callback(agent.mutate_in(opts).await);
        });
        handle
    }
}

// --- operation options -----------------------------------------------------

#[derive(Debug, Clone)]
pub struct GetOptions {
    pub key: Vec<u8>,
    pub collection: Option<CollectionSpec>,
    /// 0 = primary; >0 reads from that replica.
    pub replica_index: usize,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl GetOptions {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            collection: None,
            replica_index: 0,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetAndTouchOptions {
    pub key: Vec<u8>,
    pub expiry: u32,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl GetAndTouchOptions {
    pub fn new(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        Self {
            key: key.into(),
            expiry,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetAndLockOptions {
    pub key: Vec<u8>,
    /// Lock duration in seconds.
    pub lock_time: u32,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl GetAndLockOptions {
    pub fn new(key: impl Into<Vec<u8>>, lock_time: u32) -> Self {
        Self {
            key: key.into(),
            lock_time,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnlockOptions {
    pub key: Vec<u8>,
    pub cas: u64,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl UnlockOptions {
    pub fn new(key: impl Into<Vec<u8>>, cas: u64) -> Self {
        Self {
            key: key.into(),
            cas,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TouchOptions {
    pub key: Vec<u8>,
    pub expiry: u32,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl TouchOptions {
    pub fn new(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        Self {
            key: key.into(),
            expiry,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    pub expiry: u32,
    /// Nonzero enables optimistic concurrency (REPLACE/SET only).
    pub cas: u64,
    pub datatype: u8,
    pub durability: Option<DurabilityLevel>,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl StoreOptions {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: 0,
            expiry: 0,
            cas: 0,
            datatype: 0,
            durability: None,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub key: Vec<u8>,
    pub cas: u64,
    pub durability: Option<DurabilityLevel>,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl DeleteOptions {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cas: 0,
            durability: None,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdjoinOptions {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
    pub durability: Option<DurabilityLevel>,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl AdjoinOptions {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            cas: 0,
            durability: None,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CounterOptions {
    pub key: Vec<u8>,
    pub delta: u64,
    pub initial: u64,
    pub expiry: u32,
    pub durability: Option<DurabilityLevel>,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl CounterOptions {
    pub fn new(key: impl Into<Vec<u8>>, delta: u64) -> Self {
        Self {
            key: key.into(),
            delta,
            initial: 0,
            expiry: 0,
            durability: None,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupInOptions {
    pub key: Vec<u8>,
    pub ops: Vec<LookupInOp>,
    pub doc_flags: u8,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl LookupInOptions {
    pub fn new(key: impl Into<Vec<u8>>, ops: Vec<LookupInOp>) -> Self {
        Self {
            key: key.into(),
            ops,
            doc_flags: 0,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutateInOptions {
    pub key: Vec<u8>,
    pub ops: Vec<MutateInOp>,
    pub cas: u64,
    pub expiry: u32,
    pub doc_flags: u8,
    pub durability: Option<DurabilityLevel>,
    pub collection: Option<CollectionSpec>,
    pub deadline: Instant,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub cancel: Option<CancelHandle>,
}

impl MutateInOptions {
    pub fn new(key: impl Into<Vec<u8>>, ops: Vec<MutateInOp>) -> Self {
        Self {
            key: key.into(),
            ops,
            cas: 0,
            expiry: 0,
            doc_flags: 0,
            durability: None,
            collection: None,
            deadline: Instant::now() + DEFAULT_KV_TIMEOUT,
            retry_strategy: None,
            cancel: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordAuthProvider;

    fn auth() -> Arc<dyn AuthProvider> {
        Arc::new(PasswordAuthProvider::new("user", "pass"))
    }

    #[test]
    fn connstr_populates_addresses_and_options() {
        let config = AgentConfig::from_connstr(
            "strata://10.0.0.1,10.0.0.2:12000?kv_pool_size=3&config_poll_interval=200&network=default",
            auth(),
        )
        .expect("config");
        assert_eq!(
            config.kv_addrs,
            vec!["10.0.0.1:11210".to_string(), "10.0.0.2:12000".to_string()]
        );
        assert_eq!(
            config.http_addrs,
            vec!["10.0.0.1:8091".to_string(), "10.0.0.2:8091".to_string()]
        );
        assert_eq!(config.kv_pool_size, 3);
        assert_eq!(config.cccp_poll_period, Duration::from_millis(200));
    }

    #[test]
    fn later_connstr_options_win() {
        let config = AgentConfig::from_connstr(
            "strata://a?max_queue_size=10&max_queue_size=99",
            auth(),
        )
        .expect("config");
        assert_eq!(config.max_queue_size, 99);
    }

    #[test]
    fn unknown_enum_values_fail_configuration() {
        let err = AgentConfig::from_connstr("strata://a?network=wormhole", auth())
            .expect_err("bad network");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = AgentConfig::from_connstr("strata://a?bootstrap_on=carrier-pigeon", auth())
            .expect_err("bad bootstrap");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_option_names_are_ignored() {
        // DCP tuning options belong to a different layer; names we do not
        // recognize must not fail construction.
        let config = AgentConfig::from_connstr(
            "strata://a?dcp_buffer_size=1024&dcp_priority=high&kv_pool_size=2",
            auth(),
        )
        .expect("config");
        assert_eq!(config.kv_pool_size, 2);
    }

    #[test]
    fn advertised_features_track_options() {
        let mut config = AgentConfig::new(auth());
        config.use_compression = false;
        config.use_collections = true;
        let features = config.advertised_features();
        assert!(features.contains(&feature::COLLECTIONS));
        assert!(!features.contains(&feature::SNAPPY));
        config.use_compression = true;
        assert!(config.advertised_features().contains(&feature::SNAPPY));
    }
}
