//! Low-level client engine for Strata clusters.
//!
//! This crate is the operation dispatch and routing core used by the
//! higher-level SDKs: it owns pooled, pipelined connections to every KV
//! node, keeps a hot-swappable routing table fed by two racing config
//! sources, and re-drives operations through retry, not-my-vbucket, and
//! circuit-breaker policy. It exposes typed KV operations plus a generic
//! HTTP execution path for the other cluster services.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//! use strata_client::{Agent, AgentConfig, GetOptions, PasswordAuthProvider};
//!
//! # async fn run() -> strata_client::Result<()> {
//! let auth = Arc::new(PasswordAuthProvider::new("app", "secret"));
//! let mut config = AgentConfig::from_connstr("strata://10.0.0.1,10.0.0.2", auth)?;
//! config.bucket = Some("default".to_string());
//! let agent = Agent::connect(config).await?;
//! agent
//!     .wait_until_ready(Instant::now() + Duration::from_secs(10))
//!     .await?;
//! let result = agent.get(GetOptions::new("user::1234")).await?;
//! println!("cas={:x} len={}", result.cas, result.value.len());
//! agent.close().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connstr;
pub mod error;
pub mod http;
pub mod retry;
pub mod routing;
pub mod subdoc;
pub mod wire;

pub mod config;

mod agent;
mod breaker;
mod collections;
mod connection;
mod mux;
mod ops;
mod pollers;
mod pool;

pub use agent::{
    AdjoinOptions, Agent, AgentConfig, CancelHandle, CollectionSpec, CounterOptions,
    DeleteOptions, GetAndLockOptions, GetAndTouchOptions, GetOptions, LookupInOptions,
    MutateInOptions, StoreOptions, TopologySnapshot, TouchOptions, UnlockOptions,
    DEFAULT_KV_TIMEOUT,
};
pub use auth::{AuthProvider, Credentials, PasswordAuthProvider};
pub use breaker::{BreakerConfig, BreakerFailurePredicate};
pub use config::NetworkType;
pub use error::{Error, ErrorKind, Result};
pub use http::{HttpRequest, HttpResponse};
pub use ops::{CounterResult, DurabilityLevel, GetResult, MutationResult, MutationToken};
pub use pollers::BootstrapSource;
pub use retry::{
    BestEffortRetryStrategy, FailFastRetryStrategy, RetryContext, RetryReason, RetryStrategy,
};
pub use routing::ServiceType;
pub use subdoc::{
    LookupInOp, LookupInOpKind, LookupInResult, MutateInOp, MutateInOpKind, MutateInResult,
    SubDocResult,
};
