//! Workload generator for exercising a Strata cluster via the driver.
//!
//! This binary issues GET/SET operations across a hot key set, records a
//! per-operation history with wall-clock bounds, and can be used to
//! check linearizability offline or simply to soak the dispatch engine
//! across rebalances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strata_client::{Agent, AgentConfig, GetOptions, PasswordAuthProvider, StoreOptions};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "strata-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Connection string, e.g. `strata://10.0.0.1,10.0.0.2`.
    #[arg(long)]
    connstr: String,

    /// Bucket to select after bootstrap.
    #[arg(long)]
    bucket: Option<String>,

    #[arg(long, default_value = "Administrator")]
    username: String,

    #[arg(long, default_value = "password")]
    password: String,

    /// Number of concurrent clients (each runs its own op loop).
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 5)]
    keys: usize,

    /// Key prefix/namespace. Keys are generated as `{key_prefix}{seed}_k{idx}`.
    #[arg(long, default_value = "strata_")]
    key_prefix: String,

    /// Percent of operations that are SET (rest are GET).
    #[arg(long, default_value_t = 50)]
    set_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-operation timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// When true, any operation error aborts the run.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write a JSON history to this path.
    #[arg(long, default_value = ".tmp/workload/history.json")]
    out: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistoryMeta {
    connstr: String,
    bucket: Option<String>,
    clients: usize,
    keys: usize,
    key_prefix: String,
    set_pct: u8,
    duration_ms: u64,
    seed: u64,
}

/// Full workload history.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    ops: Vec<OpRecord>,
}

/// Single operation record captured during the workload run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct OpRecord {
    client: usize,
    op: OpKind,
    key: String,
    value: Option<String>,
    start_us: u64,
    end_us: u64,
    ok: bool,
    error: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Get,
    Set,
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Args {
        cmd: Command::Run(args),
    } = Args::parse();
    run(args).await
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    let keys: Vec<String> = (0..args.keys.max(1))
        .map(|idx| format!("{}{}_k{}", args.key_prefix, seed, idx))
        .collect();

    let auth = Arc::new(PasswordAuthProvider::new(&args.username, &args.password));
    let mut config = AgentConfig::from_connstr(&args.connstr, auth)
        .context("parsing connection string")?;
    config.bucket = args.bucket.clone();
    let agent = Agent::connect(config).await.context("starting agent")?;
    agent
        .wait_until_ready(Instant::now() + Duration::from_secs(20))
        .await
        .context("waiting for cluster config")?;

    let stop_at = Instant::now() + *args.duration;
    let op_timeout: Duration = *args.op_timeout;

    let mut handles = Vec::with_capacity(args.clients.max(1));
    for client_idx in 0..args.clients.max(1) {
        let agent = agent.clone();
        let keys = keys.clone();
        let set_pct = args.set_pct.min(100);
        let fail_fast = args.fail_fast;
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(client_idx as u64));
        handles.push(tokio::spawn(async move {
            let mut records: Vec<OpRecord> = Vec::new();
            let mut counter = 0u64;
            while Instant::now() < stop_at {
                let key = keys[rng.gen_range(0..keys.len())].clone();
                let is_set = rng.gen_range(0..100u8) < set_pct;
                let start_us = epoch_micros();
                let (op, value, result) = if is_set {
                    counter += 1;
                    let value = format!("c{client_idx}-{counter}");
                    let mut opts = StoreOptions::new(key.as_bytes(), value.as_bytes());
                    opts.deadline = Instant::now() + op_timeout;
                    let result = agent.set(opts).await.map(|_| None);
                    (OpKind::Set, Some(value), result)
                } else {
                    let mut opts = GetOptions::new(key.as_bytes());
                    opts.deadline = Instant::now() + op_timeout;
                    let result = match agent.get(opts).await {
                        Ok(get) => Ok(Some(String::from_utf8_lossy(&get.value).to_string())),
                        Err(err) if err.kind == strata_client::ErrorKind::KeyNotFound => {
                            Ok(None)
                        }
                        Err(err) => Err(err),
                    };
                    (OpKind::Get, None, result)
                };
                let end_us = epoch_micros();
                match result {
                    Ok(read_value) => records.push(OpRecord {
                        client: client_idx,
                        op,
                        key,
                        value: if op == OpKind::Set { value } else { read_value },
                        start_us,
                        end_us,
                        ok: true,
                        error: None,
                    }),
                    Err(err) => {
                        records.push(OpRecord {
                            client: client_idx,
                            op,
                            key,
                            value,
                            start_us,
                            end_us,
                            ok: false,
                            error: Some(err.to_string()),
                        });
                        if fail_fast {
                            return Err(anyhow::anyhow!("client {client_idx}: {err}"))
                                .map_err(|e| (e, records));
                        }
                    }
                }
            }
            Ok(records)
        }));
    }

    let mut ops: Vec<OpRecord> = Vec::new();
    let mut first_error: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.await.context("client task panicked")? {
            Ok(records) => ops.extend(records),
            Err((err, records)) => {
                ops.extend(records);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    agent.close().await;

    ops.sort_by_key(|record| record.start_us);
    let history = History {
        meta: HistoryMeta {
            connstr: args.connstr.clone(),
            bucket: args.bucket.clone(),
            clients: args.clients,
            keys: args.keys,
            key_prefix: args.key_prefix.clone(),
            set_pct: args.set_pct,
            duration_ms: args.duration.as_millis().min(u128::from(u64::MAX)) as u64,
            seed,
        },
        ops,
    };

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent).context("creating history dir")?;
    }
    let data = serde_json::to_vec_pretty(&history).context("serializing history")?;
    std::fs::write(&args.out, data).context("writing history")?;
    println!(
        "wrote {} ops ({} failed) to {}",
        history.ops.len(),
        history.ops.iter().filter(|op| !op.ok).count(),
        args.out.display()
    );

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
