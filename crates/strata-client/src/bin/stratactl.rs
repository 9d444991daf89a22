//! Minimal debug client for poking a Strata cluster through the driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use strata_client::{
    Agent, AgentConfig, DeleteOptions, GetOptions, PasswordAuthProvider, StoreOptions,
};

#[derive(Parser)]
#[command(name = "stratactl")]
#[command(about = "Debug client for Strata clusters", long_about = None)]
struct Args {
    /// Connection string, e.g. `strata://127.0.0.1:11210`.
    #[arg(long, default_value = "strata://127.0.0.1:11210")]
    connstr: String,
    #[arg(long)]
    bucket: Option<String>,
    #[arg(long, default_value = "Administrator")]
    username: String,
    #[arg(long, default_value = "password")]
    password: String,
    /// Per-command timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a document and print its value.
    Get {
        key: String,
    },
    /// Store a document.
    Set {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        expiry: u32,
    },
    /// Delete a document.
    Del {
        key: String,
    },
    /// Wait for a config and print the installed topology.
    Topology,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms.max(1));

    let auth = Arc::new(PasswordAuthProvider::new(&args.username, &args.password));
    let mut config =
        AgentConfig::from_connstr(&args.connstr, auth).context("parsing connection string")?;
    config.bucket = args.bucket.clone();

    let agent = Agent::connect(config).await.context("starting agent")?;
    agent
        .wait_until_ready(Instant::now() + timeout)
        .await
        .context("waiting for cluster config")?;

    let outcome = run_command(&agent, args.command, timeout).await;
    agent.close().await;
    outcome
}

async fn run_command(agent: &Agent, command: Command, timeout: Duration) -> anyhow::Result<()> {
    match command {
        Command::Get { key } => {
            let mut opts = GetOptions::new(key.as_bytes());
            opts.deadline = Instant::now() + timeout;
            let result = agent.get(opts).await.context("get failed")?;
            println!(
                "cas=0x{:016x} flags=0x{:08x} {}",
                result.cas,
                result.flags,
                String::from_utf8_lossy(&result.value)
            );
        }
        Command::Set { key, value, expiry } => {
            let mut opts = StoreOptions::new(key.as_bytes(), value.into_bytes());
            opts.expiry = expiry;
            opts.deadline = Instant::now() + timeout;
            let result = agent.set(opts).await.context("set failed")?;
            println!("cas=0x{:016x}", result.cas);
            if let Some(token) = result.mutation_token {
                println!(
                    "token vb={} uuid=0x{:x} seqno={}",
                    token.vbucket_id, token.vbucket_uuid, token.seqno
                );
            }
        }
        Command::Del { key } => {
            let mut opts = DeleteOptions::new(key.as_bytes());
            opts.deadline = Instant::now() + timeout;
            let result = agent.delete(opts).await.context("delete failed")?;
            println!("cas=0x{:016x}", result.cas);
        }
        Command::Topology => {
            let topology = agent.topology();
            println!(
                "rev={} bucket={} vbuckets={}",
                topology.rev,
                topology.bucket.as_deref().unwrap_or("-"),
                topology.num_vbuckets
            );
            for endpoint in &topology.kv_endpoints {
                println!("kv  {endpoint}");
            }
            for endpoint in &topology.mgmt_endpoints {
                println!("mgmt {endpoint}");
            }
        }
    }
    Ok(())
}
