//! coworker-daemon: the local-first filesystem coworker server.
//!
//! Binds a loopback HTTP listener, opens the control-plane store, and
//! runs the worker pool. The binary uses a synchronous `fn main()` that
//! constructs the Tokio runtime explicitly and `block_on`s the async
//! entry point, keeping runtime setup out of macro expansion.
//!
//! Exit codes: `0` on clean shutdown; non-zero when the listener cannot
//! bind or the store cannot open.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coworker_core::scope::WorkspaceScope;
use coworker_core::tool::ToolSet;
use coworker_daemon::config::{
    ServerConfig, DEFAULT_LEASE_MS, DEFAULT_PORT, DEFAULT_STORE_FILE, DEFAULT_WORKERS,
};
use coworker_daemon::gateway::{self, GatewayState};
use coworker_daemon::store::CpStore;
use coworker_daemon::worker::WorkerPool;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Local-first filesystem coworker server.
#[derive(Parser, Debug)]
#[command(name = "coworker-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind; keep this on loopback unless you trust the network
    #[arg(long, default_value = "127.0.0.1", env = "COWORKER_HOST")]
    host: IpAddr,

    /// Port to bind
    #[arg(long, default_value_t = DEFAULT_PORT, env = "COWORKER_PORT")]
    port: u16,

    /// Path of the control-plane store
    #[arg(long, default_value = DEFAULT_STORE_FILE, env = "COWORKER_STORE")]
    store: PathBuf,

    /// Workspace root allowlist (repeatable; defaults to the current directory)
    #[arg(long = "root", env = "COWORKER_ALLOWED_ROOTS", value_delimiter = ',')]
    roots: Vec<PathBuf>,

    /// Lease duration granted to a worker on claim, milliseconds
    #[arg(long, default_value_t = DEFAULT_LEASE_MS, env = "COWORKER_LEASE_MS")]
    lease_ms: u64,

    /// Worker pool size
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "COWORKER_WORKERS")]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "COWORKER_LOG")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        store_path: args.store,
        roots: args.roots,
        lease_ms: args.lease_ms,
        workers: args.workers,
    }
    .normalized()
    .context("failed to resolve configuration")?;

    let store = CpStore::open(&config.store_path).with_context(|| {
        format!(
            "failed to open control-plane store at {}",
            config.store_path.display()
        )
    })?;

    let scope = Arc::new(
        WorkspaceScope::new(&config.roots).context("failed to resolve workspace roots")?,
    );
    for root in scope.roots() {
        info!(root = %root.display(), "workspace root allowlisted");
    }

    let tools = Arc::new(ToolSet::builtin());
    let pool = WorkerPool::spawn(config.workers, store.clone(), tools, config.lease_ms);

    let state = GatewayState::new(store, Arc::clone(&scope));
    let app = gateway::router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        workers = config.workers,
        lease_ms = config.lease_ms,
        "coworker daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("shutting down worker pool");
    pool.shutdown().await;
    info!("daemon shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler");
            let _ = ctrl_c.await;
            info!("received SIGINT");
        }
    }
}
