use anyhow::Context;
use clap::Parser;
use sonata_auth::{HashCost, MemoryIdentityStore, Passwords};
use sonata_core::{Config, IdentityStore, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sonata")]
#[command(about = "Reactor + worker pool HTTP server with zero-copy static files")]
#[command(version)]
struct Cli {
    /// TCP port to listen on
    port: u16,

    /// Interface to bind
    #[arg(long)]
    host: Option<String>,

    /// Document root for static files
    #[arg(long, short = 'r')]
    root: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Maximum queued tasks before the pool pushes back
    #[arg(long)]
    max_queue: Option<usize>,

    /// Size of the connection table
    #[arg(long)]
    max_connections: Option<usize>,

    /// JSON file of users to preload: [{"username":..,"password":..,"email":..}]
    #[arg(long)]
    users: Option<PathBuf>,

    /// Argon2 memory cost in KiB for newly stored passwords
    #[arg(long)]
    argon2_memory_kib: Option<u32>,

    /// Argon2 iteration count for newly stored passwords
    #[arg(long)]
    argon2_iterations: Option<u32>,

    /// Parse login/register bodies as strict JSON
    #[arg(long)]
    strict_json: bool,

    /// Log a metrics summary every N seconds
    #[arg(long)]
    metrics_interval: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        sonata_core::logging::init_logging_json();
    } else {
        sonata_core::logging::init_logging_with_level(&cli.log_level);
    }

    let mut config = Config::from_env();
    config.port = cli.port;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(root) = cli.root {
        config.doc_root = root;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_queue) = cli.max_queue {
        config.max_queue = max_queue;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(interval) = cli.metrics_interval {
        config.metrics_interval_secs = interval;
    }
    config.strict_json |= cli.strict_json;

    // HashCost::from_env runs after Config::from_env has loaded .env.
    let mut cost = HashCost::from_env();
    if let Some(m) = cli.argon2_memory_kib {
        cost.memory_kib = m;
    }
    if let Some(t) = cli.argon2_iterations {
        cost.iterations = t;
    }
    let passwords = Passwords::new(cost).context("configuring password hashing")?;

    let store = MemoryIdentityStore::with_passwords(passwords);
    if let Some(path) = &cli.users {
        store
            .seed_from_json_file(path)
            .with_context(|| format!("loading users from {}", path.display()))?;
    }
    let identity: Arc<dyn IdentityStore> = Arc::new(store);

    let server = Server::bind(config.clone(), identity)
        .with_context(|| format!("binding {}", config.server_addr()))?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        shutdown.store(true, Ordering::Release);
    })
    .context("installing Ctrl-C handler")?;

    server.serve().context("server loop failed")?;
    Ok(())
}
