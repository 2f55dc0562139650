//! Storage node process.
//!
//! Reads its configuration from `NIMBUSIO_*` environment variables (or the
//! equivalent flags), starts the node's four services and its handoff
//! replayer, and runs until SIGINT or SIGTERM.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nimbus_client::Endpoint;
use nimbus_handoff::{DEFAULT_BACKUP_COUNT, HandoffConfig};
use nimbus_server::{ClusterConfig, Node, NodeConfig};
use nimbus_store::DEFAULT_CACHE_CAPACITY;
use nimbus_types::NodeName;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the main thread checks for a signal or a failed service.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// nimbus storage node.
#[derive(Parser, Debug)]
#[command(name = "nimbus-node")]
#[command(about = "Runs one storage node of a nimbus cluster", long_about = None)]
struct Args {
    /// Name of this node; must appear in the node list.
    #[arg(long, env = "NIMBUSIO_NODE_NAME")]
    node_name: String,

    /// Directory for the node's log file. Logs go to stderr when unset.
    #[arg(long, env = "NIMBUSIO_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Repository root holding every node's databases and segments.
    #[arg(long, env = "NIMBUSIO_REPOSITORY_PATH")]
    repository_path: PathBuf,

    /// Space separated names of all cluster nodes.
    #[arg(long, env = "NIMBUSIO_NODE_NAME_SEQ")]
    node_names: String,

    /// Space separated database server addresses, one per node.
    #[arg(long, env = "NIMBUSIO_DATABASE_SERVER_ADDRESSES")]
    database_server_addresses: String,

    /// Space separated data writer addresses, one per node.
    #[arg(long, env = "NIMBUSIO_DATA_WRITER_ADDRESSES")]
    data_writer_addresses: String,

    /// Space separated data reader addresses, one per node.
    #[arg(long, env = "NIMBUSIO_DATA_READER_ADDRESSES")]
    data_reader_addresses: String,

    /// Space separated handoff server addresses, one per node.
    #[arg(long, env = "NIMBUSIO_HANDOFF_SERVER_ADDRESSES")]
    handoff_server_addresses: String,

    /// Pull address of the space accounting collector.
    #[arg(long, env = "NIMBUSIO_SPACE_ACCOUNTING_PUSH_ADDRESS")]
    space_accounting_push_address: Option<String>,

    /// Maximum number of tenant databases held open.
    #[arg(long, env = "NIMBUSIO_DATABASE_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    database_cache_capacity: usize,

    /// Backups a handed-off write must reach.
    #[arg(long, env = "NIMBUSIO_HANDOFF_BACKUP_COUNT", default_value_t = DEFAULT_BACKUP_COUNT)]
    handoff_backup_count: usize,
}

impl Args {
    fn cluster(&self) -> Result<ClusterConfig> {
        ClusterConfig::from_lists(
            &words(&self.node_names),
            &words(&self.database_server_addresses),
            &words(&self.data_writer_addresses),
            &words(&self.data_reader_addresses),
            &words(&self.handoff_server_addresses),
        )
        .context("invalid cluster configuration")
    }

    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::new(NodeName::new(self.node_name.as_str()), &self.repository_path)
            .with_cache_capacity(self.database_cache_capacity)
            .with_handoff(HandoffConfig::default().with_backup_count(self.handoff_backup_count));

        if let Some(address) = &self.space_accounting_push_address {
            let endpoint = address
                .parse::<Endpoint>()
                .with_context(|| format!("invalid space accounting address {address}"))?;
            config = config.with_space_accounting(endpoint);
        }
        Ok(config)
    }
}

fn words(list: &str) -> Vec<String> {
    list.split_whitespace().map(str::to_string).collect()
}

fn init_tracing(log_dir: Option<&Path>, node_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(format!("nimbusio_{node_name}.log"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_dir.as_deref(), &args.node_name)?;

    run(&args).inspect_err(|e| error!(node = %args.node_name, error = ?e, "node failed"))
}

fn run(args: &Args) -> Result<()> {
    let cluster = args.cluster()?;
    let config = args.node_config()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;

    let node = Node::start(config, &cluster).context("failed to start node")?;
    info!(node = %node.name(), cluster = cluster.len(), "node running");

    let stopped = loop {
        if shutdown.load(Ordering::SeqCst) {
            info!(node = %node.name(), "shutdown signal received");
            break None;
        }
        if let Some(worker) = node.stopped_worker() {
            warn!(node = %node.name(), worker, "service stopped unexpectedly");
            break Some(worker.to_string());
        }
        thread::sleep(SUPERVISE_INTERVAL);
    };

    node.shutdown().context("service failed")?;
    if let Some(worker) = stopped {
        bail!("{worker} stopped unexpectedly");
    }
    info!("node stopped");
    Ok(())
}
