//! Cohort - cluster transaction broadcast for cache coherence
//!
//! Runs a standalone cluster member, mostly useful to observe a cluster
//! and to check configuration files.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use cohort_cluster::TransportKind;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Overrides;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(author = "Cohort Team")]
#[command(version = cohort_core::VERSION)]
#[command(about = "Cluster transaction broadcast for second-level cache coherence", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Server id, unique per running instance
    #[arg(long, global = true, env = "COHORT_SERVER_ID")]
    server_id: Option<String>,

    /// Cluster listener bind address
    #[arg(long, global = true, env = "COHORT_BIND_ADDRESS")]
    bind: Option<String>,

    /// Address peers use to reach this member
    #[arg(long, global = true, env = "COHORT_ADVERTISE_ADDRESS")]
    advertise: Option<String>,

    /// Comma separated member list (host:port)
    #[arg(long, global = true, env = "COHORT_MEMBERS")]
    members: Option<String>,

    /// Transport (tcp or datagram)
    #[arg(long, global = true, env = "COHORT_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "COHORT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true, env = "COHORT_LOG_FORMAT")]
    log_format: Option<String>,

    /// Expose Prometheus metrics on this port
    #[arg(long, global = true, env = "COHORT_METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster member until interrupted
    Node {
        /// Seconds between stats log lines
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },

    /// Validate the configuration and print it
    Check,

    /// Show version information
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            server_id: self.server_id.clone(),
            bind: self.bind.clone(),
            advertise: self.advertise.clone(),
            members: self.members.clone(),
            transport: self.transport,
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            metrics_port: self.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("cohort {}", cohort_core::VERSION);
        println!("wire protocol version {}", cohort_core::WIRE_VERSION);
        return Ok(());
    }

    let config = config::load(cli.config.as_deref(), &cli.overrides())?;

    match cli.command {
        Commands::Node { stats_interval } => {
            init_logging(&config.logging.level, &config.logging.format);
            commands::node::execute(config, stats_interval).await?;
        }
        Commands::Check => commands::check::execute(&config)?,
        Commands::Version => {}
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
