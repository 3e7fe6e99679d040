use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "activity-engine")]
#[command(about = "Audit/event activity policy engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster and bus connectivity
    Check {
        #[arg(long, default_value = "nats://127.0.0.1:4222")]
        bus_url: String,
        #[arg(long, default_value = "audit")]
        input_stream: String,
        #[arg(long, default_value = "activity-engine")]
        consumer: String,
        #[arg(long, default_value = "activities")]
        output_stream: String,
    },

    /// Manage the ActivityPolicy / ReindexJob CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the activity engine (watcher, worker pool, reindex controller)
    Serve(ServeArgs),
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Bus URL
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    pub bus_url: String,

    /// Source stream carrying audit records and cluster events
    #[arg(long, default_value = "audit")]
    pub input_stream: String,

    /// Shared durable consumer bound by every worker
    #[arg(long, default_value = "activity-engine")]
    pub consumer: String,

    /// Output stream for live activities
    #[arg(long, default_value = "activities")]
    pub output_stream: String,

    /// Sibling output stream for reindexed activities
    #[arg(long, default_value = "reindex")]
    pub reindex_stream: String,

    /// Prefix of every activity routing subject
    #[arg(long, default_value = "activities")]
    pub subject_prefix: String,

    /// Number of worker tasks
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Messages fetched per batch
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Seconds a fetch waits for messages before returning empty
    #[arg(long, default_value_t = 5)]
    pub fetch_wait_seconds: u64,

    /// Ack wait configured on the durable consumer (informational)
    #[arg(long, default_value_t = 30)]
    pub ack_wait_seconds: u64,

    /// Max deliveries configured on the durable consumer (informational)
    #[arg(long, default_value_t = 5)]
    pub max_deliver: i64,

    /// Seconds to wait for the bus to drain on shutdown
    #[arg(long, default_value_t = 30)]
    pub drain_timeout_seconds: u64,

    /// Bind address of the health/metrics server
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub health_addr: String,

    /// Days of history a reindex job may reach back
    #[arg(long, default_value_t = 60)]
    pub reindex_retention_days: u64,

    /// Records per reindex batch
    #[arg(long, default_value_t = 1000)]
    pub reindex_batch_size: usize,

    /// Reindex throttle, records per second
    #[arg(long, default_value_t = 100)]
    pub reindex_rate_limit: u32,

    /// Enable TLS for the bus connection
    #[arg(long)]
    pub tls: bool,

    /// Client certificate (PEM)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Client key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// CA bundle (PEM)
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,
}
