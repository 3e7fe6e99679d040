use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/* ============================= TLS ============================= */

/// TLS options for the bus connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/* ============================= ENGINE CONFIG ============================= */

/// Engine configuration, populated from the `serve` command flags.
///
/// `ack_wait` and `max_deliver` describe the durable consumer, which is
/// managed declaratively outside the engine; they are carried here so the
/// startup banner and probes can report the expected values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bus_url: String,
    pub input_stream: String,
    pub durable_consumer: String,
    pub output_stream: String,
    pub reindex_stream: String,
    pub subject_prefix: String,

    pub worker_count: usize,
    pub batch_size: usize,
    pub fetch_wait: Duration,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub drain_timeout: Duration,

    pub health_addr: SocketAddr,

    pub reindex_retention: Duration,
    pub reindex_batch_size: usize,
    pub reindex_rate_limit: u32,

    pub tls: TlsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_url: "nats://127.0.0.1:4222".to_string(),
            input_stream: "audit".to_string(),
            durable_consumer: "activity-engine".to_string(),
            output_stream: "activities".to_string(),
            reindex_stream: "reindex".to_string(),
            subject_prefix: "activities".to_string(),
            worker_count: 4,
            batch_size: 100,
            fetch_wait: Duration::from_secs(5),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            drain_timeout: Duration::from_secs(30),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            reindex_retention: Duration::from_secs(60 * 24 * 60 * 60),
            reindex_batch_size: 1000,
            reindex_rate_limit: 100,
            tls: TlsConfig::default(),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.fetch_wait, Duration::from_secs(5));
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.reindex_retention, Duration::from_secs(5_184_000));
        assert_eq!(config.reindex_batch_size, 1000);
        assert_eq!(config.reindex_rate_limit, 100);
        assert!(!config.tls.enabled);
    }
}
