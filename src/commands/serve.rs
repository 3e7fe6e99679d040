use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_nats::jetstream;
use kube::Client;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use activity_engine::cache::PolicyCache;
use activity_engine::config::{EngineConfig, TlsConfig};
use activity_engine::events;
use activity_engine::health::{self, HealthState};
use activity_engine::lookup::CacheMatcher;
use activity_engine::metrics::{self, BUS_CONNECTED, BUS_DISCONNECTS, BUS_ERRORS, BUS_RECONNECTS};
use activity_engine::publisher::ActivityPublisher;
use activity_engine::reindex::ReindexCoordinator;
use activity_engine::resolver::ResourceResolver;
use activity_engine::watcher::PolicyWatcher;
use activity_engine::workers::{ActivityMatcher, WorkerPool};

use crate::cli::ServeArgs;

/* ============================= CONFIG ============================= */

fn config_from(args: &ServeArgs) -> Result<EngineConfig> {
    Ok(EngineConfig {
        bus_url: args.bus_url.clone(),
        input_stream: args.input_stream.clone(),
        durable_consumer: args.consumer.clone(),
        output_stream: args.output_stream.clone(),
        reindex_stream: args.reindex_stream.clone(),
        subject_prefix: args.subject_prefix.clone(),
        worker_count: args.workers,
        batch_size: args.batch_size,
        fetch_wait: Duration::from_secs(args.fetch_wait_seconds),
        ack_wait: Duration::from_secs(args.ack_wait_seconds),
        max_deliver: args.max_deliver,
        drain_timeout: Duration::from_secs(args.drain_timeout_seconds),
        health_addr: args
            .health_addr
            .parse()
            .context("invalid health bind address")?,
        reindex_retention: Duration::from_secs(args.reindex_retention_days * 24 * 60 * 60),
        reindex_batch_size: args.reindex_batch_size,
        reindex_rate_limit: args.reindex_rate_limit,
        tls: TlsConfig {
            enabled: args.tls,
            cert: args.tls_cert.clone(),
            key: args.tls_key.clone(),
            ca: args.tls_ca.clone(),
        },
    })
}

/* ============================= BUS ============================= */

async fn connect_bus(config: &EngineConfig, health: Arc<HealthState>) -> Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new();

    if config.tls.enabled {
        options = options.require_tls(true);
        if let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) {
            options = options.add_client_certificate(cert.clone(), key.clone());
        }
        if let Some(ca) = &config.tls.ca {
            options = options.add_root_certificates(ca.clone());
        }
    }

    let options = options.event_callback(move |event| {
        let health = health.clone();
        async move {
            match event {
                async_nats::Event::Connected => {
                    BUS_RECONNECTS.inc();
                    BUS_CONNECTED.set(1);
                    health.set_bus_connected(true);
                    info!("bus_reconnected");
                }
                async_nats::Event::Disconnected => {
                    BUS_DISCONNECTS.inc();
                    BUS_CONNECTED.set(0);
                    health.set_bus_connected(false);
                    warn!("bus_disconnected");
                }
                async_nats::Event::ClientError(e) => {
                    BUS_ERRORS.inc();
                    warn!(error = %e, "bus_client_error");
                }
                _ => {}
            }
        }
    });

    options
        .connect(config.bus_url.as_str())
        .await
        .with_context(|| format!("failed to connect to bus at {}", config.bus_url))
}

/* ============================= ENTRY ============================= */

pub async fn run(args: ServeArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from(&args)?;

    println!("Starting activity engine...\n");

    // Verify cluster connectivity before anything else
    print!("  Cluster connection .......... ");
    let client = Client::try_default().await.context("Failed to load kubeconfig")?;
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let health = HealthState::new();

    print!("  Bus connection .............. ");
    let nats = match connect_bus(&config, health.clone()).await {
        Ok(nats) => {
            println!("OK ({})", config.bus_url);
            nats
        }
        Err(e) => {
            println!("FAIL");
            return Err(e);
        }
    };
    BUS_CONNECTED.set(1);
    health.set_bus_connected(true);

    let js = jetstream::new(nats.clone());

    // Force-init Prometheus metrics so they appear on /metrics
    metrics::force_init();

    let cache = Arc::new(PolicyCache::new());
    let resolver = Arc::new(ResourceResolver::new(client.clone()));
    let matcher: Arc<dyn ActivityMatcher> = Arc::new(CacheMatcher::new(cache.clone()));
    let publisher = ActivityPublisher::new(js.clone(), config.subject_prefix.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let lifecycle = CancellationToken::new();

    let (warnings, reporter_handle) = events::spawn_reporter(client.clone(), shutdown_tx.subscribe());

    // Health/metrics server
    let http_state = health.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_addr = config.health_addr;
    let http_handle = tokio::spawn(async move {
        start_http_server(http_state, http_shutdown, http_addr).await
    });

    // Policy watcher keeps the cache in sync with the control plane
    let watcher = PolicyWatcher::new(client.clone(), cache.clone(), resolver.clone(), health.clone());
    let watcher_handle = tokio::spawn(watcher.run(shutdown_tx.subscribe()));

    // Worker pool; missing streams or consumer are fatal here
    let pool = WorkerPool::new(
        js.clone(),
        matcher.clone(),
        publisher.clone(),
        warnings.clone(),
        health.clone(),
        config.clone(),
    );
    let worker_handles = pool.start(&shutdown_tx).await?;

    // Reindex coordinator
    let coordinator = ReindexCoordinator::new(
        client,
        js,
        matcher,
        publisher,
        config.clone(),
        lifecycle.child_token(),
    );
    let controller = coordinator.run();

    println!("  Input ....................... {} / consumer '{}'", config.input_stream, config.durable_consumer);
    println!("  Output ...................... {} (prefix '{}')", config.output_stream, config.subject_prefix);
    println!("  Workers ..................... {} x batch {}", config.worker_count, config.batch_size);
    println!("  Consumer ack wait ........... {}s, max deliver {}", config.ack_wait.as_secs(), config.max_deliver);
    println!("  Metrics server .............. http://{}", config.health_addr);
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (bus connectivity)");
    println!("    GET /readyz ............... Readiness probe (bus + cache sync + pool)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Engine running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("engine_started");

    // Use select! so Ctrl+C drops (cancels) the reindex controller
    // stream; the kube Controller has no built-in shutdown hook.
    tokio::select! {
        _ = controller => {
            info!("reindex_controller_stream_ended");
            println!("\nReindex controller stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping engine...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    lifecycle.cancel();

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = watcher_handle.await;
    let _ = reporter_handle.await;
    let _ = http_handle.await;

    // Drain in-flight publishes, bounded; force-close on timeout
    print!("Draining bus connection ({}s max) ... ", config.drain_timeout.as_secs());
    match tokio::time::timeout(config.drain_timeout, nats.drain()).await {
        Ok(Ok(())) => println!("done"),
        Ok(Err(e)) => {
            println!("failed");
            warn!(error = %e, "bus_drain_failed");
        }
        Err(_) => {
            println!("timed out, closing");
            warn!("bus_drain_timeout");
        }
    }

    info!("engine_stopped");
    println!("Engine stopped.");
    Ok(())
}

/* ============================= HTTP SERVER ============================= */

async fn start_http_server(
    state: Arc<HealthState>,
    mut shutdown: broadcast::Receiver<()>,
    addr: std::net::SocketAddr,
) -> Result<()> {
    let app = health::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
