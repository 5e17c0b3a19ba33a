use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotwise::engine::Engine;
use slotwise::notify::NotifyHub;
use slotwise::wire::{self, IdempotencyCache};
use slotwise::{observability, sweeper};

const DRAIN_WINDOW: Duration = Duration::from_secs(10);

struct Config {
    bind: String,
    port: String,
    data_dir: String,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_or("SLOTWISE_BIND", "0.0.0.0"),
            port: env_or("SLOTWISE_PORT", "5454"),
            data_dir: env_or("SLOTWISE_DATA_DIR", "./data"),
            password: env_or("SLOTWISE_PASSWORD", "slotwise"),
            max_connections: env_parsed("SLOTWISE_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parsed("SLOTWISE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parsed("SLOTWISE_METRICS_PORT"),
        }
    }
}

/// Resolves on ctrl-c, or on SIGTERM where that exists.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = PathBuf::from(&config.data_dir).join("slotwise.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path, notify)?);
    let idempotency = Arc::new(IdempotencyCache::new());
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    tokio::spawn(sweeper::run_sweeper(engine.clone(), idempotency.clone()));
    tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise listening on {addr}");
    info!("  data_dir: {}", config.data_dir);
    info!("  max_connections: {}", config.max_connections);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!(
                "http://0.0.0.0:{p}/metrics"
            ))
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                // Over the limit, the socket is dropped without a
                // handshake; clients see a closed connection.
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let password = config.password.clone();
                let idempotency = idempotency.clone();

                tokio::spawn(async move {
                    let _permit = permit; // released when the connection ends
                    if let Err(e) =
                        wire::process_connection(socket, engine, password, idempotency).await
                    {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Drain: when every permit is reclaimable, all connections are done.
    info!("draining connections...");
    let all_permits = config.max_connections as u32;
    match tokio::time::timeout(DRAIN_WINDOW, semaphore.clone().acquire_many_owned(all_permits))
        .await
    {
        Ok(_) => info!("all connections drained"),
        Err(_) => {
            let open = config.max_connections - semaphore.available_permits();
            warn!("drain timeout, {open} connections still open");
        }
    }

    info!("slotwise stopped");
    Ok(())
}
