use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotledger::compactor;
use slotledger::directory::DirectorySeed;
use slotledger::engine::{Engine, EngineConfig};
use slotledger::observability;
use slotledger::wire;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTLEDGER_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port)?;

    let port = std::env::var("SLOTLEDGER_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("SLOTLEDGER_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("SLOTLEDGER_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("SLOTLEDGER_PASSWORD").unwrap_or_else(|_| "slotledger".into());
    let max_connections: usize = env_or("SLOTLEDGER_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("SLOTLEDGER_COMPACT_THRESHOLD", 1000);
    let config = EngineConfig {
        lookup_timeout: Duration::from_millis(env_or("SLOTLEDGER_LOOKUP_TIMEOUT_MS", 2000)),
        lookup_attempts: env_or("SLOTLEDGER_LOOKUP_ATTEMPTS", 2),
    };

    let tls_cert = std::env::var("SLOTLEDGER_TLS_CERT").ok();
    let tls_key = std::env::var("SLOTLEDGER_TLS_KEY").ok();
    let tls_acceptor =
        slotledger::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let seed = match std::env::var("SLOTLEDGER_DIRECTORY_FILE") {
        Ok(path) => DirectorySeed::load(path.as_ref())?,
        Err(_) => DirectorySeed::default(),
    };
    let (subjects, activities) = (seed.subjects.len(), seed.activities.len());
    let (directory, catalog) = seed.into_collaborators();

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("slotledger.wal");
    let engine = Arc::new(Engine::new(
        wal_path,
        Arc::new(directory),
        Arc::new(catalog),
        config,
    )?);
    tokio::spawn(compactor::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotledger listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  directory: {subjects} subjects, {activities} activities");
    info!("  bookings replayed across {} subjects", engine.subject_count());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
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

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotledger stopped");
    Ok(())
}
