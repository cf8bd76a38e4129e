use govwatch::config::Config;
use govwatch::coordinator::MonitorCoordinator;
use govwatch::store::{MemorySnapshotStore, SnapshotSink, ValkeySnapshotStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "govwatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (wss feeds).
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, from_file) = if config_path.exists() {
        (Config::load(&config_path)?, true)
    } else {
        (Config::from_env(), false)
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("govwatch v{} starting", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!(path = %config_path.display(), "loaded config");
    } else {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    if config.chains.is_empty() {
        error!("no chains configured (add [[chains]] or set GOVWATCH_<CHAIN>_RPC_URL), exiting");
        return Ok(());
    }

    // --- Snapshot cache ---
    let sink: Arc<dyn SnapshotSink> = if config.valkey.url.is_empty() {
        warn!("no Valkey url configured - snapshots kept in memory");
        Arc::new(MemorySnapshotStore::new())
    } else {
        match ValkeySnapshotStore::connect(&config.valkey.url).await {
            Ok(s) => match s.ping().await {
                Ok(()) => Arc::new(s),
                Err(e) => {
                    error!(error = %e, "Valkey ping failed - snapshots kept in memory");
                    Arc::new(MemorySnapshotStore::new())
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    url = %config.valkey.url,
                    "failed to connect to Valkey - snapshots kept in memory"
                );
                Arc::new(MemorySnapshotStore::new())
            }
        }
    };

    // --- Monitor ---
    let mut monitor = MonitorCoordinator::from_config(&config)?.with_snapshot_sink(sink);
    monitor.start()?;

    // --- Main Loop ---
    info!("monitoring - press Ctrl+C to stop");

    let mut stats_interval =
        tokio::time::interval(Duration::from_secs(config.monitor.stats_interval_secs.max(1)));
    stats_interval.tick().await;

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let stats = monitor.get_realtime_stats();
                info!(
                    proposals = stats.proposals_monitored,
                    voters = stats.unique_voters,
                    alerts_1h = stats.alerts_last_hour,
                    chains = stats.chains_monitored,
                    contracts = stats.contracts_monitored,
                    "stats"
                );
                for c in &stats.chains {
                    info!(
                        chain = %c.chain,
                        cursor = ?c.cursor,
                        blocks = c.blocks_scanned,
                        events = c.events_emitted,
                        "chain progress"
                    );
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                monitor.stop();
                break;
            }
        }
    }

    monitor.join().await;
    Ok(())
}
