use std::sync::Arc;

use anyhow::Context;
use channel_relay::channels::{Platform, TelegramPlatform};
use channel_relay::config::RelayConfig;
use channel_relay::relay::{DeliveryLedger, RelayLoop, prepare_store};
use channel_relay::store::{DeliveryStore, LibSqlBackend};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let settings = config.validate().await.unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Source:      {}", settings.source);
    eprintln!("   Destination: {}", settings.destination);
    eprintln!(
        "   Rules:       {} filters, {} rewrites",
        settings.rules.filter_count(),
        settings.rules.rewrites().len()
    );
    eprintln!("   Min delay:   {:?}\n", settings.min_delay);

    // ── Delivery ledger ──────────────────────────────────────────────────
    let ledger = match &config.delivery_db_path {
        Some(path) => match open_store(path, &config).await {
            Ok(store) => DeliveryLedger::with_store(store),
            Err(e) => {
                tracing::warn!(error = %e, "Delivery store unavailable; using in-memory ledger");
                DeliveryLedger::in_memory()
            }
        },
        None => DeliveryLedger::in_memory(),
    };

    // ── Platform ─────────────────────────────────────────────────────────
    let RelayConfig {
        session, api_base, ..
    } = config;
    let platform: Arc<dyn Platform> =
        Arc::new(TelegramPlatform::new(session).with_api_base(api_base));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut relay = RelayLoop::new(platform, settings, ledger);
    match relay.run(shutdown_rx).await {
        Ok(stats) => {
            tracing::info!(
                delivered = stats.delivered,
                dropped = stats.dropped,
                duplicates = stats.duplicates,
                failed = stats.failed,
                "Relay finished"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn open_store(
    path: &std::path::Path,
    config: &RelayConfig,
) -> anyhow::Result<Arc<dyn DeliveryStore>> {
    let backend = LibSqlBackend::new_local(path)
        .await
        .with_context(|| format!("opening delivery store at {}", path.display()))?;
    prepare_store(
        &backend,
        config.delivery_retention_days,
        config.reset_delivery_ledger,
    )
    .await
    .context("preparing delivery store")?;
    Ok(Arc::new(backend))
}
