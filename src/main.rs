// =============================================================================
// Borealis Perp Supervisor — Main Entry Point
// =============================================================================
//
// Wires the subsystems together and hands the supervisor to whatever command
// layer fronts the process. The engine starts against the venue testnet
// unless the settings file says otherwise.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use borealis_bot::account;
use borealis_bot::events::{EventBus, Topic};
use borealis_bot::exchange::binance::{BinanceFuturesClient, VenueMode};
use borealis_bot::exchange::ExchangeAdapter;
use borealis_bot::ledger::Ledger;
use borealis_bot::settings::{EngineSettings, VenueEnv};
use borealis_bot::supervisor::Supervisor;
use borealis_bot::types::StrategyStatus;

const SETTINGS_PATH: &str = "borealis_settings.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & settings ────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Perp Supervisor — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = EngineSettings::load(SETTINGS_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        EngineSettings::default()
    });
    info!(
        venue = %settings.venue,
        database = %settings.database_path,
        "engine settings in effect"
    );

    // ── 2. Ledger ────────────────────────────────────────────────────────
    let ledger = Ledger::open(&settings.database_path)
        .map_err(|e| anyhow::anyhow!("ledger open failed: {e}"))?;

    // A previous process may have died with strategies marked running;
    // nothing is live now, so normalize their status.
    for strategy in ledger
        .list_strategies()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        if strategy.status == StrategyStatus::Running {
            warn!(
                strategy_id = strategy.id,
                "strategy was marked running at startup; resetting to stopped"
            );
            let _ = ledger
                .set_strategy_status(strategy.id, StrategyStatus::Stopped)
                .await;
        }
    }

    // ── 3. Exchange adapter ──────────────────────────────────────────────
    let api_key = std::env::var("BOREALIS_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BOREALIS_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("venue credentials missing; signed endpoints will be rejected");
    }
    let mode = match settings.venue {
        VenueEnv::Live => VenueMode::Live,
        VenueEnv::Testnet => VenueMode::Testnet,
    };
    let exchange: Arc<dyn ExchangeAdapter> =
        Arc::new(BinanceFuturesClient::new(api_key, api_secret, mode));

    // ── 4. Event bus + supervisor ────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(
        ledger.clone(),
        exchange.clone(),
        bus.clone(),
    ));

    // Log-sink subscriber so every published event lands in the process log
    // even with no external consumer attached.
    {
        let mut subscription = bus.subscribe(&Topic::ALL, 256);
        tokio::spawn(async move {
            while let Some(event) = subscription.rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "events", "{json}"),
                    Err(e) => warn!(error = %e, "event serialization failed"),
                }
            }
        });
    }

    // ── 5. Account monitor ───────────────────────────────────────────────
    {
        let ledger = ledger.clone();
        let exchange = exchange.clone();
        let bus = bus.clone();
        let supervisor = supervisor.clone();
        let poll = Duration::from_secs(settings.account_poll_seconds.max(1));
        let retention = Duration::from_secs(settings.snapshot_retention_hours * 3600);
        tokio::spawn(async move {
            account::run_account_monitor(ledger, exchange, bus, supervisor, poll, retention).await;
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping strategies");

    supervisor
        .stop_all(settings.close_positions_on_shutdown)
        .await;

    if let Err(e) = settings.save(SETTINGS_PATH) {
        error!(error = %e, "failed to save settings on shutdown");
    }

    info!("Borealis Perp Supervisor shut down complete.");
    Ok(())
}
