// =============================================================================
// Strategy supervisor — lifecycle owner for every strategy
// =============================================================================
//
// The supervisor is an explicit value constructed once at process start and
// handed to the command layer; it owns the table of live strategy loops:
//
//   {strategy_id -> StrategyHandle}
//
// Commands targeting the same strategy are serialized through a per-strategy
// command lock; distinct strategies start, tick, and stop fully in parallel.
// `start` returns once the kernel initialized (Running) or failed (the run is
// marked errored). `stop` returns once the loop reached Stopped, or fails
// with CancellationTimeout after the bound, aborting the loop and marking the
// run errored for human reconciliation.
// =============================================================================

pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backtest::{self, BacktestParams};
use crate::config::{ReconcilePolicy, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeAdapter;
use crate::kernel::Kernel;
use crate::ledger::{BacktestRecord, Ledger, NewTrade, Page, RunRecord, StrategyRecord};
use crate::position::Position;
use crate::risk::RiskPolicy;
use crate::templates::{Template, TemplateRegistry};
use crate::types::{
    AccountSnapshot, Bar, Fill, RunCounters, RunStatus, StrategyKind, StrategyState,
    StrategyStatus, Timeframe, TradeKind, TradeRecord,
};

use runner::{RunState, RunnerCommand, RunnerDeps, StopRequest};

/// Default bound on cooperative stop.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Shared view of one live strategy loop. The loop writes, everyone else
/// reads.
pub struct StrategyHandle {
    pub strategy_id: i64,
    pub run_id: i64,
    pub state: RwLock<StrategyState>,
    pub counters: RwLock<RunCounters>,
    pub position: RwLock<Option<Position>>,
    pub last_tick_at: RwLock<Option<i64>>,
    stop_tx: watch::Sender<Option<StopRequest>>,
    cmd_tx: mpsc::Sender<RunnerCommand>,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StrategyHandle {
    pub(crate) fn new(
        strategy_id: i64,
        run_id: i64,
    ) -> (
        Arc<Self>,
        watch::Receiver<Option<StopRequest>>,
        mpsc::Receiver<RunnerCommand>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(None);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let handle = Arc::new(Self {
            strategy_id,
            run_id,
            state: RwLock::new(StrategyState::Starting),
            counters: RwLock::new(RunCounters::default()),
            position: RwLock::new(None),
            last_tick_at: RwLock::new(None),
            stop_tx,
            cmd_tx,
            join: tokio::sync::Mutex::new(None),
        });
        (handle, stop_rx, cmd_rx)
    }

    fn is_live(&self) -> bool {
        matches!(
            *self.state.read(),
            StrategyState::Starting | StrategyState::Running | StrategyState::Stopping
        )
    }
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

/// Live position enriched with the derived pnl figures (computed on read,
/// never persisted).
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

impl From<Position> for PositionView {
    fn from(position: Position) -> Self {
        let unrealized_pnl = position.unrealized_pnl();
        let unrealized_pnl_pct = position.unrealized_pnl_pct();
        Self {
            position,
            unrealized_pnl,
            unrealized_pnl_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatusView {
    pub strategy_id: i64,
    pub name: String,
    pub kind: StrategyKind,
    pub status: StrategyStatus,
    pub state: StrategyState,
    pub run_id: Option<i64>,
    pub counters: RunCounters,
    pub position: Option<PositionView>,
    pub last_tick_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    ledger: Ledger,
    exchange: Arc<dyn ExchangeAdapter>,
    bus: Arc<EventBus>,
    templates: TemplateRegistry,
    strategies: RwLock<HashMap<i64, Arc<StrategyHandle>>>,
    command_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(ledger: Ledger, exchange: Arc<dyn ExchangeAdapter>, bus: Arc<EventBus>) -> Self {
        Self {
            ledger,
            exchange,
            bus,
            templates: TemplateRegistry::new(),
            strategies: RwLock::new(HashMap::new()),
            command_locks: Mutex::new(HashMap::new()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn deps(&self) -> RunnerDeps {
        RunnerDeps {
            ledger: self.ledger.clone(),
            exchange: self.exchange.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Per-strategy command serialization; commands on different strategies
    /// proceed in parallel.
    fn command_lock(&self, strategy_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.command_locks
            .lock()
            .entry(strategy_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn live_handle(&self, strategy_id: i64) -> Option<Arc<StrategyHandle>> {
        self.strategies
            .read()
            .get(&strategy_id)
            .filter(|h| h.is_live())
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Strategy CRUD
    // -------------------------------------------------------------------------

    pub async fn create_strategy(
        &self,
        name: &str,
        description: &str,
        kind: StrategyKind,
        config: &serde_json::Value,
    ) -> EngineResult<i64> {
        if kind == StrategyKind::Config {
            // Reject malformed documents at creation instead of at start.
            StrategyConfig::parse(config)?;
        }
        self.ledger
            .create_strategy(name, description, kind, config)
            .await
    }

    /// Editing is allowed only while the strategy is stopped.
    pub async fn update_strategy(
        &self,
        strategy_id: i64,
        name: &str,
        description: &str,
        config: &serde_json::Value,
    ) -> EngineResult<()> {
        let lock = self.command_lock(strategy_id);
        let _guard = lock.lock().await;
        if self.live_handle(strategy_id).is_some() {
            return Err(EngineError::Config(format!(
                "strategy {strategy_id} is running; stop it before editing"
            )));
        }
        let record = self.require_strategy(strategy_id).await?;
        if record.kind == StrategyKind::Config {
            StrategyConfig::parse(config)?;
        }
        self.ledger
            .update_strategy(strategy_id, name, description, config)
            .await
    }

    pub async fn delete_strategy(&self, strategy_id: i64) -> EngineResult<()> {
        let lock = self.command_lock(strategy_id);
        let _guard = lock.lock().await;
        if self.live_handle(strategy_id).is_some() {
            return Err(EngineError::Config(format!(
                "strategy {strategy_id} is running; stop it before deleting"
            )));
        }
        self.ledger.delete_strategy(strategy_id).await
    }

    pub async fn list_strategies(&self) -> EngineResult<Vec<StrategyRecord>> {
        self.ledger.list_strategies().await
    }

    async fn require_strategy(&self, strategy_id: i64) -> EngineResult<StrategyRecord> {
        self.ledger
            .get_strategy(strategy_id)
            .await?
            .ok_or_else(|| EngineError::Config(format!("strategy {strategy_id} not found")))
    }

    // -------------------------------------------------------------------------
    // Start
    // -------------------------------------------------------------------------

    /// Start a strategy: open its run, reconcile any pre-existing venue
    /// position, initialize the kernel, then launch the tick loop. Returns
    /// the new run id.
    pub async fn start(&self, strategy_id: i64) -> EngineResult<i64> {
        let lock = self.command_lock(strategy_id);
        let _guard = lock.lock().await;

        if self.live_handle(strategy_id).is_some() {
            return Err(EngineError::Config(format!(
                "strategy {strategy_id} is already running"
            )));
        }
        self.strategies.write().remove(&strategy_id); // drop stale handle

        let record = self.require_strategy(strategy_id).await?;
        if record.kind == StrategyKind::Code {
            return Err(EngineError::Config(
                "user-code strategies cannot be started by this engine".into(),
            ));
        }
        let cfg = StrategyConfig::parse(&record.config)?;

        let balance = self.exchange.fetch_balance().await?;
        let run_id = self.ledger.open_run(strategy_id, balance.total).await?;

        let (handle, stop_rx, cmd_rx) = StrategyHandle::new(strategy_id, run_id);
        self.strategies
            .write()
            .insert(strategy_id, handle.clone());

        let mut state = RunState {
            strategy_id,
            run_id,
            symbol: cfg.trading.symbol.clone(),
            leverage: cfg.trading.leverage,
            policy: RiskPolicy::from_config(&cfg),
            start_balance: balance.total,
            counters: RunCounters::default(),
            position: None,
            last_trade_at: None,
            consecutive_errors: 0,
        };

        // Reconcile, then initialize; either failure marks the run errored
        // and surfaces to the caller with no ticks issued.
        let prepared = self.prepare_run(&cfg, &mut state).await;
        let mut kernel = match prepared {
            Ok(kernel) => kernel,
            Err(e) => {
                self.abort_start(&handle, &state, &e).await;
                return Err(e);
            }
        };

        {
            let mut ctx =
                crate::kernel::StrategyContext::new(strategy_id, &cfg, &self.exchange);
            if let Err(e) = kernel.initialize(&mut ctx).await {
                self.abort_start(&handle, &state, &e).await;
                return Err(e);
            }
        }

        *handle.state.write() = StrategyState::Running;
        *handle.position.write() = state.position.clone();
        if let Err(e) = self
            .ledger
            .set_strategy_status(strategy_id, StrategyStatus::Running)
            .await
        {
            self.abort_start(&handle, &state, &e).await;
            return Err(e);
        }
        self.bus.publish(Event::StrategyStatus {
            strategy_id,
            status: StrategyState::Running.to_string(),
            counters: state.counters,
        });

        let task = tokio::spawn(runner::run_loop(
            handle.clone(),
            self.deps(),
            cfg,
            kernel,
            state,
            stop_rx,
            cmd_rx,
        ));
        *handle.join.lock().await = Some(task);

        info!(strategy_id, run_id, "strategy started");
        Ok(run_id)
    }

    /// Reconcile the venue position per configuration and build the kernel.
    async fn prepare_run(
        &self,
        cfg: &StrategyConfig,
        state: &mut RunState,
    ) -> EngineResult<Kernel> {
        if let Some(venue_pos) = self.exchange.fetch_position(&state.symbol).await? {
            match cfg.trading.reconcile_on_start {
                ReconcilePolicy::Close => {
                    warn!(
                        strategy_id = state.strategy_id,
                        symbol = %state.symbol,
                        qty = venue_pos.qty,
                        "closing pre-existing venue position before start"
                    );
                    self.exchange
                        .close_market(&state.symbol, venue_pos.side)
                        .await?;
                }
                ReconcilePolicy::Adopt => {
                    info!(
                        strategy_id = state.strategy_id,
                        symbol = %state.symbol,
                        qty = venue_pos.qty,
                        entry = venue_pos.entry_price,
                        "adopting pre-existing venue position into the new run"
                    );
                    let fill = Fill {
                        price: venue_pos.entry_price,
                        qty: venue_pos.qty,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    // Record the adoption as the run's opening trade so the
                    // trade log still replays into the position.
                    let trade = self
                        .ledger
                        .append_trade(
                            state.run_id,
                            &NewTrade {
                                strategy_id: state.strategy_id,
                                kind: TradeKind::Open,
                                side: venue_pos.side,
                                symbol: state.symbol.clone(),
                                price: fill.price,
                                qty: fill.qty,
                                pnl: None,
                                executed_at: fill.timestamp,
                            },
                        )
                        .await?;
                    state.counters.apply(None);
                    state.last_trade_at = Some(trade.executed_at);

                    let position =
                        Position::open(&state.symbol, venue_pos.side, &fill, state.leverage);
                    self.ledger
                        .upsert_position(state.run_id, Some(&position))
                        .await?;
                    state.position = Some(position);
                }
            }
        }

        Kernel::from_config(cfg)
    }

    async fn abort_start(&self, handle: &StrategyHandle, state: &RunState, err: &EngineError) {
        warn!(
            strategy_id = state.strategy_id,
            run_id = state.run_id,
            error = %err,
            "start aborted"
        );
        if let Err(close_err) = self
            .ledger
            .close_run(state.run_id, None, &state.counters, RunStatus::Error)
            .await
        {
            warn!(run_id = state.run_id, error = %close_err, "errored run close failed");
        }

        // A configuration failure leaves the strategy Stopped; anything else
        // is an Error state.
        let status = match err {
            EngineError::Config(_) => StrategyStatus::Stopped,
            _ => StrategyStatus::Error,
        };
        let _ = self.ledger.set_strategy_status(state.strategy_id, status).await;

        *handle.state.write() = match status {
            StrategyStatus::Stopped => StrategyState::Stopped,
            _ => StrategyState::Error,
        };
        self.strategies.write().remove(&state.strategy_id);

        self.bus.publish(Event::Error {
            strategy_id: Some(state.strategy_id),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Stop a strategy. Returns after the loop reached Stopped; on timeout
    /// the loop is aborted, the run marked errored, and
    /// `CancellationTimeout` returned.
    pub async fn stop(&self, strategy_id: i64, close_positions: bool) -> EngineResult<()> {
        let lock = self.command_lock(strategy_id);
        let _guard = lock.lock().await;

        let handle = {
            let strategies = self.strategies.read();
            strategies.get(&strategy_id).cloned()
        };
        let Some(handle) = handle else {
            return Err(EngineError::Config(format!(
                "strategy {strategy_id} is not running"
            )));
        };

        if !handle.is_live() {
            // The loop already terminated on its own; just clear the table.
            self.strategies.write().remove(&strategy_id);
            return Ok(());
        }

        *handle.state.write() = StrategyState::Stopping;
        let _ = handle.stop_tx.send(Some(StopRequest { close_positions }));

        let task = handle.join.lock().await.take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            match tokio::time::timeout(self.stop_timeout, task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(strategy_id, "stop timed out; aborting loop");
                    abort.abort();
                    self.abort_timed_out(strategy_id, &handle).await;
                    return Err(EngineError::CancellationTimeout(
                        self.stop_timeout.as_secs(),
                    ));
                }
            }
        }

        self.strategies.write().remove(&strategy_id);
        info!(strategy_id, close_positions, "strategy stopped");
        Ok(())
    }

    async fn abort_timed_out(&self, strategy_id: i64, handle: &StrategyHandle) {
        *handle.state.write() = StrategyState::Error;
        let counters = *handle.counters.read();
        if let Err(e) = self
            .ledger
            .close_run(handle.run_id, None, &counters, RunStatus::Error)
            .await
        {
            warn!(run_id = handle.run_id, error = %e, "close_run after timeout failed");
        }
        let _ = self
            .ledger
            .set_strategy_status(strategy_id, StrategyStatus::Error)
            .await;
        self.strategies.write().remove(&strategy_id);
        self.bus.publish(Event::Error {
            strategy_id: Some(strategy_id),
            kind: "cancellation_timeout".into(),
            message: format!("strategy {strategy_id} did not stop in time"),
        });
    }

    /// Stop every live strategy (process shutdown path).
    pub async fn stop_all(&self, close_positions: bool) {
        let ids: Vec<i64> = self.strategies.read().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop(id, close_positions).await {
                warn!(strategy_id = id, error = %e, "stop_all: strategy failed to stop");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands and queries
    // -------------------------------------------------------------------------

    /// Ask a running ML strategy to rebuild its model on the next tick.
    pub async fn force_retrain(&self, strategy_id: i64) -> EngineResult<()> {
        let handle = self.live_handle(strategy_id).ok_or_else(|| {
            EngineError::Config(format!("strategy {strategy_id} is not running"))
        })?;
        handle
            .cmd_tx
            .try_send(RunnerCommand::ForceRetrain)
            .map_err(|_| {
                EngineError::Config(format!(
                    "strategy {strategy_id} is not accepting commands"
                ))
            })
    }

    pub async fn status(&self, strategy_id: i64) -> EngineResult<StrategyStatusView> {
        let record = self.require_strategy(strategy_id).await?;
        Ok(self.view_for(record))
    }

    pub async fn statuses(&self) -> EngineResult<Vec<StrategyStatusView>> {
        let records = self.ledger.list_strategies().await?;
        Ok(records.into_iter().map(|r| self.view_for(r)).collect())
    }

    fn view_for(&self, record: StrategyRecord) -> StrategyStatusView {
        let handle = self.strategies.read().get(&record.id).cloned();
        let (state, run_id, counters, position, last_tick_at) = match handle {
            Some(h) => (
                *h.state.read(),
                Some(h.run_id),
                *h.counters.read(),
                h.position.read().clone(),
                *h.last_tick_at.read(),
            ),
            None => (StrategyState::Stopped, None, RunCounters::default(), None, None),
        };
        StrategyStatusView {
            strategy_id: record.id,
            name: record.name,
            kind: record.kind,
            status: record.status,
            state,
            run_id,
            counters,
            position: position.map(PositionView::from),
            last_tick_at,
        }
    }

    pub async fn trades(
        &self,
        strategy_id: Option<i64>,
        run_id: Option<i64>,
        offset: u32,
        limit: u32,
    ) -> EngineResult<Page<TradeRecord>> {
        self.ledger
            .list_trades(strategy_id, run_id, offset, limit)
            .await
    }

    pub async fn runs(&self, strategy_id: i64) -> EngineResult<Vec<RunRecord>> {
        self.ledger.list_runs(strategy_id).await
    }

    pub async fn price_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> EngineResult<Vec<Bar>> {
        self.exchange.fetch_bars(symbol, timeframe, limit).await
    }

    pub async fn account_history(&self, since_ms: i64) -> EngineResult<Vec<AccountSnapshot>> {
        self.ledger.query_snapshots(since_ms).await
    }

    pub fn templates(&self) -> &[Template] {
        self.templates.list()
    }

    // -------------------------------------------------------------------------
    // Backtests
    // -------------------------------------------------------------------------

    /// Create the backtest record and launch the replay in the background.
    /// Returns the backtest id immediately; progress streams on the bus.
    pub async fn submit_backtest(&self, params: BacktestParams) -> EngineResult<i64> {
        let record = self.require_strategy(params.strategy_id).await?;
        let cfg = StrategyConfig::parse(&record.config)?;

        let symbol = params
            .symbol
            .clone()
            .map(|s| crate::exchange::normalize_symbol(&s))
            .unwrap_or_else(|| cfg.trading.symbol.clone());
        let timeframe = params
            .timeframe
            .unwrap_or_else(|| backtest::preferred_timeframe(&cfg));

        let backtest_id = self
            .ledger
            .create_backtest(
                params.strategy_id,
                &symbol,
                timeframe.as_str(),
                params.start_ms,
                params.end_ms,
                params.initial_balance,
                params.fee_pct,
            )
            .await?;

        tokio::spawn(backtest::run_backtest(
            self.ledger.clone(),
            self.exchange.clone(),
            self.bus.clone(),
            backtest_id,
            cfg,
            symbol,
            timeframe,
            params,
        ));

        Ok(backtest_id)
    }

    pub async fn get_backtest(&self, id: i64) -> EngineResult<Option<BacktestRecord>> {
        self.ledger.get_backtest(id).await
    }

    pub async fn list_backtests(&self) -> EngineResult<Vec<BacktestRecord>> {
        self.ledger.list_backtests().await
    }

    pub async fn delete_backtest(&self, id: i64) -> EngineResult<()> {
        self.ledger.delete_backtest(id).await
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("live_strategies", &self.strategies.read().len())
            .finish()
    }
}

// =============================================================================
// Tests — scenario coverage for the tick runner and the state machine
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineResult;
    use crate::events::Topic;
    use crate::types::{AccountBalance, Side, Ticker, VenuePosition};
    use async_trait::async_trait;
    use serde_json::json;

    // ---------------------------------------------------------------------
    // Mock exchange: fills at the currently scripted price
    // ---------------------------------------------------------------------

    struct MockExchange {
        price: parking_lot::RwLock<f64>,
        time: parking_lot::RwLock<i64>,
        position: parking_lot::Mutex<Option<(Side, f64)>>,
        balance: parking_lot::RwLock<f64>,
        /// Pre-existing position handed to the first fetch_position call.
        seed_position: parking_lot::Mutex<Option<VenuePosition>>,
    }

    impl MockExchange {
        fn new(price: f64) -> Self {
            Self {
                price: parking_lot::RwLock::new(price),
                time: parking_lot::RwLock::new(1_000),
                position: parking_lot::Mutex::new(None),
                balance: parking_lot::RwLock::new(10_000.0),
                seed_position: parking_lot::Mutex::new(None),
            }
        }

        fn set_price(&self, price: f64) {
            *self.price.write() = price;
            *self.time.write() += 1_000;
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        async fn configure_leverage(&self, _symbol: &str, _leverage: u32) -> EngineResult<()> {
            Ok(())
        }

        async fn fetch_ticker(&self, _symbol: &str) -> EngineResult<Ticker> {
            let price = *self.price.read();
            Ok(Ticker {
                bid: price,
                ask: price,
                last: price,
                mark: price,
                timestamp: *self.time.read(),
            })
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: u32,
        ) -> EngineResult<Vec<Bar>> {
            Ok(Vec::new())
        }

        async fn open_market(
            &self,
            _symbol: &str,
            side: Side,
            notional: f64,
        ) -> EngineResult<Fill> {
            let price = *self.price.read();
            let qty = notional / price;
            let mut position = self.position.lock();
            match position.take() {
                None => *position = Some((side, qty)),
                Some((held, total)) if held == side => *position = Some((held, total + qty)),
                Some(_) => panic!("mock holds opposite side"),
            }
            Ok(Fill {
                price,
                qty,
                timestamp: *self.time.read(),
            })
        }

        async fn reduce_market(&self, _symbol: &str, side: Side, qty: f64) -> EngineResult<Fill> {
            let price = *self.price.read();
            let mut position = self.position.lock();
            if let Some((held, total)) = position.take() {
                assert_eq!(held, side);
                let remaining = total - qty;
                if remaining > 1e-12 {
                    *position = Some((held, remaining));
                }
            }
            Ok(Fill {
                price,
                qty,
                timestamp: *self.time.read(),
            })
        }

        async fn close_market(&self, symbol: &str, side: Side) -> EngineResult<Fill> {
            let qty = self
                .position
                .lock()
                .as_ref()
                .map(|(_, qty)| *qty)
                .unwrap_or(0.0);
            if qty <= 0.0 {
                // Closing a seeded (reconciliation) position.
                let seeded = self.seed_position.lock().take();
                let qty = seeded.map(|p| p.qty).unwrap_or(0.0);
                return Ok(Fill {
                    price: *self.price.read(),
                    qty,
                    timestamp: *self.time.read(),
                });
            }
            self.reduce_market(symbol, side, qty).await
        }

        async fn fetch_position(&self, symbol: &str) -> EngineResult<Option<VenuePosition>> {
            if let Some(seeded) = self.seed_position.lock().clone() {
                return Ok(Some(seeded));
            }
            let held = *self.position.lock();
            Ok(held.map(|(side, qty)| VenuePosition {
                symbol: symbol.to_string(),
                side,
                entry_price: *self.price.read(),
                qty,
                leverage: 1,
                unrealized_pnl: 0.0,
            }))
        }

        async fn fetch_balance(&self) -> EngineResult<AccountBalance> {
            let total = *self.balance.read();
            Ok(AccountBalance {
                total,
                free: total,
                used: 0.0,
            })
        }
    }

    // ---------------------------------------------------------------------
    // Harness
    // ---------------------------------------------------------------------

    fn martingale_doc(max_additions: u32) -> serde_json::Value {
        json!({
            "kernel": "martingale",
            "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 10},
            "risk": {"stopLossPercent": 10.0, "takeProfitPercent": 50.0,
                     "maxLossPercent": 90.0, "maxAdditions": max_additions},
            "monitoring": {"checkIntervalSeconds": 0.01},
            "martingale": {"initialPosition": 200.0, "multiplier": 2.0,
                           "maxAdditions": max_additions},
            "trigger": {"priceDropPercent": 5.0, "startImmediately": true}
        })
    }

    struct Harness {
        deps: RunnerDeps,
        exchange: Arc<MockExchange>,
        cfg: StrategyConfig,
        kernel: Kernel,
        state: RunState,
        handle: Arc<StrategyHandle>,
    }

    async fn harness(doc: serde_json::Value, start_price: f64) -> Harness {
        let ledger = Ledger::open_in_memory().unwrap();
        let strategy_id = ledger
            .create_strategy("s", "", StrategyKind::Config, &doc)
            .await
            .unwrap();
        let run_id = ledger.open_run(strategy_id, 10_000.0).await.unwrap();

        let exchange = Arc::new(MockExchange::new(start_price));
        let cfg = StrategyConfig::parse(&doc).unwrap();
        let kernel = Kernel::from_config(&cfg).unwrap();
        let (handle, _stop_rx, _cmd_rx) = StrategyHandle::new(strategy_id, run_id);

        let state = RunState {
            strategy_id,
            run_id,
            symbol: cfg.trading.symbol.clone(),
            leverage: cfg.trading.leverage,
            policy: RiskPolicy::from_config(&cfg),
            start_balance: 10_000.0,
            counters: RunCounters::default(),
            position: None,
            last_trade_at: None,
            consecutive_errors: 0,
        };

        Harness {
            deps: RunnerDeps {
                ledger,
                exchange: exchange.clone() as Arc<dyn ExchangeAdapter>,
                bus: Arc::new(EventBus::new()),
            },
            exchange,
            cfg,
            kernel,
            state,
            handle,
        }
    }

    impl Harness {
        async fn tick(&mut self) -> runner::TickOutcome {
            runner::run_tick(
                &self.deps,
                &self.cfg,
                &mut self.kernel,
                &mut self.state,
                &self.handle,
            )
            .await
        }

        async fn run_trades(&self) -> Vec<TradeRecord> {
            self.deps
                .ledger
                .list_run_trades(self.state.run_id)
                .await
                .unwrap()
        }
    }

    /// Replay a run's trades in order and compare against the persisted
    /// position (position-consistency invariant).
    fn replay_position(trades: &[TradeRecord], leverage: u32) -> Option<Position> {
        let mut position: Option<Position> = None;
        for trade in trades {
            let fill = Fill {
                price: trade.price,
                qty: trade.qty,
                timestamp: trade.executed_at,
            };
            match trade.kind {
                TradeKind::Open => {
                    position = Some(Position::open(&trade.symbol, trade.side, &fill, leverage))
                }
                TradeKind::Add => position.as_mut().unwrap().apply_add(&fill),
                TradeKind::Close => {
                    let pos = position.as_mut().unwrap();
                    pos.apply_close(&fill);
                    if pos.is_flat() {
                        position = None;
                    }
                }
            }
        }
        position
    }

    // ---------------------------------------------------------------------
    // S1 — martingale opens then adds on the 5% drop
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn s1_martingale_open_then_add() {
        let mut h = harness(martingale_doc(5), 50_000.0).await;

        h.tick().await; // 50 000: open 200
        for price in [49_500.0, 48_500.0] {
            h.exchange.set_price(price);
            h.tick().await;
        }
        h.exchange.set_price(47_500.0);
        h.tick().await; // 5% below extreme: add 400

        let trades = h.run_trades().await;
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].kind, TradeKind::Open);
        assert_eq!(trades[0].price, 50_000.0);
        assert!((trades[0].qty - 200.0 / 50_000.0).abs() < 1e-12);
        assert_eq!(trades[1].kind, TradeKind::Add);
        assert_eq!(trades[1].price, 47_500.0);
        assert!((trades[1].qty - 400.0 / 47_500.0).abs() < 1e-12);

        // Position consistency: replaying the trades matches the stored row.
        let stored = h
            .deps
            .ledger
            .get_position(h.state.run_id)
            .await
            .unwrap()
            .unwrap();
        let replayed = replay_position(&trades, 10).unwrap();
        assert!((stored.entry_price - replayed.entry_price).abs() < 1e-9);
        assert!((stored.qty - replayed.qty).abs() < 1e-12);
        assert_eq!(stored.side, replayed.side);
    }

    // ---------------------------------------------------------------------
    // S2 — max additions denied with an event, no trade
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn s2_max_additions_denied() {
        let mut h = harness(martingale_doc(2), 50_000.0).await;
        let mut errors = h.deps.bus.subscribe(&[Topic::Error], 32);

        h.tick().await; // open at 50 000
        for price in [47_500.0, 45_125.0, 42_868.75] {
            h.exchange.set_price(price);
            h.tick().await; // three successive 5% triggers
        }

        let trades = h.run_trades().await;
        // Exactly the open plus two adds; the third trigger was denied.
        assert_eq!(trades.len(), 3);
        assert_eq!(
            trades.iter().filter(|t| t.kind == TradeKind::Add).count(),
            2
        );

        let mut saw_denial = false;
        while let Ok(event) = errors.rx.try_recv() {
            if let Event::Error { kind, .. } = event {
                if kind == "risk_denied" {
                    saw_denial = true;
                }
            }
        }
        assert!(saw_denial, "expected a risk_denied event");
    }

    // ---------------------------------------------------------------------
    // S3 — stop-loss force-close within one tick
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn s3_stop_loss_force_close() {
        let mut h = harness(martingale_doc(5), 50_000.0).await;

        h.tick().await; // open at 50 000
        h.exchange.set_price(44_500.0); // 11% adverse vs 10% stop
        h.tick().await;

        let trades = h.run_trades().await;
        assert_eq!(trades.len(), 2);
        let close = &trades[1];
        assert_eq!(close.kind, TradeKind::Close);
        assert_eq!(close.price, 44_500.0);
        let expected_pnl = (44_500.0 - 50_000.0) * (200.0 / 50_000.0);
        assert!((close.pnl.unwrap() - expected_pnl).abs() < 1e-9);

        // Position is gone, counters reflect the losing close.
        assert!(h.state.position.is_none());
        assert!(h
            .deps
            .ledger
            .get_position(h.state.run_id)
            .await
            .unwrap()
            .is_none());
        let run = h.deps.ledger.get_run(h.state.run_id).await.unwrap().unwrap();
        assert_eq!(run.counters.total_trades, 2);
        assert_eq!(run.counters.loss_trades, 1);
    }

    // ---------------------------------------------------------------------
    // Max-loss ends the run
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn max_loss_is_terminal() {
        let doc = json!({
            "kernel": "martingale",
            "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 10},
            "risk": {"stopLossPercent": 60.0, "takeProfitPercent": 90.0, "maxLossPercent": 1.0},
            "martingale": {"initialPosition": 5000.0, "multiplier": 2.0, "maxAdditions": 0},
            "trigger": {"priceDropPercent": 5.0, "startImmediately": true}
        });
        let mut h = harness(doc, 50_000.0).await;

        h.tick().await; // open 5000 notional on a 10 000 balance
        h.exchange.set_price(48_000.0); // -4% price => -200 on 10 000 (2% > 1%)
        let outcome = h.tick().await;
        assert!(matches!(
            outcome,
            runner::TickOutcome::Terminal(RunStatus::MaxLoss)
        ));
        // Position flattened by the terminal force-close.
        assert!(h.state.position.is_none());
    }

    // ---------------------------------------------------------------------
    // Consecutive recoverable errors flip the run to Error
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn kernel_error_threshold_ends_run() {
        // A DCA kernel with no ticker errors every tick; emulate by breaking
        // the mock's price to a NaN-free but position-less flow: instead use
        // a mean-reversion kernel with an empty bar feed, which simply
        // holds. So drive the threshold through martingale with a zero
        // price, which run_once rejects as recoverable.
        let mut h = harness(martingale_doc(5), 50_000.0).await;
        h.exchange.set_price(0.0);

        let mut outcome = runner::TickOutcome::Continue;
        for _ in 0..runner::KERNEL_ERROR_THRESHOLD {
            outcome = h.tick().await;
        }
        assert!(matches!(
            outcome,
            runner::TickOutcome::Terminal(RunStatus::Error)
        ));
    }

    // ---------------------------------------------------------------------
    // S4 — stop with close_positions through the full supervisor
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn s4_stop_closes_position_and_run() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        let bus = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(
            ledger.clone(),
            exchange.clone() as Arc<dyn ExchangeAdapter>,
            bus,
        )
        .with_stop_timeout(Duration::from_secs(5));

        let strategy_id = supervisor
            .create_strategy("mart", "", StrategyKind::Config, &martingale_doc(5))
            .await
            .unwrap();
        let run_id = supervisor.start(strategy_id).await.unwrap();

        // Let the loop tick at least once and open the position.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !ledger.list_run_trades(run_id).await.unwrap().is_empty() {
                break;
            }
        }
        assert!(!ledger.list_run_trades(run_id).await.unwrap().is_empty());

        supervisor.stop(strategy_id, true).await.unwrap();

        // Stop safety: position cleared, close trade appended, run closed
        // with an ending balance.
        let trades = ledger.list_run_trades(run_id).await.unwrap();
        assert_eq!(trades.last().unwrap().kind, TradeKind::Close);
        assert!(ledger.get_position(run_id).await.unwrap().is_none());

        let run = ledger.get_run(run_id).await.unwrap().unwrap();
        assert!(run.stopped_at.is_some());
        assert!(run.end_balance.is_some());
        assert_eq!(run.status, RunStatus::Completed);

        let record = ledger.get_strategy(strategy_id).await.unwrap().unwrap();
        assert_eq!(record.status, StrategyStatus::Stopped);

        // Single-open-run invariant held throughout.
        let open_runs: Vec<_> = ledger
            .list_runs(strategy_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.stopped_at.is_none())
            .collect();
        assert!(open_runs.is_empty());
    }

    // ---------------------------------------------------------------------
    // Reconciliation on start
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn reconcile_close_flattens_pre_existing_position() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        *exchange.seed_position.lock() = Some(VenuePosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 48_000.0,
            qty: 0.01,
            leverage: 10,
            unrealized_pnl: 20.0,
        });
        let bus = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(
            ledger.clone(),
            exchange.clone() as Arc<dyn ExchangeAdapter>,
            bus,
        );

        let strategy_id = supervisor
            .create_strategy("mart", "", StrategyKind::Config, &martingale_doc(5))
            .await
            .unwrap();
        supervisor.start(strategy_id).await.unwrap();

        // close_market consumed the seeded venue position.
        assert!(exchange.seed_position.lock().is_none());
        supervisor.stop(strategy_id, true).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_adopt_takes_over_position() {
        let doc = {
            let mut doc = martingale_doc(5);
            doc["trading"]["reconcileOnStart"] = json!("adopt");
            doc
        };
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        *exchange.seed_position.lock() = Some(VenuePosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 48_000.0,
            qty: 0.01,
            leverage: 10,
            unrealized_pnl: 20.0,
        });
        let bus = Arc::new(EventBus::new());
        let supervisor = Supervisor::new(
            ledger.clone(),
            exchange.clone() as Arc<dyn ExchangeAdapter>,
            bus,
        );

        let strategy_id = supervisor
            .create_strategy("mart", "", StrategyKind::Config, &doc)
            .await
            .unwrap();
        let run_id = supervisor.start(strategy_id).await.unwrap();

        // The adopted position is persisted with an opening trade.
        let trades = ledger.list_run_trades(run_id).await.unwrap();
        assert_eq!(trades[0].kind, TradeKind::Open);
        assert_eq!(trades[0].price, 48_000.0);
        let position = ledger.get_position(run_id).await.unwrap().unwrap();
        assert_eq!(position.entry_price, 48_000.0);
        assert!((position.qty - 0.01).abs() < 1e-12);

        // Note: adopt keeps the seeded position on the venue side.
        *exchange.seed_position.lock() = None;
        supervisor.stop(strategy_id, true).await.unwrap();
    }

    // ---------------------------------------------------------------------
    // Command-surface guards
    // ---------------------------------------------------------------------
    #[tokio::test]
    async fn code_strategies_refuse_to_start() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        let supervisor = Supervisor::new(
            ledger,
            exchange as Arc<dyn ExchangeAdapter>,
            Arc::new(EventBus::new()),
        );

        let id = supervisor
            .create_strategy("user", "", StrategyKind::Code, &json!({"source": "def run(): ..."}))
            .await
            .unwrap();
        let err = supervisor.start(id).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn double_start_rejected_and_edit_blocked_while_running() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        let supervisor = Supervisor::new(
            ledger,
            exchange as Arc<dyn ExchangeAdapter>,
            Arc::new(EventBus::new()),
        );

        let id = supervisor
            .create_strategy("mart", "", StrategyKind::Config, &martingale_doc(5))
            .await
            .unwrap();
        supervisor.start(id).await.unwrap();

        assert!(supervisor.start(id).await.is_err());
        assert!(supervisor
            .update_strategy(id, "x", "", &martingale_doc(5))
            .await
            .is_err());
        assert!(supervisor.delete_strategy(id).await.is_err());

        supervisor.stop(id, true).await.unwrap();
        supervisor
            .update_strategy(id, "x", "", &martingale_doc(5))
            .await
            .unwrap();
        supervisor.delete_strategy(id).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_rejected_at_create() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        let supervisor = Supervisor::new(
            ledger,
            exchange as Arc<dyn ExchangeAdapter>,
            Arc::new(EventBus::new()),
        );

        let err = supervisor
            .create_strategy("bad", "", StrategyKind::Config, &json!({"kernel": "martingale"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn backtest_without_bars_is_marked_failed() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0)); // fetch_bars: empty
        let supervisor = Supervisor::new(
            ledger.clone(),
            exchange as Arc<dyn ExchangeAdapter>,
            Arc::new(EventBus::new()),
        );

        let strategy_id = supervisor
            .create_strategy("mart", "", StrategyKind::Config, &martingale_doc(5))
            .await
            .unwrap();
        let backtest_id = supervisor
            .submit_backtest(BacktestParams {
                strategy_id,
                symbol: None,
                timeframe: Some(Timeframe::M1),
                start_ms: 0,
                end_ms: 3_600_000,
                initial_balance: 1_000.0,
                fee_pct: 0.04,
            })
            .await
            .unwrap();

        let mut record = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let current = supervisor.get_backtest(backtest_id).await.unwrap().unwrap();
            if matches!(
                current.status,
                crate::types::BacktestStatus::Failed | crate::types::BacktestStatus::Completed
            ) {
                record = Some(current);
                break;
            }
        }
        let record = record.expect("backtest never finished");
        assert_eq!(record.status, crate::types::BacktestStatus::Failed);
        assert!(record.error.unwrap().contains("no bars"));
    }

    #[tokio::test]
    async fn force_retrain_requires_running_strategy() {
        let ledger = Ledger::open_in_memory().unwrap();
        let exchange = Arc::new(MockExchange::new(50_000.0));
        let supervisor = Supervisor::new(
            ledger,
            exchange as Arc<dyn ExchangeAdapter>,
            Arc::new(EventBus::new()),
        );
        assert!(supervisor.force_retrain(99).await.is_err());
    }
}
