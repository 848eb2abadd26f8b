// =============================================================================
// Strategy kernels — the interchangeable decision units of the supervisor
// =============================================================================
//
// A kernel is a tagged variant behind the capability set
// {initialize, run_once, shutdown, on_trade}. Per-kernel state lives in the
// variant payload; everything shared flows through the explicit
// `StrategyContext` handed to each call.
//
// `run_once` is exactly one decision step. It must be idempotent with respect
// to exchange state: two back-to-back calls without a price change must not
// request the same trade twice. Kernels signal intent through
// `ctx.request_trade(...)`; the supervisor executes the queued requests
// inline, in order, within the same tick, re-evaluating the risk gate for
// each and routing every resulting fill back through `on_trade`.
// =============================================================================

pub mod dca;
pub mod grid;
pub mod llm;
pub mod martingale;
pub mod mean_reversion;
pub mod ml;
pub mod trend;

use std::sync::Arc;

use crate::config::{KernelId, StrategyConfig};
use crate::error::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::position::Position;
use crate::types::{Side, Ticker, TradeKind, TradeRecord};

// ---------------------------------------------------------------------------
// Trade requests
// ---------------------------------------------------------------------------

/// A trade a kernel wants executed. Open/add are sized in quote currency;
/// close either flattens (`qty == None`) or exits an exact contract quantity
/// (grid units).
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub kind: TradeKind,
    pub side: Side,
    pub notional: Option<f64>,
    pub qty: Option<f64>,
}

impl TradeRequest {
    pub fn open(side: Side, notional: f64) -> Self {
        Self {
            kind: TradeKind::Open,
            side,
            notional: Some(notional),
            qty: None,
        }
    }

    pub fn add(side: Side, notional: f64) -> Self {
        Self {
            kind: TradeKind::Add,
            side,
            notional: Some(notional),
            qty: None,
        }
    }

    /// Flat-to-zero close.
    pub fn close(side: Side) -> Self {
        Self {
            kind: TradeKind::Close,
            side,
            notional: None,
            qty: None,
        }
    }

    /// Partial close of an exact contract quantity.
    pub fn partial_close(side: Side, qty: f64) -> Self {
        Self {
            kind: TradeKind::Close,
            side,
            notional: None,
            qty: Some(qty),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a kernel may see during one call. The position is a read-only
/// snapshot; mutation happens in the supervisor when requests execute.
pub struct StrategyContext<'a> {
    pub strategy_id: i64,
    pub config: &'a StrategyConfig,
    pub exchange: &'a Arc<dyn ExchangeAdapter>,
    pub ticker: Option<&'a Ticker>,
    pub position: Option<&'a Position>,
    requests: Vec<TradeRequest>,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        strategy_id: i64,
        config: &'a StrategyConfig,
        exchange: &'a Arc<dyn ExchangeAdapter>,
    ) -> Self {
        Self {
            strategy_id,
            config,
            exchange,
            ticker: None,
            position: None,
            requests: Vec::new(),
        }
    }

    pub fn with_market(mut self, ticker: &'a Ticker, position: Option<&'a Position>) -> Self {
        self.ticker = Some(ticker);
        self.position = position;
        self
    }

    /// Queue a trade for the supervisor to execute after `run_once` returns.
    pub fn request_trade(&mut self, kind: TradeKind, side: Side, notional: f64) {
        self.requests.push(TradeRequest {
            kind,
            side,
            notional: Some(notional),
            qty: None,
        });
    }

    /// Queue a flat-to-zero close.
    pub fn request_close(&mut self, side: Side) {
        self.requests.push(TradeRequest::close(side));
    }

    /// Queue a partial close of an exact contract quantity.
    pub fn request_partial_close(&mut self, side: Side, qty: f64) {
        self.requests.push(TradeRequest::partial_close(side, qty));
    }

    pub fn take_requests(&mut self) -> Vec<TradeRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Last traded price of the current tick.
    pub fn price(&self) -> Option<f64> {
        self.ticker.map(|t| t.last)
    }

    /// Venue clock of the current tick, epoch milliseconds. Kernels measure
    /// their intervals against this (not the wall clock) so backtests replay
    /// identically.
    pub fn now_ms(&self) -> Option<i64> {
        self.ticker.map(|t| t.timestamp)
    }
}

// ---------------------------------------------------------------------------
// Oracle output shared by the ML and LLM kernels
// ---------------------------------------------------------------------------

/// A directional prediction with confidence in [0, 1]. `direction == None`
/// means hold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub direction: Option<Side>,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// The kernel itself
// ---------------------------------------------------------------------------

pub enum Kernel {
    Martingale(martingale::MartingaleKernel),
    Dca(dca::DcaKernel),
    Grid(grid::GridKernel),
    Trend(trend::TrendKernel),
    MeanReversion(mean_reversion::MeanReversionKernel),
    Ml(ml::MlKernel),
    Llm(llm::LlmKernel),
}

impl Kernel {
    /// Build the kernel selected by the configuration document. Each variant
    /// clones its typed section; a missing section was already rejected by
    /// `StrategyConfig::parse`.
    pub fn from_config(cfg: &StrategyConfig) -> EngineResult<Self> {
        Ok(match cfg.kernel {
            KernelId::Martingale => Self::Martingale(martingale::MartingaleKernel::new(cfg)?),
            KernelId::Dca => Self::Dca(dca::DcaKernel::new(cfg)?),
            KernelId::Grid => Self::Grid(grid::GridKernel::new(cfg)?),
            KernelId::Trend => Self::Trend(trend::TrendKernel::new(cfg)?),
            KernelId::MeanReversion => {
                Self::MeanReversion(mean_reversion::MeanReversionKernel::new(cfg)?)
            }
            KernelId::Ml => Self::Ml(ml::MlKernel::new(cfg)?),
            KernelId::Llm => Self::Llm(llm::LlmKernel::new(cfg)?),
        })
    }

    pub fn id(&self) -> KernelId {
        match self {
            Self::Martingale(_) => KernelId::Martingale,
            Self::Dca(_) => KernelId::Dca,
            Self::Grid(_) => KernelId::Grid,
            Self::Trend(_) => KernelId::Trend,
            Self::MeanReversion(_) => KernelId::MeanReversion,
            Self::Ml(_) => KernelId::Ml,
            Self::Llm(_) => KernelId::Llm,
        }
    }

    /// Called once per run before any tick: configures leverage, then primes
    /// kernel state (history buffers, model, client).
    pub async fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        ctx.exchange
            .configure_leverage(&ctx.config.trading.symbol, ctx.config.trading.leverage)
            .await?;

        match self {
            Self::Martingale(k) => k.initialize(ctx).await,
            Self::Dca(k) => k.initialize(ctx).await,
            Self::Grid(k) => k.initialize(ctx).await,
            Self::Trend(k) => k.initialize(ctx).await,
            Self::MeanReversion(k) => k.initialize(ctx).await,
            Self::Ml(k) => k.initialize(ctx).await,
            Self::Llm(k) => k.initialize(ctx).await,
        }
    }

    /// Exactly one decision step.
    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        match self {
            Self::Martingale(k) => k.run_once(ctx).await,
            Self::Dca(k) => k.run_once(ctx).await,
            Self::Grid(k) => k.run_once(ctx).await,
            Self::Trend(k) => k.run_once(ctx).await,
            Self::MeanReversion(k) => k.run_once(ctx).await,
            Self::Ml(k) => k.run_once(ctx).await,
            Self::Llm(k) => k.run_once(ctx).await,
        }
    }

    /// Release external resources. Position liquidation is the supervisor's
    /// job, not the kernel's.
    pub async fn shutdown(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        reason: &str,
    ) -> EngineResult<()> {
        tracing::debug!(kernel = %self.id(), reason, "kernel shutdown");
        Ok(())
    }

    /// Observe a fill appended for this run (including force-closes).
    pub fn on_trade(&mut self, trade: &TradeRecord) {
        match self {
            Self::Martingale(k) => k.on_trade(trade),
            Self::Dca(k) => k.on_trade(trade),
            Self::Grid(k) => k.on_trade(trade),
            Self::Trend(k) => k.on_trade(trade),
            Self::MeanReversion(k) => k.on_trade(trade),
            Self::Ml(k) => k.on_trade(trade),
            Self::Llm(k) => k.on_trade(trade),
        }
    }

    /// Request a model rebuild on the next tick. Idempotent; a no-op for
    /// kernels without a model.
    pub fn force_retrain(&mut self) {
        if let Self::Ml(k) = self {
            k.force_retrain();
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kernel({})", self.id())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_config_builds_matching_variant() {
        let doc = json!({
            "kernel": "grid",
            "trading": {"symbol": "BTCUSDT"},
            "grid": {"priceLow": 40000.0, "priceHigh": 60000.0, "levels": 5, "orderNotional": 100.0}
        });
        let cfg = StrategyConfig::parse(&doc).unwrap();
        let kernel = Kernel::from_config(&cfg).unwrap();
        assert_eq!(kernel.id(), KernelId::Grid);
    }

    #[test]
    fn requests_queue_in_order() {
        let doc = json!({
            "kernel": "dca",
            "trading": {"symbol": "BTCUSDT"},
            "dca": {"amountPerInterval": 50.0, "intervalSeconds": 60, "priceCeiling": 100000.0,
                    "maxInvestment": 500.0}
        });
        let cfg = StrategyConfig::parse(&doc).unwrap();
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(crate::exchange::sim::SimulatedExchange::new(
            "BTCUSDT",
            Vec::new(),
            0,
            0.0,
        ));
        let mut ctx = StrategyContext::new(1, &cfg, &exchange);
        ctx.request_trade(TradeKind::Open, Side::Long, 50.0);
        ctx.request_close(Side::Long);
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        assert_eq!(reqs[1].kind, TradeKind::Close);
        assert!(ctx.take_requests().is_empty());
    }
}
