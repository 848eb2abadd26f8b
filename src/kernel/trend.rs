// =============================================================================
// Trend-following kernel — fast/slow moving-average cross
// =============================================================================
//
// Each tick recomputes the fast and slow SMAs over closed bars. A fast cross
// above the slow opens a long; the reverse cross closes it and opens a short.
// The previous fast/slow relation is seeded during initialize so the first
// tick never trades on a stale "cross".
// =============================================================================

use tracing::debug;

use crate::config::{StrategyConfig, TrendSection};
use crate::error::{EngineError, EngineResult};
use crate::indicators::calculate_sma;
use crate::types::{Side, TradeKind, TradeRecord};

use super::StrategyContext;

pub struct TrendKernel {
    cfg: TrendSection,
    /// `Some(true)` when the fast SMA was last seen above the slow SMA.
    fast_above: Option<bool>,
}

impl TrendKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .trend
            .clone()
            .ok_or_else(|| EngineError::Config("trend section missing".into()))?;
        Ok(Self {
            cfg,
            fast_above: None,
        })
    }

    pub async fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        self.fast_above = self.current_relation(ctx).await?;
        debug!(fast_above = ?self.fast_above, "trend relation seeded");
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let Some(fast_above) = self.current_relation(ctx).await? else {
            // Still warming up.
            return Ok(());
        };

        let crossed = match self.fast_above {
            Some(prev) => prev != fast_above,
            // First complete reading: record it, do not trade.
            None => false,
        };
        self.fast_above = Some(fast_above);

        if !crossed {
            return Ok(());
        }

        let target = if fast_above { Side::Long } else { Side::Short };
        debug!(target = %target, "moving-average cross");

        if let Some(pos) = ctx.position {
            if pos.side == target {
                return Ok(());
            }
            ctx.request_close(pos.side);
        }
        ctx.request_trade(TradeKind::Open, target, self.cfg.order_notional);
        Ok(())
    }

    pub fn on_trade(&mut self, _trade: &TradeRecord) {}

    /// `Some(fast > slow)` once both averages have enough bars.
    async fn current_relation(&self, ctx: &StrategyContext<'_>) -> EngineResult<Option<bool>> {
        let bars = ctx
            .exchange
            .fetch_bars(
                &ctx.config.trading.symbol,
                self.cfg.timeframe,
                (self.cfg.slow_period + 2) as u32,
            )
            .await?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let fast = calculate_sma(&closes, self.cfg.fast_period).last().copied();
        let slow = calculate_sma(&closes, self.cfg.slow_period).last().copied();
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return Ok(None);
        };
        Ok(Some(fast > slow))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimulatedExchange;
    use crate::exchange::ExchangeAdapter;
    use crate::position::Position;
    use crate::types::{Bar, Fill, Ticker};
    use serde_json::json;
    use std::sync::Arc;

    fn config() -> StrategyConfig {
        StrategyConfig::parse(&json!({
            "kernel": "trend",
            "trading": {"symbol": "BTCUSDT"},
            "trend": {"fastPeriod": 2, "slowPeriod": 4, "timeframe": "1m", "orderNotional": 100.0}
        }))
        .unwrap()
    }

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                open_time: i as i64 * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                close_time: (i as i64 + 1) * 60_000 - 1,
            })
            .collect()
    }

    fn ticker(price: f64, ts: i64) -> Ticker {
        Ticker {
            bid: price,
            ask: price,
            last: price,
            mark: price,
            timestamp: ts,
        }
    }

    /// Simulator whose cursor sits at the end of `closes`.
    fn exchange_at_end(closes: &[f64]) -> Arc<dyn ExchangeAdapter> {
        let n = closes.len();
        let sim = SimulatedExchange::new("BTCUSDT", bars(closes), n, 1000.0);
        Arc::new(sim)
    }

    #[tokio::test]
    async fn golden_cross_opens_long() {
        let cfg = config();
        let mut kernel = TrendKernel::new(&cfg).unwrap();

        // Downtrend history: fast below slow.
        let ex = exchange_at_end(&[110.0, 108.0, 106.0, 104.0, 102.0]);
        let t = ticker(102.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.initialize(&mut ctx).await.unwrap();
        assert_eq!(kernel.fast_above, Some(false));

        // Sharp reversal: fast crosses above slow.
        let ex = exchange_at_end(&[104.0, 102.0, 110.0, 120.0]);
        let t = ticker(120.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        assert_eq!(reqs[0].side, Side::Long);
    }

    #[tokio::test]
    async fn death_cross_flips_long_to_short() {
        let cfg = config();
        let mut kernel = TrendKernel::new(&cfg).unwrap();
        kernel.fast_above = Some(true);

        let pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 110.0,
                qty: 1.0,
                timestamp: 0,
            },
            1,
        );

        // Collapse: fast drops below slow.
        let ex = exchange_at_end(&[120.0, 118.0, 100.0, 90.0]);
        let t = ticker(90.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].kind, TradeKind::Close);
        assert_eq!(reqs[0].side, Side::Long);
        assert_eq!(reqs[1].kind, TradeKind::Open);
        assert_eq!(reqs[1].side, Side::Short);
    }

    #[tokio::test]
    async fn no_trade_without_a_cross() {
        let cfg = config();
        let mut kernel = TrendKernel::new(&cfg).unwrap();
        kernel.fast_above = Some(true);

        // Uptrend continues: fast stays above slow.
        let ex = exchange_at_end(&[100.0, 104.0, 108.0, 112.0]);
        let t = ticker(112.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn warmup_produces_no_requests() {
        let cfg = config();
        let mut kernel = TrendKernel::new(&cfg).unwrap();

        let ex = exchange_at_end(&[100.0, 101.0]); // fewer than slow_period
        let t = ticker(101.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.initialize(&mut ctx).await.unwrap();
        assert_eq!(kernel.fast_above, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }
}
