// =============================================================================
// Mean-reversion kernel — fade deviations from a moving-average baseline
// =============================================================================
//
// With no position: opens counter-trend when price deviates from the
// `period`-bar SMA by at least `deviationPct` (below baseline -> long, above
// -> short). With a position: closes when price returns to the baseline.
// =============================================================================

use tracing::debug;

use crate::config::{MeanReversionSection, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::sma::latest_sma;
use crate::types::{Side, TradeKind, TradeRecord};

use super::StrategyContext;

pub struct MeanReversionKernel {
    cfg: MeanReversionSection,
}

impl MeanReversionKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .mean_reversion
            .clone()
            .ok_or_else(|| EngineError::Config("meanReversion section missing".into()))?;
        Ok(Self { cfg })
    }

    pub async fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;

        let bars = ctx
            .exchange
            .fetch_bars(
                &ctx.config.trading.symbol,
                self.cfg.timeframe,
                (self.cfg.period + 1) as u32,
            )
            .await?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let Some(baseline) = latest_sma(&closes, self.cfg.period) else {
            return Ok(());
        };
        if baseline <= 0.0 {
            return Err(EngineError::KernelRecoverable(format!(
                "degenerate baseline {baseline}"
            )));
        }

        let deviation_pct = (price - baseline) / baseline * 100.0;

        match ctx.position {
            None => {
                if deviation_pct <= -self.cfg.deviation_pct {
                    debug!(price, baseline, deviation_pct, "fading dip");
                    ctx.request_trade(TradeKind::Open, Side::Long, self.cfg.order_notional);
                } else if deviation_pct >= self.cfg.deviation_pct {
                    debug!(price, baseline, deviation_pct, "fading spike");
                    ctx.request_trade(TradeKind::Open, Side::Short, self.cfg.order_notional);
                }
            }
            Some(pos) => {
                // Close once price is back at (or through) the baseline.
                let reverted = match pos.side {
                    Side::Long => price >= baseline,
                    Side::Short => price <= baseline,
                };
                if reverted {
                    debug!(price, baseline, side = %pos.side, "reverted to baseline");
                    ctx.request_close(pos.side);
                }
            }
        }

        Ok(())
    }

    pub fn on_trade(&mut self, _trade: &TradeRecord) {}
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
            "kernel": "meanReversion",
            "trading": {"symbol": "BTCUSDT"},
            "meanReversion": {"period": 4, "deviationPct": 2.0, "timeframe": "1m",
                              "orderNotional": 100.0}
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

    fn exchange_at_end(closes: &[f64]) -> Arc<dyn ExchangeAdapter> {
        let n = closes.len();
        Arc::new(SimulatedExchange::new("BTCUSDT", bars(closes), n, 1000.0))
    }

    #[tokio::test]
    async fn opens_long_on_dip_below_baseline() {
        let cfg = config();
        let mut kernel = MeanReversionKernel::new(&cfg).unwrap();

        // Baseline SMA(4) of the last four closes is 100; price 97 is -3%.
        let ex = exchange_at_end(&[100.0, 100.0, 100.0, 100.0]);
        let t = ticker(97.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].side, Side::Long);
    }

    #[tokio::test]
    async fn opens_short_on_spike_above_baseline() {
        let cfg = config();
        let mut kernel = MeanReversionKernel::new(&cfg).unwrap();

        let ex = exchange_at_end(&[100.0, 100.0, 100.0, 100.0]);
        let t = ticker(103.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].side, Side::Short);
    }

    #[tokio::test]
    async fn holds_inside_the_band() {
        let cfg = config();
        let mut kernel = MeanReversionKernel::new(&cfg).unwrap();

        let ex = exchange_at_end(&[100.0, 100.0, 100.0, 100.0]);
        let t = ticker(101.0, 1); // +1%, inside the 2% band
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn closes_long_on_reversion() {
        let cfg = config();
        let mut kernel = MeanReversionKernel::new(&cfg).unwrap();

        let pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 97.0,
                qty: 1.0,
                timestamp: 0,
            },
            1,
        );

        // Price back above the 100 baseline.
        let ex = exchange_at_end(&[100.0, 100.0, 100.0, 100.0]);
        let t = ticker(100.5, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Close);
    }

    #[tokio::test]
    async fn long_stays_open_below_baseline() {
        let cfg = config();
        let mut kernel = MeanReversionKernel::new(&cfg).unwrap();

        let pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 97.0,
                qty: 1.0,
                timestamp: 0,
            },
            1,
        );

        let ex = exchange_at_end(&[100.0, 100.0, 100.0, 100.0]);
        let t = ticker(98.5, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }
}
