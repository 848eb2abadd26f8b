// =============================================================================
// DCA kernel — fixed-notional buys on a fixed cadence
// =============================================================================
//
// Requests an entry of `amountPerInterval` every `intervalSeconds` whenever
// price is at or below `priceCeiling`, until `maxInvestment` of notional has
// been committed. Intervals are measured against the venue clock so backtests
// replay on bar time.
// =============================================================================

use tracing::debug;

use crate::config::{DcaSection, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::types::{Side, TradeKind, TradeRecord};

use super::StrategyContext;

pub struct DcaKernel {
    cfg: DcaSection,
    side: Side,
    /// Notional committed so far this run.
    invested: f64,
    /// Venue time of the last buy, epoch ms.
    last_buy_at: Option<i64>,
}

impl DcaKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .dca
            .clone()
            .ok_or_else(|| EngineError::Config("dca section missing".into()))?;
        Ok(Self {
            cfg,
            side: config.trading.side,
            invested: 0.0,
            last_buy_at: None,
        })
    }

    pub async fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        self.invested = 0.0;
        self.last_buy_at = None;
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;
        let now = ctx
            .now_ms()
            .ok_or_else(|| EngineError::KernelRecoverable("no venue time this tick".into()))?;

        if price > self.cfg.price_ceiling {
            return Ok(());
        }

        if let Some(last) = self.last_buy_at {
            let interval_ms = self.cfg.interval_seconds as i64 * 1000;
            if now - last < interval_ms {
                return Ok(());
            }
        }

        if self.invested + self.cfg.amount_per_interval > self.cfg.max_investment {
            debug!(
                invested = self.invested,
                max = self.cfg.max_investment,
                "investment cap reached"
            );
            return Ok(());
        }

        let kind = if ctx.position.is_some() {
            TradeKind::Add
        } else {
            TradeKind::Open
        };
        debug!(price, kind = %kind, amount = self.cfg.amount_per_interval, "dca buy");
        ctx.request_trade(kind, self.side, self.cfg.amount_per_interval);
        Ok(())
    }

    pub fn on_trade(&mut self, trade: &TradeRecord) {
        match trade.kind {
            TradeKind::Open | TradeKind::Add => {
                self.invested += trade.price * trade.qty;
                self.last_buy_at = Some(trade.executed_at);
            }
            TradeKind::Close => {}
        }
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
    use crate::types::Ticker;
    use serde_json::json;
    use std::sync::Arc;

    fn config() -> StrategyConfig {
        StrategyConfig::parse(&json!({
            "kernel": "dca",
            "trading": {"symbol": "BTCUSDT"},
            "dca": {
                "amountPerInterval": 100.0,
                "intervalSeconds": 3600,
                "priceCeiling": 50000.0,
                "maxInvestment": 250.0
            }
        }))
        .unwrap()
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

    fn exchange() -> Arc<dyn ExchangeAdapter> {
        Arc::new(SimulatedExchange::new("BTCUSDT", Vec::new(), 0, 0.0))
    }

    fn buy(price: f64, qty: f64, ts: i64) -> TradeRecord {
        TradeRecord {
            id: 1,
            strategy_id: 1,
            run_id: 1,
            kind: TradeKind::Open,
            side: Side::Long,
            symbol: "BTCUSDT".into(),
            price,
            qty,
            pnl: None,
            executed_at: ts,
        }
    }

    #[tokio::test]
    async fn buys_below_ceiling_only() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = DcaKernel::new(&cfg).unwrap();

        // Above the ceiling: nothing.
        let t = ticker(51_000.0, 0);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());

        // At the ceiling: buy.
        let t = ticker(50_000.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        assert_eq!(reqs[0].notional, Some(100.0));
    }

    #[tokio::test]
    async fn respects_interval() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = DcaKernel::new(&cfg).unwrap();
        kernel.on_trade(&buy(49_000.0, 100.0 / 49_000.0, 0));

        // 30 minutes later: still inside the hour.
        let t = ticker(48_000.0, 30 * 60 * 1000);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());

        // 61 minutes later: buy again.
        let t = ticker(48_000.0, 61 * 60 * 1000);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_requests().len(), 1);
    }

    #[tokio::test]
    async fn stops_at_max_investment() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = DcaKernel::new(&cfg).unwrap();

        // Two fills of 100 notional each: 200 invested, cap 250 — a third
        // 100-notional buy would breach the cap.
        kernel.on_trade(&buy(50_000.0, 100.0 / 50_000.0, 0));
        kernel.on_trade(&buy(50_000.0, 100.0 / 50_000.0, 3_600_000));

        let t = ticker(49_000.0, 2 * 3_600_000 + 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }
}
