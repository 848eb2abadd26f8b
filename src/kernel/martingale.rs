// =============================================================================
// Martingale kernel — average down on triggered drawdowns
// =============================================================================
//
// Tracks the run's extreme price: highest since open for longs, lowest for
// shorts. When the extreme-to-current move crosses `priceDropPercent` the
// kernel requests an entry, sized
//
//   initialPosition * multiplier^additionCount
//
// and the extreme resets to the fill price; the price must drift and re-cross
// before the next addition. The risk gate owns the `maxAdditions` cap so a
// denied addition still shows up as a risk event.
// =============================================================================

use tracing::debug;

use crate::config::{MartingaleSection, StrategyConfig, TriggerSection};
use crate::error::{EngineError, EngineResult};
use crate::types::{Side, TradeKind, TradeRecord};

use super::StrategyContext;

pub struct MartingaleKernel {
    cfg: MartingaleSection,
    trigger: TriggerSection,
    side: Side,
    /// Highest price seen since the last fill (lowest for shorts).
    extreme: Option<f64>,
}

impl MartingaleKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .martingale
            .clone()
            .ok_or_else(|| EngineError::Config("martingale section missing".into()))?;
        let trigger = config
            .trigger
            .clone()
            .ok_or_else(|| EngineError::Config("trigger section missing".into()))?;
        Ok(Self {
            cfg,
            trigger,
            side: config.trading.side,
            extreme: None,
        })
    }

    pub async fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        self.extreme = None;
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;
        if price <= 0.0 {
            return Err(EngineError::KernelRecoverable(format!(
                "non-positive price {price}"
            )));
        }

        // Maintain the extreme: highest since the last fill for longs,
        // lowest for shorts.
        let extreme = match self.extreme {
            None => {
                self.extreme = Some(price);
                price
            }
            Some(prev) => {
                let updated = match self.side {
                    Side::Long => prev.max(price),
                    Side::Short => prev.min(price),
                };
                self.extreme = Some(updated);
                updated
            }
        };

        match ctx.position {
            None => {
                if self.trigger.start_immediately {
                    debug!(price, "opening initial martingale position immediately");
                    ctx.request_trade(TradeKind::Open, self.side, self.cfg.initial_position);
                } else if self.move_pct(extreme, price) >= self.trigger.price_drop_percent {
                    debug!(price, extreme, "trigger crossed, opening initial position");
                    ctx.request_trade(TradeKind::Open, self.side, self.cfg.initial_position);
                }
            }
            Some(pos) => {
                if self.move_pct(extreme, price) >= self.trigger.price_drop_percent {
                    // Sizing grows with each addition already applied.
                    let exponent = pos.additions as i32 + 1;
                    let notional = self.cfg.initial_position * self.cfg.multiplier.powi(exponent);
                    debug!(
                        price,
                        extreme,
                        additions = pos.additions,
                        notional,
                        "trigger crossed, requesting addition"
                    );
                    ctx.request_trade(TradeKind::Add, self.side, notional);
                }
            }
        }

        Ok(())
    }

    pub fn on_trade(&mut self, trade: &TradeRecord) {
        match trade.kind {
            // Every fill resets the trigger reference to the fill price.
            TradeKind::Open | TradeKind::Add => self.extreme = Some(trade.price),
            TradeKind::Close => self.extreme = None,
        }
    }

    /// Adverse move from the extreme toward the current price, in percent.
    fn move_pct(&self, extreme: f64, price: f64) -> f64 {
        if extreme <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Long => (extreme - price) / extreme * 100.0,
            Side::Short => (price - extreme) / extreme * 100.0,
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
    use crate::position::Position;
    use crate::types::{Fill, Ticker};
    use serde_json::json;
    use std::sync::Arc;

    fn config(start_immediately: bool) -> StrategyConfig {
        StrategyConfig::parse(&json!({
            "kernel": "martingale",
            "trading": {"symbol": "BTCUSDT", "side": "long", "leverage": 10},
            "martingale": {"initialPosition": 200.0, "multiplier": 2.0, "maxAdditions": 5},
            "trigger": {"priceDropPercent": 5.0, "startImmediately": start_immediately}
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

    fn trade(kind: TradeKind, price: f64, qty: f64) -> TradeRecord {
        TradeRecord {
            id: 1,
            strategy_id: 1,
            run_id: 1,
            kind,
            side: Side::Long,
            symbol: "BTCUSDT".into(),
            price,
            qty,
            pnl: None,
            executed_at: 0,
        }
    }

    #[tokio::test]
    async fn opens_immediately_then_adds_on_five_percent_drop() {
        let cfg = config(true);
        let ex = exchange();
        let mut kernel = MartingaleKernel::new(&cfg).unwrap();

        // Tick 1 @ 50 000: open.
        let t1 = ticker(50_000.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t1, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        assert_eq!(reqs[0].notional, Some(200.0));

        kernel.on_trade(&trade(TradeKind::Open, 50_000.0, 0.004));
        let pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 50_000.0,
                qty: 0.004,
                timestamp: 1,
            },
            10,
        );

        // Ticks 2 and 3: 1% and 3% below the extreme — nothing.
        for (ts, price) in [(2, 49_500.0), (3, 48_500.0)] {
            let t = ticker(price, ts);
            let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
            kernel.run_once(&mut ctx).await.unwrap();
            assert!(ctx.take_requests().is_empty(), "no trade at {price}");
        }

        // Tick 4 @ 47 500: 5% below 50 000 — add sized 200 * 2^1 = 400.
        let t4 = ticker(47_500.0, 4);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t4, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Add);
        assert_eq!(reqs[0].notional, Some(400.0));
    }

    #[tokio::test]
    async fn extreme_resets_after_fill_so_no_double_trigger() {
        let cfg = config(true);
        let ex = exchange();
        let mut kernel = MartingaleKernel::new(&cfg).unwrap();
        kernel.on_trade(&trade(TradeKind::Open, 50_000.0, 0.004));

        let mut pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 50_000.0,
                qty: 0.004,
                timestamp: 1,
            },
            10,
        );

        // Drop to the trigger, fill the add, then repeat the same price: the
        // extreme is now 47 500 so the same tick must not re-trigger.
        let t = ticker(47_500.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_requests().len(), 1);

        kernel.on_trade(&trade(TradeKind::Add, 47_500.0, 0.008));
        pos.apply_add(&Fill {
            price: 47_500.0,
            qty: 0.008,
            timestamp: 2,
        });

        let t = ticker(47_500.0, 3);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn addition_sizing_grows_with_position_additions() {
        let cfg = config(true);
        let ex = exchange();
        let mut kernel = MartingaleKernel::new(&cfg).unwrap();
        kernel.on_trade(&trade(TradeKind::Add, 47_500.0, 0.008));

        let mut pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 50_000.0,
                qty: 0.004,
                timestamp: 1,
            },
            10,
        );
        pos.apply_add(&Fill {
            price: 47_500.0,
            qty: 0.008,
            timestamp: 2,
        });
        assert_eq!(pos.additions, 1);

        // Another 5% drop from the new extreme: 47 500 * 0.95 = 45 125.
        let t = ticker(45_125.0, 3);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].notional, Some(800.0)); // 200 * 2^2
    }

    #[tokio::test]
    async fn waits_for_drop_without_start_immediately() {
        let cfg = config(false);
        let ex = exchange();
        let mut kernel = MartingaleKernel::new(&cfg).unwrap();

        let t1 = ticker(50_000.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t1, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());

        // 5% below the tracked extreme triggers the first open.
        let t2 = ticker(47_500.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t2, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
    }

    #[tokio::test]
    async fn short_side_triggers_on_rallies() {
        let cfg = StrategyConfig::parse(&json!({
            "kernel": "martingale",
            "trading": {"symbol": "BTCUSDT", "side": "short"},
            "martingale": {"initialPosition": 100.0, "multiplier": 2.0, "maxAdditions": 3},
            "trigger": {"priceDropPercent": 5.0, "startImmediately": false}
        }))
        .unwrap();
        let ex = exchange();
        let mut kernel = MartingaleKernel::new(&cfg).unwrap();

        let t1 = ticker(50_000.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t1, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());

        // A 5% rally above the tracked low triggers the short entry.
        let t2 = ticker(52_500.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t2, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].side, Side::Short);
    }
}
