// =============================================================================
// Grid kernel — stateful price levels between priceLow and priceHigh
// =============================================================================
//
// `levels` evenly spaced price lines divide [priceLow, priceHigh]. Each level
// holds at most one open unit of `orderNotional`:
//
//   - price crossing a level downward with the level empty  -> buy one unit
//   - price crossing a level upward                         -> close the
//     nearest filled unit below the crossing, for profit
//
// Units aggregate into the run's single position; exits are partial closes of
// the exact unit quantity. Level state survives across ticks; an unexpected
// (force) close clears the whole board.
// =============================================================================

use tracing::debug;

use crate::config::{GridSection, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::types::{Side, TradeKind, TradeRecord};

use super::StrategyContext;

#[derive(Debug, Clone)]
struct GridLevel {
    price: f64,
    /// Contract quantity of the unit bought at this level, when filled.
    filled_qty: Option<f64>,
}

pub struct GridKernel {
    cfg: GridSection,
    levels: Vec<GridLevel>,
    last_price: Option<f64>,
    /// Level index awaiting its entry fill.
    pending_entry: Option<usize>,
    /// Level index awaiting its exit fill.
    pending_exit: Option<usize>,
}

impl GridKernel {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        let cfg = config
            .grid
            .clone()
            .ok_or_else(|| EngineError::Config("grid section missing".into()))?;

        let step = (cfg.price_high - cfg.price_low) / (cfg.levels - 1) as f64;
        let levels = (0..cfg.levels)
            .map(|i| GridLevel {
                price: cfg.price_low + step * i as f64,
                filled_qty: None,
            })
            .collect();

        Ok(Self {
            cfg,
            levels,
            last_price: None,
            pending_entry: None,
            pending_exit: None,
        })
    }

    pub async fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        for level in &mut self.levels {
            level.filled_qty = None;
        }
        self.last_price = None;
        self.pending_entry = None;
        self.pending_exit = None;
        debug!(
            levels = self.levels.len(),
            low = self.cfg.price_low,
            high = self.cfg.price_high,
            "grid primed"
        );
        Ok(())
    }

    pub async fn run_once(&mut self, ctx: &mut StrategyContext<'_>) -> EngineResult<()> {
        let price = ctx
            .price()
            .ok_or_else(|| EngineError::KernelRecoverable("no ticker this tick".into()))?;

        // Requests execute inline within the tick; a pending marker that
        // survived means the order never filled.
        self.pending_entry = None;
        self.pending_exit = None;

        let Some(prev) = self.last_price.replace(price) else {
            // First observation seeds the crossing reference.
            return Ok(());
        };
        if (price - prev).abs() < f64::EPSILON {
            return Ok(());
        }

        if price < prev {
            // Downward: buy the lowest empty level crossed in this move.
            if let Some(idx) = self
                .levels
                .iter()
                .position(|l| l.filled_qty.is_none() && price <= l.price && l.price < prev)
            {
                let kind = if ctx.position.is_some() {
                    TradeKind::Add
                } else {
                    TradeKind::Open
                };
                debug!(level = idx, level_price = self.levels[idx].price, price, "grid buy");
                self.pending_entry = Some(idx);
                ctx.request_trade(kind, Side::Long, self.cfg.order_notional);
            }
        } else {
            // Upward: find the highest level crossed, then close the nearest
            // filled unit strictly below it.
            let crossed = self
                .levels
                .iter()
                .rposition(|l| prev < l.price && l.price <= price);
            if let Some(crossed_idx) = crossed {
                let exit = self.levels[..crossed_idx]
                    .iter()
                    .rposition(|l| l.filled_qty.is_some());
                if let Some(idx) = exit {
                    let qty = self.levels[idx].filled_qty.unwrap_or(0.0);
                    if qty > 0.0 && ctx.position.is_some() {
                        debug!(
                            level = idx,
                            level_price = self.levels[idx].price,
                            price,
                            qty,
                            "grid unit exit"
                        );
                        self.pending_exit = Some(idx);
                        ctx.request_partial_close(Side::Long, qty);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn on_trade(&mut self, trade: &TradeRecord) {
        match trade.kind {
            TradeKind::Open | TradeKind::Add => {
                if let Some(idx) = self.pending_entry.take() {
                    self.levels[idx].filled_qty = Some(trade.qty);
                }
            }
            TradeKind::Close => {
                match self.pending_exit.take() {
                    Some(idx) => self.levels[idx].filled_qty = None,
                    // A close this kernel did not request flattened the
                    // position (risk gate or stop); reset the board.
                    None => {
                        for level in &mut self.levels {
                            level.filled_qty = None;
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn filled_count(&self) -> usize {
        self.levels.iter().filter(|l| l.filled_qty.is_some()).count()
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

    // Levels at 100, 110, 120, 130, 140.
    fn config() -> StrategyConfig {
        StrategyConfig::parse(&json!({
            "kernel": "grid",
            "trading": {"symbol": "BTCUSDT"},
            "grid": {"priceLow": 100.0, "priceHigh": 140.0, "levels": 5, "orderNotional": 110.0}
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

    fn fill_trade(kind: TradeKind, price: f64, qty: f64) -> TradeRecord {
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

    fn long_position(price: f64, qty: f64) -> Position {
        Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price,
                qty,
                timestamp: 0,
            },
            1,
        )
    }

    #[tokio::test]
    async fn level_grid_is_even() {
        let kernel = GridKernel::new(&config()).unwrap();
        let prices: Vec<f64> = kernel.levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![100.0, 110.0, 120.0, 130.0, 140.0]);
    }

    #[tokio::test]
    async fn downward_crossing_buys_once_per_level() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = GridKernel::new(&cfg).unwrap();

        // Seed above the grid, then cross 120 downward.
        let t = ticker(125.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());

        let t = ticker(118.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Open);
        kernel.on_trade(&fill_trade(TradeKind::Open, 118.0, 110.0 / 118.0));
        assert_eq!(kernel.filled_count(), 1);

        // Hovering at 118 again: level 120 already filled, no re-buy.
        let pos = long_position(118.0, 110.0 / 118.0);
        let t = ticker(118.0, 3);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn upward_crossing_closes_nearest_filled_unit() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = GridKernel::new(&cfg).unwrap();

        // Fill the 110 level on the way down.
        let t = ticker(115.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let t = ticker(108.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_requests().len(), 1);
        let unit_qty = 110.0 / 108.0;
        kernel.on_trade(&fill_trade(TradeKind::Open, 108.0, unit_qty));

        // Rally through 120: the 110 unit exits.
        let pos = long_position(108.0, unit_qty);
        let t = ticker(122.0, 3);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, Some(&pos));
        kernel.run_once(&mut ctx).await.unwrap();
        let reqs = ctx.take_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, TradeKind::Close);
        assert_eq!(reqs[0].qty, Some(unit_qty));

        kernel.on_trade(&fill_trade(TradeKind::Close, 122.0, unit_qty));
        assert_eq!(kernel.filled_count(), 0);
    }

    #[tokio::test]
    async fn unexpected_close_resets_the_board() {
        let cfg = config();
        let ex = exchange();
        let mut kernel = GridKernel::new(&cfg).unwrap();

        let t = ticker(125.0, 1);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        let t = ticker(105.0, 2);
        let mut ctx = StrategyContext::new(1, &cfg, &ex).with_market(&t, None);
        kernel.run_once(&mut ctx).await.unwrap();
        ctx.take_requests();
        kernel.on_trade(&fill_trade(TradeKind::Open, 105.0, 1.0));
        assert_eq!(kernel.filled_count(), 1);

        // A stop-loss close the kernel never asked for.
        kernel.on_trade(&fill_trade(TradeKind::Close, 90.0, 1.0));
        assert_eq!(kernel.filled_count(), 0);
    }
}
