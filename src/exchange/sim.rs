// =============================================================================
// Simulated exchange — bar-driven fills for the backtest engine
// =============================================================================
//
// The simulator owns a fixed bar sequence and a cursor:
//   - `fetch_ticker` quotes the CURRENT bar's close.
//   - market orders fill at the NEXT bar's open, so a decision made on bar i
//     can never use information from bar i+1 (no look-ahead).
//   - `fetch_bars` only ever returns bars up to the cursor.
//
// The backtest engine advances the cursor one bar per tick and mirrors the
// balance into the simulator so `fetch_balance` stays truthful for kernels.
// =============================================================================

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeAdapter;
use crate::types::{AccountBalance, Bar, Fill, Side, Ticker, Timeframe, VenuePosition};

#[derive(Debug, Clone)]
struct SimPosition {
    side: Side,
    qty: f64,
    entry_price: f64,
}

pub struct SimulatedExchange {
    symbol: String,
    bars: Vec<Bar>,
    /// Index of the next bar `advance` will yield.
    next: RwLock<usize>,
    position: Mutex<Option<SimPosition>>,
    balance: RwLock<f64>,
}

impl SimulatedExchange {
    /// Create a simulator positioned just before `start_index`, so kernels
    /// initializing before the first tick see only warm-up history.
    pub fn new(symbol: &str, bars: Vec<Bar>, start_index: usize, initial_balance: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            bars,
            next: RwLock::new(start_index),
            position: Mutex::new(None),
            balance: RwLock::new(initial_balance),
        }
    }

    /// Move the cursor one bar forward; `None` once the sequence is consumed.
    pub fn advance(&self) -> Option<Bar> {
        let mut next = self.next.write();
        let bar = self.bars.get(*next)?.clone();
        *next += 1;
        Some(bar)
    }

    /// Whether an order placed now still has a next bar to fill on.
    pub fn has_next(&self) -> bool {
        *self.next.read() < self.bars.len()
    }

    pub fn total_bars(&self) -> usize {
        self.bars.len()
    }

    /// Mirror the engine-tracked balance so `fetch_balance` is truthful.
    pub fn set_balance(&self, balance: f64) {
        *self.balance.write() = balance;
    }

    fn current_bar(&self) -> EngineResult<&Bar> {
        if self.bars.is_empty() {
            return Err(EngineError::VenuePermanent(
                "simulator has no bars loaded".into(),
            ));
        }
        let next = *self.next.read();
        let idx = next.saturating_sub(1).min(self.bars.len() - 1);
        Ok(&self.bars[idx])
    }

    /// Price and timestamp of the fill an order placed now would get.
    fn next_fill(&self) -> EngineResult<(f64, i64)> {
        let next = *self.next.read();
        let bar = self.bars.get(next).ok_or_else(|| {
            EngineError::VenuePermanent("no bar remaining to fill the order".into())
        })?;
        Ok((bar.open, bar.open_time))
    }

    fn check_symbol(&self, symbol: &str) -> EngineResult<()> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(EngineError::VenuePermanent(format!(
                "simulator only serves {}, got {symbol}",
                self.symbol
            )))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    async fn configure_leverage(&self, symbol: &str, _leverage: u32) -> EngineResult<()> {
        self.check_symbol(symbol)
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        self.check_symbol(symbol)?;
        let bar = self.current_bar()?;
        Ok(Ticker {
            bid: bar.close,
            ask: bar.close,
            last: bar.close,
            mark: bar.close,
            timestamp: bar.close_time,
        })
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: u32,
    ) -> EngineResult<Vec<Bar>> {
        self.check_symbol(symbol)?;
        let next = *self.next.read();
        let end = next.min(self.bars.len());
        let start = end.saturating_sub(limit as usize);
        Ok(self.bars[start..end].to_vec())
    }

    async fn open_market(&self, symbol: &str, side: Side, notional: f64) -> EngineResult<Fill> {
        self.check_symbol(symbol)?;
        if notional <= 0.0 {
            return Err(EngineError::VenuePermanent(
                "order notional must be positive".into(),
            ));
        }
        let (price, timestamp) = self.next_fill()?;
        let qty = notional / price;

        let mut position = self.position.lock();
        match position.take() {
            None => {
                *position = Some(SimPosition {
                    side,
                    qty,
                    entry_price: price,
                });
            }
            Some(mut pos) if pos.side == side => {
                let total = pos.qty + qty;
                pos.entry_price = (pos.entry_price * pos.qty + price * qty) / total;
                pos.qty = total;
                *position = Some(pos);
            }
            Some(pos) => {
                let held = pos.side;
                *position = Some(pos);
                return Err(EngineError::VenuePermanent(format!(
                    "simulator holds a {held} position; close it before opening {side}"
                )));
            }
        }

        Ok(Fill {
            price,
            qty,
            timestamp,
        })
    }

    async fn reduce_market(&self, symbol: &str, side: Side, qty: f64) -> EngineResult<Fill> {
        self.check_symbol(symbol)?;
        let (price, timestamp) = self.next_fill()?;

        let mut position = self.position.lock();
        let mut pos = position.take().ok_or_else(|| {
            EngineError::VenuePermanent("no simulated position to reduce".into())
        })?;
        if pos.side != side {
            let held = pos.side;
            *position = Some(pos);
            return Err(EngineError::VenuePermanent(format!(
                "simulated position is {held}, reduce requested {side}"
            )));
        }

        let closed = qty.min(pos.qty);
        pos.qty -= closed;
        if pos.qty > 1e-12 {
            *position = Some(pos);
        }

        Ok(Fill {
            price,
            qty: closed,
            timestamp,
        })
    }

    async fn close_market(&self, symbol: &str, side: Side) -> EngineResult<Fill> {
        let qty = {
            let position = self.position.lock();
            match position.as_ref() {
                Some(pos) if pos.side == side => pos.qty,
                Some(pos) => {
                    return Err(EngineError::VenuePermanent(format!(
                        "simulated position is {}, close requested {}",
                        pos.side, side
                    )))
                }
                None => {
                    return Err(EngineError::VenuePermanent(
                        "no simulated position to close".into(),
                    ))
                }
            }
        };
        self.reduce_market(symbol, side, qty).await
    }

    async fn fetch_position(&self, symbol: &str) -> EngineResult<Option<VenuePosition>> {
        self.check_symbol(symbol)?;
        let mark = self.current_bar()?.close;
        Ok(self.position.lock().as_ref().map(|pos| VenuePosition {
            symbol: self.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            qty: pos.qty,
            leverage: 1,
            unrealized_pnl: pos.side.sign() * (mark - pos.entry_price) * pos.qty,
        }))
    }

    async fn fetch_balance(&self) -> EngineResult<AccountBalance> {
        let balance = *self.balance.read();
        Ok(AccountBalance {
            total: balance,
            free: balance,
            used: 0.0,
        })
    }
}

impl std::fmt::Debug for SimulatedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedExchange")
            .field("symbol", &self.symbol)
            .field("bars", &self.bars.len())
            .field("next", &*self.next.read())
            .finish()
    }
}
