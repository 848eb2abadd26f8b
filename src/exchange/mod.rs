// =============================================================================
// Exchange adapter — typed facade over the perpetual-futures venue
// =============================================================================
//
// The trait is the only surface the supervisor, kernels, and backtest engine
// see. Two implementations exist:
//   - `BinanceFuturesClient` (live / testnet REST)
//   - `SimulatedExchange`    (backtests: bar-driven fills)
//
// Precision policy, shared by implementations:
//   - amounts round half-to-even onto the venue's quantity step
//   - prices floor for buys and ceil for sells onto the venue's tick
// =============================================================================

pub mod binance;
pub mod sim;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::{AccountBalance, Bar, Fill, Side, Ticker, Timeframe, VenuePosition};

/// Typed facade over a perpetual-futures venue.
///
/// Orders are sized in quote currency (`notional`) and converted to contract
/// quantity at the current mark; `reduce_market` is the only operation sized
/// directly in contracts (partial exits must match an exact quantity).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Idempotent; succeeds even when the leverage is already set.
    async fn configure_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()>;

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker>;

    /// Most-recent `limit` closed bars, oldest first.
    async fn fetch_bars(&self, symbol: &str, timeframe: Timeframe, limit: u32)
        -> EngineResult<Vec<Bar>>;

    /// Market order sized in quote currency; returns the venue-reported fill.
    async fn open_market(&self, symbol: &str, side: Side, notional: f64) -> EngineResult<Fill>;

    /// Reduce-only market order for `qty` contracts of an existing position.
    async fn reduce_market(&self, symbol: &str, side: Side, qty: f64) -> EngineResult<Fill>;

    /// Flat-to-zero for that symbol+side.
    async fn close_market(&self, symbol: &str, side: Side) -> EngineResult<Fill>;

    async fn fetch_position(&self, symbol: &str) -> EngineResult<Option<VenuePosition>>;

    async fn fetch_balance(&self) -> EngineResult<AccountBalance>;
}

// ---------------------------------------------------------------------------
// Symbol normalization
// ---------------------------------------------------------------------------

/// Normalize a user-supplied symbol to the venue form: strip separators and
/// settlement suffixes, uppercase. "btc/usdt:usdt" and "BTC-USDT" both become
/// "BTCUSDT".
pub fn normalize_symbol(raw: &str) -> String {
    let base = raw.split(':').next().unwrap_or(raw);
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Precision
// ---------------------------------------------------------------------------

/// Venue-declared precision filters for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    /// Price tick size (PRICE_FILTER).
    pub price_tick: f64,
    /// Quantity step size (LOT_SIZE).
    pub amount_step: f64,
    /// Minimum order quantity.
    pub min_qty: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            price_tick: 0.01,
            amount_step: 0.001,
            min_qty: 0.0,
        }
    }
}

/// Round a quantity onto a step grid using banker's rounding (half-to-even).
pub fn round_amount(qty: f64, step: f64) -> f64 {
    if step <= 0.0 || !qty.is_finite() {
        return qty;
    }
    let scaled = qty / step;
    let floor = scaled.floor();
    let frac = scaled - floor;

    // Tolerate float fuzz around the .5 midpoint.
    const EPS: f64 = 1e-9;
    let rounded = if (frac - 0.5).abs() < EPS {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else if frac > 0.5 {
        floor + 1.0
    } else {
        floor
    };

    rounded * step
}

/// Round a price onto the tick grid: floor for buys, ceil for sells, so the
/// rounded price is never more aggressive than requested.
pub fn round_price(price: f64, tick: f64, is_buy: bool) -> f64 {
    if tick <= 0.0 || !price.is_finite() {
        return price;
    }
    let scaled = price / tick;
    // Snap values that are already on-grid before flooring/ceiling.
    const EPS: f64 = 1e-9;
    let snapped = if (scaled - scaled.round()).abs() < EPS {
        scaled.round()
    } else if is_buy {
        scaled.floor()
    } else {
        scaled.ceil()
    };
    snapped * tick
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators_and_suffix() {
        assert_eq!(normalize_symbol("btc/usdt:usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("ethusdt"), "ETHUSDT");
        assert_eq!(normalize_symbol("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn amount_rounds_half_to_even() {
        // 0.0025 / 0.001 = 2.5 -> even neighbour is 2.
        assert!((round_amount(0.0025, 0.001) - 0.002).abs() < 1e-12);
        // 0.0035 / 0.001 = 3.5 -> even neighbour is 4.
        assert!((round_amount(0.0035, 0.001) - 0.004).abs() < 1e-12);
        // Plain nearest otherwise.
        assert!((round_amount(0.00349, 0.001) - 0.003).abs() < 1e-12);
        assert!((round_amount(0.00351, 0.001) - 0.004).abs() < 1e-12);
    }

    #[test]
    fn amount_zero_step_passthrough() {
        assert_eq!(round_amount(1.2345, 0.0), 1.2345);
    }

    #[test]
    fn price_floors_for_buys_ceils_for_sells() {
        assert!((round_price(100.007, 0.01, true) - 100.00).abs() < 1e-9);
        assert!((round_price(100.001, 0.01, false) - 100.01).abs() < 1e-9);
    }

    #[test]
    fn price_on_grid_is_untouched() {
        assert!((round_price(100.01, 0.01, true) - 100.01).abs() < 1e-9);
        assert!((round_price(100.01, 0.01, false) - 100.01).abs() < 1e-9);
    }
}
