// =============================================================================
// Technical indicators
// =============================================================================
//
// Pure functions over slices of closing prices. Every function returns an
// empty/None result instead of panicking when the input is too short, so
// kernels can call them on warming-up buffers without guards.
// =============================================================================

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use bollinger::{calculate_bollinger, BollingerResult};
pub use ema::calculate_ema;
pub use macd::{calculate_macd, MacdResult};
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;
