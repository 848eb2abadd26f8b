// =============================================================================
// Shared types used across the Borealis trading supervisor
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Market primitives
// ---------------------------------------------------------------------------

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. PnL = sign * (exit - entry) * qty.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// What a trade did to the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Open,
    Add,
    Close,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Add => write!(f, "add"),
            Self::Close => write!(f, "close"),
        }
    }
}

impl std::str::FromStr for TradeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "add" => Ok(Self::Add),
            "close" => Ok(Self::Close),
            other => Err(format!("unknown trade kind: {other}")),
        }
    }
}

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Venue interval string ("1m", "4h", ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn duration_secs(self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Number of bars in a (365-day) year, used to annualize per-bar returns.
    pub fn bars_per_year(self) -> f64 {
        (365.0 * 86_400.0) / self.duration_secs() as f64
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// A point-in-time market snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub mark: f64,
    /// Venue time in epoch milliseconds.
    pub timestamp: i64,
}

/// A venue-reported order fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub timestamp: i64,
}

/// Account balance in quote currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

/// A position as the venue reports it (used for reconciliation on start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Lifecycle enums
// ---------------------------------------------------------------------------

/// Per-strategy supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Persisted strategy definition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Stopped,
    Running,
    Paused,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for StrategyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown strategy status: {other}")),
        }
    }
}

/// `config` strategies are driven by one of the built-in kernels; `code`
/// strategies carry user-supplied kernel source and cannot be started here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Config,
    Code,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Code => write!(f, "code"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "code" => Ok(Self::Code),
            other => Err(format!("unknown strategy kind: {other}")),
        }
    }
}

/// Terminal status of a strategy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Open,
    Completed,
    MaxLoss,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Completed => write!(f, "completed"),
            Self::MaxLoss => write!(f, "max_loss"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completed" => Ok(Self::Completed),
            "max_loss" => Ok(Self::MaxLoss),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Lifecycle of a persisted backtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for BacktestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown backtest status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Aggregate counters scoped to one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_trades: u32,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub realized_pnl: f64,
}

impl RunCounters {
    /// Fold one appended trade into the counters. Only `close` trades carry
    /// a realized pnl.
    pub fn apply(&mut self, pnl: Option<f64>) {
        self.total_trades += 1;
        if let Some(pnl) = pnl {
            if pnl > 0.0 {
                self.win_trades += 1;
            } else if pnl < 0.0 {
                self.loss_trades += 1;
            }
            self.realized_pnl += pnl;
        }
    }
}

/// An append-only trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub strategy_id: i64,
    pub run_id: i64,
    pub kind: TradeKind,
    pub side: Side,
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    /// Set only on `close` trades.
    pub pnl: Option<f64>,
    /// Epoch milliseconds.
    pub executed_at: i64,
}

/// Periodic account capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub captured_at: i64,
    pub total: f64,
    pub free: f64,
    pub used: f64,
    pub unrealized_pnl: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn timeframe_roundtrip() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ] {
            assert_eq!(Timeframe::from_str(tf.as_str()).unwrap(), tf);
        }
        assert!(Timeframe::from_str("2h").is_err());
    }

    #[test]
    fn timeframe_bars_per_year() {
        assert!((Timeframe::D1.bars_per_year() - 365.0).abs() < 1e-9);
        assert!((Timeframe::H1.bars_per_year() - 365.0 * 24.0).abs() < 1e-9);
    }

    #[test]
    fn counters_apply() {
        let mut c = RunCounters::default();
        c.apply(None); // open
        c.apply(None); // add
        c.apply(Some(12.5)); // winning close
        c.apply(Some(-3.0)); // losing close
        assert_eq!(c.total_trades, 4);
        assert_eq!(c.win_trades, 1);
        assert_eq!(c.loss_trades, 1);
        assert!((c.realized_pnl - 9.5).abs() < 1e-9);
    }

    #[test]
    fn serde_lowercase_tags() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"long\"");
        assert_eq!(serde_json::to_string(&TradeKind::Close).unwrap(), "\"close\"");
        assert_eq!(serde_json::to_string(&Timeframe::H4).unwrap(), "\"4h\"");
    }
}
