// =============================================================================
// Strategy configuration document
// =============================================================================
//
// A strategy definition stores its configuration as a hierarchical JSON
// document. The document is parsed ONCE into this typed form when a strategy
// starts (or when a backtest is submitted); kernels never see the raw map.
//
// Section and field names are camelCase on the wire. Every optional knob has a
// serde default so older documents keep loading when new fields appear.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::exchange::normalize_symbol;
use crate::types::{Side, Timeframe};

// =============================================================================
// Kernel selector
// =============================================================================

/// Which built-in kernel drives the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelId {
    #[serde(rename = "martingale")]
    Martingale,
    #[serde(rename = "dca")]
    Dca,
    #[serde(rename = "grid")]
    Grid,
    #[serde(rename = "trend")]
    Trend,
    #[serde(rename = "meanReversion")]
    MeanReversion,
    #[serde(rename = "ml")]
    Ml,
    #[serde(rename = "llm")]
    Llm,
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Martingale => write!(f, "martingale"),
            Self::Dca => write!(f, "dca"),
            Self::Grid => write!(f, "grid"),
            Self::Trend => write!(f, "trend"),
            Self::MeanReversion => write!(f, "meanReversion"),
            Self::Ml => write!(f, "ml"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// What to do with a pre-existing venue position when a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilePolicy {
    /// Take the venue position into the new run as its opening state.
    Adopt,
    /// Flatten the venue position before the kernel initializes.
    Close,
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_leverage() -> u32 {
    1
}

fn default_side() -> Side {
    Side::Long
}

fn default_reconcile() -> ReconcilePolicy {
    ReconcilePolicy::Close
}

fn default_stop_loss_percent() -> f64 {
    10.0
}

fn default_take_profit_percent() -> f64 {
    20.0
}

fn default_max_loss_percent() -> f64 {
    30.0
}

fn default_check_interval_seconds() -> f64 {
    5.0
}

fn default_price_precision() -> u32 {
    2
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_additions() -> u32 {
    5
}

fn default_fast_period() -> usize {
    9
}

fn default_slow_period() -> usize {
    21
}

fn default_timeframe() -> Timeframe {
    Timeframe::M5
}

fn default_mr_period() -> usize {
    20
}

fn default_ml_lookback() -> usize {
    240
}

fn default_ml_confidence() -> f64 {
    0.65
}

fn default_ml_retrain_ticks() -> u32 {
    120
}

fn default_ml_trees() -> usize {
    25
}

fn default_ml_max_depth() -> usize {
    4
}

fn default_ml_seed() -> u64 {
    42
}

fn default_llm_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_llm_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_llm_call_interval() -> u64 {
    300
}

fn default_llm_confidence() -> f64 {
    0.6
}

fn default_llm_max_tokens() -> u32 {
    256
}

fn default_llm_temperature() -> f64 {
    0.2
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingSection {
    pub symbol: String,
    #[serde(default = "default_side")]
    pub side: Side,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_reconcile")]
    pub reconcile_on_start: ReconcilePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSection {
    /// Adverse price move percent forcing the position closed.
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    /// Favorable price move percent taking profit.
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
    /// Run loss (realized + unrealized) as a percent of starting balance
    /// that terminates the run.
    #[serde(default = "default_max_loss_percent")]
    pub max_loss_percent: f64,
    /// Cap on `add` trades per run. When absent, martingale strategies fall
    /// back to their own `maxAdditions` and everything else is uncapped.
    #[serde(default)]
    pub max_additions: Option<u32>,
    /// Minimum seconds between consecutive kernel-requested trades.
    #[serde(default)]
    pub cooldown_seconds: u64,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_percent: default_take_profit_percent(),
            max_loss_percent: default_max_loss_percent(),
            max_additions: None,
            cooldown_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSection {
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: f64,
    #[serde(default = "default_price_precision")]
    pub price_precision: u32,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval_seconds(),
            price_precision: default_price_precision(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MartingaleSection {
    /// Notional of the first entry, quote currency.
    pub initial_position: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_additions")]
    pub max_additions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSection {
    /// Extreme-to-current move percent that fires an entry or addition.
    pub price_drop_percent: f64,
    /// Open the first position on the first tick instead of waiting for a
    /// triggering move.
    #[serde(default)]
    pub start_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcaSection {
    pub amount_per_interval: f64,
    pub interval_seconds: u64,
    pub price_ceiling: f64,
    pub max_investment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSection {
    pub price_low: f64,
    pub price_high: f64,
    pub levels: u32,
    pub order_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSection {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    pub order_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeanReversionSection {
    #[serde(default = "default_mr_period")]
    pub period: usize,
    pub deviation_pct: f64,
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    pub order_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlSection {
    /// Bounded price-history length the feature pipeline sees.
    #[serde(default = "default_ml_lookback")]
    pub lookback: usize,
    #[serde(default = "default_ml_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_ml_retrain_ticks")]
    pub retrain_interval_ticks: u32,
    #[serde(default = "default_ml_trees")]
    pub trees: usize,
    #[serde(default = "default_ml_max_depth")]
    pub max_depth: usize,
    /// RNG seed for training; fixed so backtests are reproducible.
    #[serde(default = "default_ml_seed")]
    pub seed: u64,
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    pub order_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSection {
    pub model: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the completion API key.
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_call_interval")]
    pub call_interval_seconds: u64,
    #[serde(default = "default_llm_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    pub order_notional: f64,
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// The fully parsed configuration document of one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    pub kernel: KernelId,
    pub trading: TradingSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
    #[serde(default)]
    pub martingale: Option<MartingaleSection>,
    #[serde(default)]
    pub trigger: Option<TriggerSection>,
    #[serde(default)]
    pub dca: Option<DcaSection>,
    #[serde(default)]
    pub grid: Option<GridSection>,
    #[serde(default)]
    pub trend: Option<TrendSection>,
    #[serde(default)]
    pub mean_reversion: Option<MeanReversionSection>,
    #[serde(default)]
    pub ml: Option<MlSection>,
    #[serde(default)]
    pub llm: Option<LlmSection>,
}

impl StrategyConfig {
    /// Parse and validate a raw configuration document.
    ///
    /// The first missing or invalid field aborts with `ConfigError`; the
    /// document is never partially applied.
    pub fn parse(doc: &serde_json::Value) -> EngineResult<Self> {
        let mut cfg: Self = serde_json::from_value(doc.clone())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.trading.symbol = normalize_symbol(&cfg.trading.symbol);
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.trading.symbol.is_empty() {
            return Err(EngineError::Config("trading.symbol is empty".into()));
        }
        if self.trading.leverage == 0 {
            return Err(EngineError::Config("trading.leverage must be >= 1".into()));
        }
        if self.monitoring.check_interval_seconds <= 0.0 {
            return Err(EngineError::Config(
                "monitoring.checkIntervalSeconds must be positive".into(),
            ));
        }
        for (name, value) in [
            ("risk.stopLossPercent", self.risk.stop_loss_percent),
            ("risk.takeProfitPercent", self.risk.take_profit_percent),
            ("risk.maxLossPercent", self.risk.max_loss_percent),
        ] {
            if value <= 0.0 {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }

        match self.kernel {
            KernelId::Martingale => {
                let m = self.require("martingale", &self.martingale)?;
                let t = self.require("trigger", &self.trigger)?;
                if m.initial_position <= 0.0 {
                    return Err(EngineError::Config(
                        "martingale.initialPosition must be positive".into(),
                    ));
                }
                if m.multiplier < 1.0 {
                    return Err(EngineError::Config(
                        "martingale.multiplier must be >= 1.0".into(),
                    ));
                }
                if t.price_drop_percent <= 0.0 {
                    return Err(EngineError::Config(
                        "trigger.priceDropPercent must be positive".into(),
                    ));
                }
            }
            KernelId::Dca => {
                let d = self.require("dca", &self.dca)?;
                if d.amount_per_interval <= 0.0 || d.max_investment <= 0.0 {
                    return Err(EngineError::Config(
                        "dca amounts must be positive".into(),
                    ));
                }
                if d.interval_seconds == 0 {
                    return Err(EngineError::Config(
                        "dca.intervalSeconds must be positive".into(),
                    ));
                }
            }
            KernelId::Grid => {
                let g = self.require("grid", &self.grid)?;
                if g.price_high <= g.price_low {
                    return Err(EngineError::Config(
                        "grid.priceHigh must exceed grid.priceLow".into(),
                    ));
                }
                if g.levels < 2 {
                    return Err(EngineError::Config("grid.levels must be >= 2".into()));
                }
                if g.order_notional <= 0.0 {
                    return Err(EngineError::Config(
                        "grid.orderNotional must be positive".into(),
                    ));
                }
            }
            KernelId::Trend => {
                let t = self.require("trend", &self.trend)?;
                if t.fast_period == 0 || t.slow_period == 0 {
                    return Err(EngineError::Config("trend periods must be positive".into()));
                }
                if t.fast_period >= t.slow_period {
                    return Err(EngineError::Config(
                        "trend.fastPeriod must be below trend.slowPeriod".into(),
                    ));
                }
                if t.order_notional <= 0.0 {
                    return Err(EngineError::Config(
                        "trend.orderNotional must be positive".into(),
                    ));
                }
            }
            KernelId::MeanReversion => {
                let m = self.require("meanReversion", &self.mean_reversion)?;
                if m.period == 0 {
                    return Err(EngineError::Config(
                        "meanReversion.period must be positive".into(),
                    ));
                }
                if m.deviation_pct <= 0.0 {
                    return Err(EngineError::Config(
                        "meanReversion.deviationPct must be positive".into(),
                    ));
                }
                if m.order_notional <= 0.0 {
                    return Err(EngineError::Config(
                        "meanReversion.orderNotional must be positive".into(),
                    ));
                }
            }
            KernelId::Ml => {
                let m = self.require("ml", &self.ml)?;
                if m.lookback < 64 {
                    return Err(EngineError::Config("ml.lookback must be >= 64".into()));
                }
                if !(0.0..=1.0).contains(&m.confidence_threshold) {
                    return Err(EngineError::Config(
                        "ml.confidenceThreshold must be in [0, 1]".into(),
                    ));
                }
                if m.trees == 0 {
                    return Err(EngineError::Config("ml.trees must be positive".into()));
                }
                if m.order_notional <= 0.0 {
                    return Err(EngineError::Config(
                        "ml.orderNotional must be positive".into(),
                    ));
                }
            }
            KernelId::Llm => {
                let l = self.require("llm", &self.llm)?;
                if l.model.is_empty() {
                    return Err(EngineError::Config("llm.model is empty".into()));
                }
                if !(0.0..=1.0).contains(&l.confidence_threshold) {
                    return Err(EngineError::Config(
                        "llm.confidenceThreshold must be in [0, 1]".into(),
                    ));
                }
                if l.order_notional <= 0.0 {
                    return Err(EngineError::Config(
                        "llm.orderNotional must be positive".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn require<'a, T>(&self, name: &str, section: &'a Option<T>) -> EngineResult<&'a T> {
        section.as_ref().ok_or_else(|| {
            EngineError::Config(format!(
                "kernel '{}' requires a '{}' section",
                self.kernel, name
            ))
        })
    }

    /// Tick interval of the control loop.
    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.monitoring.check_interval_seconds)
    }

    /// Effective cap on `add` trades per run: an explicit risk override wins,
    /// then the martingale section's own cap.
    pub fn effective_max_additions(&self) -> Option<u32> {
        self.risk
            .max_additions
            .or_else(|| match self.kernel {
                KernelId::Martingale => self.martingale.as_ref().map(|m| m.max_additions),
                _ => None,
            })
    }
}
