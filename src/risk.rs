// =============================================================================
// Risk gate — ordered, stateless evaluation of every proposed action
// =============================================================================
//
// Pure function of (position, run stats, proposed action, policy, now).
// First match wins:
//   1. stop-loss     -> ForceClose
//   2. take-profit   -> ForceClose
//   3. max-loss      -> ForceClose, run becomes terminal
//   4. max-additions -> Deny
//   5. cooldown      -> Deny
//   6. Allow
//
// The supervisor evaluates twice per tick: once with no action (force-close
// rules only) and once per kernel-requested trade (all rules).
// =============================================================================

use std::time::Duration;

use crate::config::StrategyConfig;
use crate::kernel::TradeRequest;
use crate::position::Position;
use crate::types::TradeKind;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Risk limits in force for one run.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    /// Adverse price-move percent that force-closes the position.
    pub stop_loss_pct: f64,
    /// Favorable price-move percent that takes profit.
    pub take_profit_pct: f64,
    /// Run loss (realized + unrealized) as percent of starting balance that
    /// terminates the run.
    pub max_loss_pct: f64,
    /// Cap on `add` trades; `None` means uncapped.
    pub max_additions: Option<u32>,
    /// Minimum gap between consecutive kernel-requested trades.
    pub cooldown: Duration,
}

impl RiskPolicy {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            stop_loss_pct: cfg.risk.stop_loss_percent,
            take_profit_pct: cfg.risk.take_profit_percent,
            max_loss_pct: cfg.risk.max_loss_percent,
            max_additions: cfg.effective_max_additions(),
            cooldown: Duration::from_secs(cfg.risk.cooldown_seconds),
        }
    }
}

/// Run-scoped numbers the gate needs beyond the position itself.
#[derive(Debug, Clone, Copy)]
pub struct RunRiskView {
    pub start_balance: f64,
    pub realized_pnl: f64,
    /// Epoch ms of the run's most recent trade, any kind.
    pub last_trade_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    MaxLoss,
}

impl CloseReason {
    /// Max-loss ends the run; the others only flatten the position.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::MaxLoss)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop-loss"),
            Self::TakeProfit => write!(f, "take-profit"),
            Self::MaxLoss => write!(f, "max-loss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MaxAdditions,
    Cooldown,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxAdditions => write!(f, "max-additions"),
            Self::Cooldown => write!(f, "cooldown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Allow,
    Deny(DenyReason),
    ForceClose(CloseReason),
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate the gate. `action` is `None` for the per-tick position check and
/// `Some` for each kernel-requested trade.
pub fn evaluate(
    position: Option<&Position>,
    run: &RunRiskView,
    action: Option<&TradeRequest>,
    policy: &RiskPolicy,
    now_ms: i64,
) -> RiskVerdict {
    // 1 & 2 — position-level stops.
    if let Some(pos) = position {
        let move_pct = pos.unrealized_pnl_pct();
        if move_pct <= -policy.stop_loss_pct {
            return RiskVerdict::ForceClose(CloseReason::StopLoss);
        }
        if move_pct >= policy.take_profit_pct {
            return RiskVerdict::ForceClose(CloseReason::TakeProfit);
        }
    }

    // 3 — run-level max loss.
    if run.start_balance > 0.0 {
        let unrealized = position.map(|p| p.unrealized_pnl()).unwrap_or(0.0);
        let total = run.realized_pnl + unrealized;
        if -total >= policy.max_loss_pct / 100.0 * run.start_balance {
            return RiskVerdict::ForceClose(CloseReason::MaxLoss);
        }
    }

    let Some(action) = action else {
        return RiskVerdict::Allow;
    };

    // 4 — addition cap.
    if action.kind == TradeKind::Add {
        if let (Some(pos), Some(max)) = (position, policy.max_additions) {
            if pos.additions >= max {
                return RiskVerdict::Deny(DenyReason::MaxAdditions);
            }
        }
    }

    // 5 — cooldown.
    if !policy.cooldown.is_zero() {
        if let Some(last) = run.last_trade_at {
            let elapsed_ms = now_ms.saturating_sub(last);
            if (elapsed_ms as u128) < policy.cooldown.as_millis() {
                return RiskVerdict::Deny(DenyReason::Cooldown);
            }
        }
    }

    RiskVerdict::Allow
}
