// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Propagation policy:
//   - The exchange adapter retries `VenueTransient` internally and surfaces it
//     only on exhaustion.
//   - The supervisor absorbs `KernelRecoverable` up to a consecutive-error
//     threshold.
//   - Everything else becomes a state transition plus a published error event.
//
// Command responses carry `kind()` and the Display message; stack traces never
// cross the boundary.
// =============================================================================

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid configuration field; the strategy remains stopped.
    #[error("config error: {0}")]
    Config(String),

    /// Network timeout, rate limit, or venue 5xx. Retried by the adapter.
    #[error("venue transient failure: {0}")]
    VenueTransient(String),

    /// Auth failure, unknown symbol, precision or margin rejection. Not
    /// retried; the run transitions to Error.
    #[error("venue rejected request: {0}")]
    VenuePermanent(String),

    /// The risk gate suppressed an action. Informational, not a failure.
    #[error("risk gate denied action: {0}")]
    RiskDenied(String),

    /// A kernel raised but the run continues.
    #[error("kernel error: {0}")]
    KernelRecoverable(String),

    /// Open-run invariant violation or append against a closed run.
    #[error("ledger consistency violation: {0}")]
    LedgerConsistency(String),

    /// A stop command did not complete within its bound.
    #[error("stop did not complete within {0}s")]
    CancellationTimeout(u64),

    /// Any failure inside a backtest; the result is marked failed.
    #[error("backtest failed: {0}")]
    Backtest(String),
}

impl EngineError {
    /// Stable machine-readable tag for error events and command responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::VenueTransient(_) => "venue_transient",
            Self::VenuePermanent(_) => "venue_permanent",
            Self::RiskDenied(_) => "risk_denied",
            Self::KernelRecoverable(_) => "kernel_recoverable",
            Self::LedgerConsistency(_) => "ledger_consistency",
            Self::CancellationTimeout(_) => "cancellation_timeout",
            Self::Backtest(_) => "backtest",
        }
    }

    /// Whether the supervisor should end the run when this error escapes a
    /// tick.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::VenuePermanent(_) | Self::LedgerConsistency(_) | Self::CancellationTimeout(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::LedgerConsistency(err.to_string())
    }
}
