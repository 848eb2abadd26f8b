// =============================================================================
// Borealis — multi-strategy crypto-futures trading supervisor
// =============================================================================
//
// Library surface consumed by the `borealis` binary and by the external
// HTTP/WebSocket command layer. The interesting entry points:
//
//   - `supervisor::Supervisor` — strategy lifecycle + command surface
//   - `backtest`               — deterministic bar replay
//   - `events::EventBus`       — real-time fan-out for subscribers
//   - `ledger::Ledger`         — persisted strategies/runs/trades/results
// =============================================================================

pub mod account;
pub mod backtest;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod indicators;
pub mod kernel;
pub mod ledger;
pub mod position;
pub mod risk;
pub mod settings;
pub mod supervisor;
pub mod templates;
pub mod types;
