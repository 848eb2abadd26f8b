// =============================================================================
// Per-strategy control loop
// =============================================================================
//
// One cooperative loop per running strategy. Each tick:
//   1. refresh the ticker and the position's mark price
//   2. evaluate the risk gate against the position (force-close rules)
//   3. on ForceClose: flatten via the adapter, append the close trade, and
//      skip the kernel this tick
//   4. otherwise run the kernel once and execute its queued requests inline,
//      re-evaluating the gate per request
//   5. publish a strategy_status event and stamp the heartbeat
//
// Exception policy: kernel errors are counted and published; five in a row
// end the run in Error. A venue-permanent or ledger error ends it
// immediately. A failed order is never recorded — the venue owns the truth.
//
// Stop is cooperative: the current tick completes, then teardown optionally
// force-closes the position, shuts the kernel down, and closes the run.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::StrategyConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeAdapter;
use crate::kernel::{Kernel, StrategyContext, TradeRequest};
use crate::ledger::{Ledger, NewTrade};
use crate::position::Position;
use crate::risk::{self, CloseReason, RiskPolicy, RiskVerdict, RunRiskView};
use crate::types::{RunCounters, RunStatus, StrategyState, StrategyStatus, Ticker, TradeKind};

use super::StrategyHandle;

/// Consecutive kernel failures that flip the run to Error.
pub(crate) const KERNEL_ERROR_THRESHOLD: u32 = 5;

/// Everything the loop needs from the outside.
#[derive(Clone)]
pub(crate) struct RunnerDeps {
    pub ledger: Ledger,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub bus: Arc<EventBus>,
}

/// Command channel payloads.
#[derive(Debug, Clone, Copy)]
pub enum RunnerCommand {
    ForceRetrain,
}

/// Stop request delivered over the watch channel.
#[derive(Debug, Clone, Copy)]
pub struct StopRequest {
    pub close_positions: bool,
}

/// Mutable per-run state owned by the loop.
pub(crate) struct RunState {
    pub strategy_id: i64,
    pub run_id: i64,
    pub symbol: String,
    pub leverage: u32,
    pub policy: RiskPolicy,
    pub start_balance: f64,
    pub counters: RunCounters,
    pub position: Option<Position>,
    pub last_trade_at: Option<i64>,
    pub consecutive_errors: u32,
}

impl RunState {
    fn risk_view(&self) -> RunRiskView {
        RunRiskView {
            start_balance: self.start_balance,
            realized_pnl: self.counters.realized_pnl,
            last_trade_at: self.last_trade_at,
        }
    }
}

pub(crate) enum TickOutcome {
    Continue,
    Terminal(RunStatus),
}

enum LoopEnd {
    Stop(StopRequest),
    Terminal(RunStatus),
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(crate) async fn run_loop(
    handle: Arc<StrategyHandle>,
    deps: RunnerDeps,
    cfg: StrategyConfig,
    mut kernel: Kernel,
    mut state: RunState,
    mut stop_rx: watch::Receiver<Option<StopRequest>>,
    mut cmd_rx: mpsc::Receiver<RunnerCommand>,
) {
    let mut interval = tokio::time::interval(cfg.check_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; consume it so the loop
    // starts with a full sleep like every later iteration.
    interval.tick().await;

    info!(
        strategy_id = state.strategy_id,
        run_id = state.run_id,
        interval_s = cfg.monitoring.check_interval_seconds,
        "strategy loop started"
    );

    let end = loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break LoopEnd::Stop(StopRequest { close_positions: true });
                }
                let request = *stop_rx.borrow();
                if let Some(request) = request {
                    break LoopEnd::Stop(request);
                }
            }
            Some(command) = cmd_rx.recv() => {
                match command {
                    RunnerCommand::ForceRetrain => {
                        debug!(strategy_id = state.strategy_id, "force retrain requested");
                        kernel.force_retrain();
                    }
                }
            }
            _ = interval.tick() => {
                match run_tick(&deps, &cfg, &mut kernel, &mut state, &handle).await {
                    TickOutcome::Continue => {}
                    TickOutcome::Terminal(status) => break LoopEnd::Terminal(status),
                }
            }
        }
    };

    teardown(&handle, &deps, &cfg, &mut kernel, &mut state, end).await;
}

// ---------------------------------------------------------------------------
// One tick
// ---------------------------------------------------------------------------

pub(crate) async fn run_tick(
    deps: &RunnerDeps,
    cfg: &StrategyConfig,
    kernel: &mut Kernel,
    state: &mut RunState,
    handle: &StrategyHandle,
) -> TickOutcome {
    // ── 1. Market refresh ───────────────────────────────────────────────
    let ticker = match deps.exchange.fetch_ticker(&state.symbol).await {
        Ok(ticker) => ticker,
        Err(e) => return absorb_error(deps, state, handle, e),
    };

    if let Some(pos) = state.position.as_mut() {
        pos.set_mark(ticker.mark);
    }
    if let Some(pos) = state.position.clone() {
        if let Err(e) = deps.ledger.upsert_position(state.run_id, Some(&pos)).await {
            return absorb_error(deps, state, handle, e);
        }
    }

    // ── 2. Risk gate on the bare position ───────────────────────────────
    let verdict = risk::evaluate(
        state.position.as_ref(),
        &state.risk_view(),
        None,
        &state.policy,
        ticker.timestamp,
    );

    match verdict {
        RiskVerdict::ForceClose(reason) => {
            // ── 3. Forced liquidation; the kernel is skipped this tick ──
            match force_close(deps, state, kernel, reason, &ticker).await {
                Ok(()) if reason.is_terminal() => {
                    finish_tick(deps, state, handle, &ticker);
                    return TickOutcome::Terminal(RunStatus::MaxLoss);
                }
                Ok(()) => {}
                Err(e) => return absorb_error(deps, state, handle, e),
            }
        }
        RiskVerdict::Allow | RiskVerdict::Deny(_) => {
            // ── 4. Kernel decision step ─────────────────────────────────
            let requests = {
                let mut ctx = StrategyContext::new(state.strategy_id, cfg, &deps.exchange)
                    .with_market(&ticker, state.position.as_ref());
                match kernel.run_once(&mut ctx).await {
                    Ok(()) => ctx.take_requests(),
                    Err(e) => {
                        return absorb_error(deps, state, handle, e);
                    }
                }
            };
            state.consecutive_errors = 0;

            if let Some(status) = execute_requests(deps, state, kernel, &ticker, requests).await {
                finish_tick(deps, state, handle, &ticker);
                return TickOutcome::Terminal(status);
            }
        }
    }

    // ── 5. Status + heartbeat ───────────────────────────────────────────
    finish_tick(deps, state, handle, &ticker);
    TickOutcome::Continue
}

fn finish_tick(deps: &RunnerDeps, state: &RunState, handle: &StrategyHandle, ticker: &Ticker) {
    *handle.counters.write() = state.counters;
    *handle.position.write() = state.position.clone();
    *handle.last_tick_at.write() = Some(ticker.timestamp);

    deps.bus.publish(Event::StrategyStatus {
        strategy_id: state.strategy_id,
        status: handle.state.read().to_string(),
        counters: state.counters,
    });
}

/// Classify an error escaping a tick step: permanent/ledger errors end the
/// run; everything else is published, counted, and absorbed.
fn absorb_error(
    deps: &RunnerDeps,
    state: &mut RunState,
    handle: &StrategyHandle,
    err: EngineError,
) -> TickOutcome {
    deps.bus.publish(Event::Error {
        strategy_id: Some(state.strategy_id),
        kind: err.kind().to_string(),
        message: err.to_string(),
    });

    if err.is_fatal_to_run() {
        error!(strategy_id = state.strategy_id, error = %err, "fatal error, run ends");
        return TickOutcome::Terminal(RunStatus::Error);
    }

    state.consecutive_errors += 1;
    warn!(
        strategy_id = state.strategy_id,
        consecutive = state.consecutive_errors,
        error = %err,
        "recoverable error absorbed"
    );
    if state.consecutive_errors >= KERNEL_ERROR_THRESHOLD {
        error!(
            strategy_id = state.strategy_id,
            threshold = KERNEL_ERROR_THRESHOLD,
            "error threshold reached, run ends"
        );
        *handle.counters.write() = state.counters;
        return TickOutcome::Terminal(RunStatus::Error);
    }
    TickOutcome::Continue
}

// ---------------------------------------------------------------------------
// Forced liquidation
// ---------------------------------------------------------------------------

async fn force_close(
    deps: &RunnerDeps,
    state: &mut RunState,
    kernel: &mut Kernel,
    reason: CloseReason,
    ticker: &Ticker,
) -> EngineResult<()> {
    let Some(mut pos) = state.position.clone() else {
        // Max-loss can fire with no position open; nothing to flatten.
        return Ok(());
    };

    warn!(
        strategy_id = state.strategy_id,
        reason = %reason,
        mark = ticker.mark,
        "risk gate forced close"
    );

    let fill = deps.exchange.close_market(&state.symbol, pos.side).await?;
    let pnl = pos.apply_close(&fill);

    record_fill(
        deps,
        state,
        kernel,
        TradeKind::Close,
        pos.side,
        &fill,
        Some(pnl),
        None,
    )
    .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Kernel request execution
// ---------------------------------------------------------------------------

/// Execute queued requests in order. Returns a terminal status when one ends
/// the run.
async fn execute_requests(
    deps: &RunnerDeps,
    state: &mut RunState,
    kernel: &mut Kernel,
    ticker: &Ticker,
    requests: Vec<TradeRequest>,
) -> Option<RunStatus> {
    for request in requests {
        let verdict = risk::evaluate(
            state.position.as_ref(),
            &state.risk_view(),
            Some(&request),
            &state.policy,
            ticker.timestamp,
        );

        match verdict {
            RiskVerdict::Deny(reason) => {
                debug!(
                    strategy_id = state.strategy_id,
                    kind = %request.kind,
                    reason = %reason,
                    "risk gate denied request"
                );
                deps.bus.publish(Event::Error {
                    strategy_id: Some(state.strategy_id),
                    kind: "risk_denied".into(),
                    message: format!("{} {} denied: {reason}", request.kind, request.side),
                });
            }
            RiskVerdict::ForceClose(reason) => {
                match force_close(deps, state, kernel, reason, ticker).await {
                    Ok(()) if reason.is_terminal() => return Some(RunStatus::MaxLoss),
                    Ok(()) => {}
                    Err(e) if e.is_fatal_to_run() => {
                        publish_error(deps, state.strategy_id, &e);
                        return Some(RunStatus::Error);
                    }
                    Err(e) => publish_error(deps, state.strategy_id, &e),
                }
                // The board changed under the kernel; drop remaining requests.
                return None;
            }
            RiskVerdict::Allow => {
                if let Err(e) = execute_trade(deps, state, kernel, &request).await {
                    publish_error(deps, state.strategy_id, &e);
                    if e.is_fatal_to_run() {
                        return Some(RunStatus::Error);
                    }
                    // Retries exhausted: the trade is NOT recorded and the
                    // run continues.
                }
            }
        }
    }
    None
}

async fn execute_trade(
    deps: &RunnerDeps,
    state: &mut RunState,
    kernel: &mut Kernel,
    request: &TradeRequest,
) -> EngineResult<()> {
    match request.kind {
        TradeKind::Open | TradeKind::Add => {
            let notional = request.notional.ok_or_else(|| {
                EngineError::KernelRecoverable(format!(
                    "{} request without a notional",
                    request.kind
                ))
            })?;
            let fill = deps
                .exchange
                .open_market(&state.symbol, request.side, notional)
                .await?;

            let kind = match state.position.take() {
                None => {
                    state.position = Some(Position::open(
                        &state.symbol,
                        request.side,
                        &fill,
                        state.leverage,
                    ));
                    TradeKind::Open
                }
                Some(mut pos) if pos.side == request.side => {
                    pos.apply_add(&fill);
                    state.position = Some(pos);
                    TradeKind::Add
                }
                Some(pos) => {
                    let held = pos.side;
                    state.position = Some(pos);
                    return Err(EngineError::KernelRecoverable(format!(
                        "kernel requested {} while holding {held}",
                        request.side
                    )));
                }
            };

            record_fill(deps, state, kernel, kind, request.side, &fill, None, None).await;
        }
        TradeKind::Close => {
            let Some(pos) = state.position.clone() else {
                return Err(EngineError::KernelRecoverable(
                    "close requested with no open position".into(),
                ));
            };

            let fill = match request.qty {
                // Partial exits below the full size reduce; anything else
                // flattens.
                Some(qty) if qty < pos.qty => {
                    deps.exchange
                        .reduce_market(&state.symbol, pos.side, qty)
                        .await?
                }
                _ => deps.exchange.close_market(&state.symbol, pos.side).await?,
            };

            let mut pos = pos;
            let pnl = pos.apply_close(&fill);
            state.position = if pos.is_flat() { None } else { Some(pos) };

            record_fill(
                deps,
                state,
                kernel,
                TradeKind::Close,
                request.side,
                &fill,
                Some(pnl),
                Some(state.position.clone()),
            )
            .await;
        }
    }
    Ok(())
}

/// Persist one fill: append the trade (counter update included), sync the
/// position row, notify the kernel, publish events. A ledger refusal is a
/// reconciliation anomaly: logged and published, never retried.
#[allow(clippy::too_many_arguments)]
async fn record_fill(
    deps: &RunnerDeps,
    state: &mut RunState,
    kernel: &mut Kernel,
    kind: TradeKind,
    side: crate::types::Side,
    fill: &crate::types::Fill,
    pnl: Option<f64>,
    position_after_close: Option<Option<Position>>,
) {
    // For closes the caller already mutated its own copy; sync state first.
    if let Some(after) = position_after_close {
        state.position = after;
    } else if kind == TradeKind::Close {
        state.position = None;
    }

    let new_trade = NewTrade {
        strategy_id: state.strategy_id,
        kind,
        side,
        symbol: state.symbol.clone(),
        price: fill.price,
        qty: fill.qty,
        pnl,
        executed_at: fill.timestamp,
    };

    let trade = match deps.ledger.append_trade(state.run_id, &new_trade).await {
        Ok(trade) => trade,
        Err(e) => {
            error!(
                strategy_id = state.strategy_id,
                run_id = state.run_id,
                error = %e,
                "trade append refused — reconciliation anomaly"
            );
            publish_error(deps, state.strategy_id, &e);
            return;
        }
    };

    state.counters.apply(pnl);
    state.last_trade_at = Some(fill.timestamp);

    if let Err(e) = deps
        .ledger
        .upsert_position(state.run_id, state.position.as_ref())
        .await
    {
        publish_error(deps, state.strategy_id, &e);
    }

    kernel.on_trade(&trade);

    info!(
        strategy_id = state.strategy_id,
        run_id = state.run_id,
        kind = %kind,
        price = fill.price,
        qty = fill.qty,
        pnl = ?pnl,
        "trade recorded"
    );

    deps.bus.publish(Event::Trade { trade });
    deps.bus.publish(Event::Position {
        strategy_id: state.strategy_id,
        position: state.position.clone(),
    });
}

fn publish_error(deps: &RunnerDeps, strategy_id: i64, err: &EngineError) {
    deps.bus.publish(Event::Error {
        strategy_id: Some(strategy_id),
        kind: err.kind().to_string(),
        message: err.to_string(),
    });
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

async fn teardown(
    handle: &StrategyHandle,
    deps: &RunnerDeps,
    cfg: &StrategyConfig,
    kernel: &mut Kernel,
    state: &mut RunState,
    end: LoopEnd,
) {
    *handle.state.write() = StrategyState::Stopping;

    let (run_status, reason) = match &end {
        LoopEnd::Stop(_) => (RunStatus::Completed, "stop"),
        LoopEnd::Terminal(RunStatus::MaxLoss) => (RunStatus::MaxLoss, "max-loss"),
        LoopEnd::Terminal(status) => (*status, "error"),
    };

    // Forced liquidation on a clean stop (default behavior). Error paths do
    // not touch the venue; reconciliation is a human decision there.
    let close_positions = match end {
        LoopEnd::Stop(req) => req.close_positions,
        LoopEnd::Terminal(_) => false,
    };

    if close_positions {
        if let Some(pos) = state.position.clone() {
            match deps.exchange.close_market(&state.symbol, pos.side).await {
                Ok(fill) => {
                    let mut pos = pos;
                    let pnl = pos.apply_close(&fill);
                    record_fill(
                        deps,
                        state,
                        kernel,
                        TradeKind::Close,
                        pos.side,
                        &fill,
                        Some(pnl),
                        Some(None),
                    )
                    .await;
                }
                Err(e) => {
                    error!(
                        strategy_id = state.strategy_id,
                        error = %e,
                        "failed to liquidate on stop"
                    );
                    publish_error(deps, state.strategy_id, &e);
                }
            }
        }
    }

    let mut ctx = StrategyContext::new(state.strategy_id, cfg, &deps.exchange);
    if let Err(e) = kernel.shutdown(&mut ctx, reason).await {
        warn!(strategy_id = state.strategy_id, error = %e, "kernel shutdown failed");
    }

    let end_balance = match deps.exchange.fetch_balance().await {
        Ok(balance) => balance.total,
        Err(_) => state.start_balance + state.counters.realized_pnl,
    };

    if let Err(e) = deps
        .ledger
        .close_run(state.run_id, Some(end_balance), &state.counters, run_status)
        .await
    {
        error!(run_id = state.run_id, error = %e, "close_run failed");
    }

    let (final_state, strategy_status) = match run_status {
        RunStatus::Error => (StrategyState::Error, StrategyStatus::Error),
        _ => (StrategyState::Stopped, StrategyStatus::Stopped),
    };
    if let Err(e) = deps
        .ledger
        .set_strategy_status(state.strategy_id, strategy_status)
        .await
    {
        error!(strategy_id = state.strategy_id, error = %e, "status update failed");
    }

    *handle.state.write() = final_state;
    *handle.counters.write() = state.counters;
    *handle.position.write() = state.position.clone();

    deps.bus.publish(Event::StrategyStatus {
        strategy_id: state.strategy_id,
        status: final_state.to_string(),
        counters: state.counters,
    });

    info!(
        strategy_id = state.strategy_id,
        run_id = state.run_id,
        status = %run_status,
        end_balance,
        "strategy loop ended"
    );
}
