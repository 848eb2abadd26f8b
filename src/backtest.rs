// =============================================================================
// Backtest engine — deterministic bar replay of a strategy kernel
// =============================================================================
//
// The engine drives the SAME kernel decision function the live supervisor
// runs, against a `SimulatedExchange` cursor over historical bars:
//
//   advance bar -> mark refresh -> equity sample -> risk gate -> kernel ->
//   execute requests (fills at the NEXT bar's open) -> progress event
//
// Differences from live, by design:
//   - kernel failures are fatal (status `failed`, error stored)
//   - trades land in the backtest record, not in the live trade table
//   - any position left at the end is flattened at the final close
//
// Identical inputs (config, bar sequence, initial balance, fee rate) produce
// identical trade sequences and equity curves; nothing here reads the wall
// clock except the progress-event throttle.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{KernelId, StrategyConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::exchange::sim::SimulatedExchange;
use crate::exchange::ExchangeAdapter;
use crate::kernel::{Kernel, StrategyContext, TradeRequest};
use crate::ledger::Ledger;
use crate::position::Position;
use crate::risk::{self, RiskPolicy, RiskVerdict, RunRiskView};
use crate::types::{Bar, Fill, RunCounters, Side, Timeframe, TradeKind, TradeRecord};

/// Extra history handed to the kernel before the first replayed bar.
const WARMUP_BARS: usize = 120;
/// Venue cap on a single klines request.
const MAX_FETCH: u32 = 1500;
/// Minimum wall-time gap between progress events.
const PROGRESS_EVERY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A backtest submission. Symbol and timeframe default from the strategy's
/// configuration when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestParams {
    pub strategy_id: i64,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub initial_balance: f64,
    /// Flat fee, percent of fill notional.
    pub fee_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestStats {
    /// Fractional return over the initial balance.
    pub total_return: f64,
    pub win_rate: f64,
    /// Maximum peak-to-trough fraction of the equity curve.
    pub max_drawdown: f64,
    /// Annualized mean/std of per-bar returns.
    pub sharpe_ratio: f64,
    /// Sum of gains over |sum of losses|.
    pub profit_factor: f64,
    pub mean_win: f64,
    pub mean_loss: f64,
    pub total_trades: usize,
}

#[derive(Debug)]
pub(crate) struct ReplayResult {
    pub stats: BacktestStats,
    pub equity_curve: Vec<(i64, f64)>,
    pub trades: Vec<TradeRecord>,
}

/// Timeframe a backtest should replay at when the caller did not say:
/// bar-driven kernels carry their own, everything else defaults to hourly.
pub fn preferred_timeframe(cfg: &StrategyConfig) -> Timeframe {
    match cfg.kernel {
        KernelId::Trend => cfg.trend.as_ref().map(|s| s.timeframe),
        KernelId::MeanReversion => cfg.mean_reversion.as_ref().map(|s| s.timeframe),
        KernelId::Ml => cfg.ml.as_ref().map(|s| s.timeframe),
        _ => None,
    }
    .unwrap_or(Timeframe::H1)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Fetch bars, replay, persist. Spawned by the supervisor; all failures are
/// recorded on the backtest row and published, never panicked.
#[allow(clippy::too_many_arguments)]
pub async fn run_backtest(
    ledger: Ledger,
    exchange: Arc<dyn ExchangeAdapter>,
    bus: Arc<EventBus>,
    backtest_id: i64,
    cfg: StrategyConfig,
    symbol: String,
    timeframe: Timeframe,
    params: BacktestParams,
) {
    if let Err(e) = ledger.mark_backtest_running(backtest_id).await {
        warn!(backtest_id, error = %e, "could not mark backtest running");
    }

    let outcome = fetch_and_replay(
        &exchange, &bus, backtest_id, &cfg, &symbol, timeframe, &params,
    )
    .await;

    match outcome {
        Ok(result) => {
            let stats = serde_json::to_value(&result.stats).unwrap_or_default();
            let curve = serde_json::to_value(&result.equity_curve).unwrap_or_default();
            let trades = serde_json::to_value(&result.trades).unwrap_or_default();
            if let Err(e) = ledger
                .complete_backtest(backtest_id, &stats, &curve, &trades)
                .await
            {
                warn!(backtest_id, error = %e, "could not persist backtest result");
            }
            info!(
                backtest_id,
                trades = result.trades.len(),
                total_return = result.stats.total_return,
                "backtest completed"
            );
        }
        Err(e) => {
            warn!(backtest_id, error = %e, "backtest failed");
            if let Err(persist) = ledger.fail_backtest(backtest_id, &e.to_string()).await {
                warn!(backtest_id, error = %persist, "could not persist backtest failure");
            }
            bus.publish(Event::Error {
                strategy_id: Some(params.strategy_id),
                kind: "backtest".into(),
                message: e.to_string(),
            });
        }
    }
}

async fn fetch_and_replay(
    exchange: &Arc<dyn ExchangeAdapter>,
    bus: &Arc<EventBus>,
    backtest_id: i64,
    cfg: &StrategyConfig,
    symbol: &str,
    timeframe: Timeframe,
    params: &BacktestParams,
) -> EngineResult<ReplayResult> {
    if params.end_ms <= params.start_ms {
        return Err(EngineError::Backtest("time range is empty".into()));
    }
    if params.initial_balance <= 0.0 {
        return Err(EngineError::Backtest("initial balance must be positive".into()));
    }

    let span_bars =
        ((params.end_ms - params.start_ms) / (timeframe.duration_secs() as i64 * 1000)) as usize;
    let limit = (span_bars + WARMUP_BARS).min(MAX_FETCH as usize) as u32;
    let bars = exchange
        .fetch_bars(symbol, timeframe, limit)
        .await
        .map_err(|e| EngineError::Backtest(format!("bar fetch: {e}")))?;

    let bars: Vec<Bar> = bars
        .into_iter()
        .filter(|b| b.close_time <= params.end_ms)
        .collect();
    let start_index = bars
        .iter()
        .position(|b| b.open_time >= params.start_ms)
        .ok_or_else(|| EngineError::Backtest("no bars in the requested range".into()))?
        // Orders fill at the next bar's open, so the replay needs at least
        // one bar of runway before the first decision.
        .max(1);
    if start_index >= bars.len() {
        return Err(EngineError::Backtest("no bars in the requested range".into()));
    }

    replay(
        Some((bus.clone(), backtest_id)),
        cfg,
        symbol,
        timeframe,
        bars,
        start_index,
        params.initial_balance,
        params.fee_pct,
    )
    .await
}

// ---------------------------------------------------------------------------
// Replay core
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub(crate) async fn replay(
    progress: Option<(Arc<EventBus>, i64)>,
    cfg: &StrategyConfig,
    symbol: &str,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    start_index: usize,
    initial_balance: f64,
    fee_pct: f64,
) -> EngineResult<ReplayResult> {
    let total = bars.len().saturating_sub(start_index);
    if total == 0 {
        return Err(EngineError::Backtest("bar sequence is empty".into()));
    }

    let sim = Arc::new(SimulatedExchange::new(
        symbol,
        bars,
        start_index,
        initial_balance,
    ));
    let adapter: Arc<dyn ExchangeAdapter> = sim.clone();

    let mut kernel = Kernel::from_config(cfg)?;
    {
        let mut ctx = StrategyContext::new(cfg_strategy_id(cfg), cfg, &adapter);
        kernel
            .initialize(&mut ctx)
            .await
            .map_err(|e| EngineError::Backtest(format!("kernel initialize: {e}")))?;
    }

    let policy = RiskPolicy::from_config(cfg);
    let mut balance = initial_balance;
    let mut position: Option<Position> = None;
    let mut counters = RunCounters::default();
    let mut last_trade_at: Option<i64> = None;
    let mut trades: Vec<TradeRecord> = Vec::new();
    let mut equity_curve: Vec<(i64, f64)> = Vec::with_capacity(total);
    let mut last_progress = Instant::now();
    let mut current = 0usize;
    let mut last_bar: Option<Bar> = None;

    while let Some(bar) = sim.advance() {
        current += 1;

        // Ticker quotes this bar's close.
        let ticker = adapter.fetch_ticker(symbol).await?;
        if let Some(pos) = position.as_mut() {
            pos.set_mark(ticker.mark);
        }

        // Equity sample: balance plus unrealized at this bar's close.
        let unrealized = position.as_ref().map(|p| p.unrealized_pnl()).unwrap_or(0.0);
        equity_curve.push((bar.close_time, balance + unrealized));

        // Risk gate against the bare position.
        let run_view = RunRiskView {
            start_balance: initial_balance,
            realized_pnl: counters.realized_pnl,
            last_trade_at,
        };
        let verdict = risk::evaluate(position.as_ref(), &run_view, None, &policy, ticker.timestamp);

        match verdict {
            RiskVerdict::ForceClose(reason) => {
                if sim.has_next() {
                    if let Some(pos) = position.take() {
                        let fill = sim.close_market(symbol, pos.side).await?;
                        settle_close(
                            cfg, symbol, pos, &fill, fee_pct, &mut balance, &mut counters,
                            &mut trades, &mut last_trade_at, &mut kernel,
                        );
                    }
                    if reason.is_terminal() {
                        debug!(reason = %reason, bar = current, "backtest run terminal");
                        break;
                    }
                }
            }
            RiskVerdict::Allow | RiskVerdict::Deny(_) => {
                let requests = {
                    let mut ctx = StrategyContext::new(cfg_strategy_id(cfg), cfg, &adapter)
                        .with_market(&ticker, position.as_ref());
                    kernel
                        .run_once(&mut ctx)
                        .await
                        .map_err(|e| EngineError::Backtest(format!("kernel run_once: {e}")))?;
                    ctx.take_requests()
                };

                let mut stop = false;
                for request in requests {
                    let run_view = RunRiskView {
                        start_balance: initial_balance,
                        realized_pnl: counters.realized_pnl,
                        last_trade_at,
                    };
                    let verdict = risk::evaluate(
                        position.as_ref(),
                        &run_view,
                        Some(&request),
                        &policy,
                        ticker.timestamp,
                    );
                    match verdict {
                        RiskVerdict::Deny(reason) => {
                            debug!(kind = %request.kind, reason = %reason, "request denied");
                        }
                        RiskVerdict::ForceClose(reason) => {
                            if sim.has_next() {
                                if let Some(pos) = position.take() {
                                    let fill = sim.close_market(symbol, pos.side).await?;
                                    settle_close(
                                        cfg, symbol, pos, &fill, fee_pct, &mut balance,
                                        &mut counters, &mut trades, &mut last_trade_at,
                                        &mut kernel,
                                    );
                                }
                            }
                            stop = reason.is_terminal();
                            break;
                        }
                        RiskVerdict::Allow => {
                            if !sim.has_next() {
                                debug!("dropping request on the final bar");
                                continue;
                            }
                            execute_request(
                                cfg, symbol, &sim, &request, fee_pct, &mut balance,
                                &mut position, &mut counters, &mut trades, &mut last_trade_at,
                                &mut kernel,
                            )
                            .await?;
                        }
                    }
                }
                if stop {
                    break;
                }
            }
        }

        sim.set_balance(balance);
        last_bar = Some(bar);

        if let Some((bus, backtest_id)) = progress.as_ref() {
            if last_progress.elapsed() >= PROGRESS_EVERY {
                last_progress = Instant::now();
                bus.publish(Event::BacktestProgress {
                    backtest_id: *backtest_id,
                    current,
                    total,
                    percentage: current as f64 / total as f64 * 100.0,
                    current_balance: balance,
                });
            }
        }
    }

    // Flatten whatever is still open at the final close so every entry has a
    // realized outcome.
    if let (Some(pos), Some(bar)) = (position.take(), last_bar.as_ref()) {
        let fill = Fill {
            price: bar.close,
            qty: pos.qty,
            timestamp: bar.close_time,
        };
        settle_close(
            cfg, symbol, pos, &fill, fee_pct, &mut balance, &mut counters, &mut trades,
            &mut last_trade_at, &mut kernel,
        );
        if let Some(last) = equity_curve.last_mut() {
            last.1 = balance;
        }
    }

    if let Some((bus, backtest_id)) = progress.as_ref() {
        bus.publish(Event::BacktestProgress {
            backtest_id: *backtest_id,
            current,
            total,
            percentage: 100.0,
            current_balance: balance,
        });
    }

    let stats = compute_stats(initial_balance, balance, &equity_curve, &trades, timeframe);
    Ok(ReplayResult {
        stats,
        equity_curve,
        trades,
    })
}

fn cfg_strategy_id(_cfg: &StrategyConfig) -> i64 {
    // Simulated runs are not tied to a live strategy row.
    0
}

#[allow(clippy::too_many_arguments)]
async fn execute_request(
    cfg: &StrategyConfig,
    symbol: &str,
    sim: &Arc<SimulatedExchange>,
    request: &TradeRequest,
    fee_pct: f64,
    balance: &mut f64,
    position: &mut Option<Position>,
    counters: &mut RunCounters,
    trades: &mut Vec<TradeRecord>,
    last_trade_at: &mut Option<i64>,
    kernel: &mut Kernel,
) -> EngineResult<()> {
    match request.kind {
        TradeKind::Open | TradeKind::Add => {
            let Some(notional) = request.notional else {
                return Ok(());
            };
            let fill = sim.open_market(symbol, request.side, notional).await?;
            *balance -= fee(&fill, fee_pct);

            let kind = match position.take() {
                None => {
                    *position = Some(Position::open(
                        symbol,
                        request.side,
                        &fill,
                        cfg.trading.leverage,
                    ));
                    TradeKind::Open
                }
                Some(mut pos) => {
                    pos.apply_add(&fill);
                    *position = Some(pos);
                    TradeKind::Add
                }
            };
            push_trade(cfg, symbol, kind, request.side, &fill, None, counters, trades, kernel);
            *last_trade_at = Some(fill.timestamp);
        }
        TradeKind::Close => {
            let Some(pos) = position.as_mut() else {
                return Ok(());
            };
            let side = pos.side;
            let fill = match request.qty {
                Some(qty) if qty < pos.qty => sim.reduce_market(symbol, side, qty).await?,
                _ => sim.close_market(symbol, side).await?,
            };
            let pnl = pos.apply_close(&fill);
            *balance += pnl;
            *balance -= fee(&fill, fee_pct);
            if pos.is_flat() {
                *position = None;
            }
            push_trade(
                cfg,
                symbol,
                TradeKind::Close,
                side,
                &fill,
                Some(pnl),
                counters,
                trades,
                kernel,
            );
            *last_trade_at = Some(fill.timestamp);
        }
    }
    Ok(())
}

/// Apply a close fill to the books (outside the sim's own accounting).
#[allow(clippy::too_many_arguments)]
fn settle_close(
    cfg: &StrategyConfig,
    symbol: &str,
    mut pos: Position,
    fill: &Fill,
    fee_pct: f64,
    balance: &mut f64,
    counters: &mut RunCounters,
    trades: &mut Vec<TradeRecord>,
    last_trade_at: &mut Option<i64>,
    kernel: &mut Kernel,
) {
    let side = pos.side;
    let pnl = pos.apply_close(fill);
    *balance += pnl;
    *balance -= fee(fill, fee_pct);
    push_trade(cfg, symbol, TradeKind::Close, side, fill, Some(pnl), counters, trades, kernel);
    *last_trade_at = Some(fill.timestamp);
}

#[allow(clippy::too_many_arguments)]
fn push_trade(
    _cfg: &StrategyConfig,
    symbol: &str,
    kind: TradeKind,
    side: Side,
    fill: &Fill,
    pnl: Option<f64>,
    counters: &mut RunCounters,
    trades: &mut Vec<TradeRecord>,
    kernel: &mut Kernel,
) {
    counters.apply(pnl);
    let trade = TradeRecord {
        id: trades.len() as i64 + 1,
        strategy_id: 0,
        run_id: 0,
        kind,
        side,
        symbol: symbol.to_string(),
        price: fill.price,
        qty: fill.qty,
        pnl,
        executed_at: fill.timestamp,
    };
    kernel.on_trade(&trade);
    trades.push(trade);
}

fn fee(fill: &Fill, fee_pct: f64) -> f64 {
    fill.price * fill.qty * fee_pct / 100.0
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

pub(crate) fn compute_stats(
    initial_balance: f64,
    final_balance: f64,
    equity_curve: &[(i64, f64)],
    trades: &[TradeRecord],
    timeframe: Timeframe,
) -> BacktestStats {
    let total_return = if initial_balance > 0.0 {
        (final_balance - initial_balance) / initial_balance
    } else {
        0.0
    };

    let closed: Vec<f64> = trades.iter().filter_map(|t| t.pnl).collect();
    let wins: Vec<f64> = closed.iter().copied().filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = closed.iter().copied().filter(|&p| p < 0.0).collect();

    let win_rate = if closed.is_empty() {
        0.0
    } else {
        wins.len() as f64 / closed.len() as f64
    };
    let mean_win = if wins.is_empty() {
        0.0
    } else {
        wins.iter().sum::<f64>() / wins.len() as f64
    };
    let mean_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f64>() / losses.len() as f64
    };

    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();
    let profit_factor = if gross_loss > f64::EPSILON {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    // Max drawdown over the equity curve.
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0_f64;
    for &(_, equity) in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let drawdown = (peak - equity) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
    }

    // Sharpe: per-bar equity returns annualized by the timeframe.
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].1.abs() > f64::EPSILON)
        .map(|w| (w[1].1 - w[0].1) / w[0].1)
        .collect();
    let sharpe_ratio = if returns.is_empty() {
        0.0
    } else {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev > f64::EPSILON {
            mean / std_dev * timeframe.bars_per_year().sqrt()
        } else {
            0.0
        }
    };

    BacktestStats {
        total_return,
        win_rate,
        max_drawdown,
        sharpe_ratio,
        profit_factor,
        mean_win,
        mean_loss,
        total_trades: trades.len(),
    }
}
