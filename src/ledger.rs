// =============================================================================
// Ledger — persistent store for strategies, runs, trades, positions,
// account snapshots, and backtest results
// =============================================================================
//
// Single SQLite connection behind an async mutex: one writer, serializable
// writes. WAL journal mode so readers in other processes never block the
// engine. The connection is shared via Arc and every method takes &self.
//
// Invariants enforced here:
//   - at most one open run per strategy (partial unique index + check)
//   - trades append only against the run that is open at the instant of
//     append; a closed run rejects the append with LedgerConsistency
//   - appendTrade atomically updates the owning run's counters
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::position::Position;
use crate::types::{
    AccountSnapshot, BacktestStatus, RunCounters, RunStatus, Side, StrategyKind, StrategyStatus,
    TradeKind, TradeRecord,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct StrategyRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub kind: StrategyKind,
    pub config: serde_json::Value,
    pub status: StrategyStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub strategy_id: i64,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
    pub start_balance: f64,
    pub end_balance: Option<f64>,
    pub counters: RunCounters,
    pub status: RunStatus,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BacktestRecord {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub timeframe: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub initial_balance: f64,
    pub fee_pct: f64,
    pub status: BacktestStatus,
    pub error: Option<String>,
    pub stats: Option<serde_json::Value>,
    pub equity_curve: Option<serde_json::Value>,
    pub trades: Option<serde_json::Value>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Fields of a trade known before the ledger assigns its id.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub strategy_id: i64,
    pub kind: TradeKind,
    pub side: Side,
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub pnl: Option<f64>,
    pub executed_at: i64,
}

/// One page of a filtered listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, path)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, path: &str) -> EngineResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind        TEXT NOT NULL,
                config      TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'stopped',
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id   INTEGER NOT NULL,
                started_at    INTEGER NOT NULL,
                stopped_at    INTEGER,
                start_balance REAL NOT NULL,
                end_balance   REAL,
                total_trades  INTEGER NOT NULL DEFAULT 0,
                win_trades    INTEGER NOT NULL DEFAULT 0,
                loss_trades   INTEGER NOT NULL DEFAULT 0,
                realized_pnl  REAL NOT NULL DEFAULT 0,
                status        TEXT NOT NULL DEFAULT 'open'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_open
                ON runs(strategy_id) WHERE stopped_at IS NULL;

            CREATE TABLE IF NOT EXISTS trades (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id INTEGER NOT NULL,
                run_id      INTEGER NOT NULL,
                kind        TEXT NOT NULL,
                side        TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                price       REAL NOT NULL,
                qty         REAL NOT NULL,
                pnl         REAL,
                executed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_id, executed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_trades_run ON trades(run_id, executed_at ASC);

            CREATE TABLE IF NOT EXISTS positions (
                run_id      INTEGER PRIMARY KEY,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                entry_price REAL NOT NULL,
                qty         REAL NOT NULL,
                notional    REAL NOT NULL,
                leverage    INTEGER NOT NULL,
                opened_at   INTEGER NOT NULL,
                mark_price  REAL NOT NULL,
                additions   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_snapshots (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                captured_at    INTEGER NOT NULL,
                total          REAL NOT NULL,
                free           REAL NOT NULL,
                used           REAL NOT NULL,
                unrealized_pnl REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON account_snapshots(captured_at ASC);

            CREATE TABLE IF NOT EXISTS backtests (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id     INTEGER NOT NULL,
                symbol          TEXT NOT NULL,
                timeframe       TEXT NOT NULL,
                start_ms        INTEGER NOT NULL,
                end_ms          INTEGER NOT NULL,
                initial_balance REAL NOT NULL,
                fee_pct         REAL NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                error           TEXT,
                stats           TEXT,
                equity_curve    TEXT,
                trades          TEXT,
                created_at      INTEGER NOT NULL,
                finished_at     INTEGER
            );",
        )?;

        info!(path, "ledger opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    pub async fn create_strategy(
        &self,
        name: &str,
        description: &str,
        kind: StrategyKind,
        config: &serde_json::Value,
    ) -> EngineResult<i64> {
        let conn = self.conn.lock().await;
        let now = now_ms();
        conn.execute(
            "INSERT INTO strategies (name, description, kind, config, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'stopped', ?5, ?5)",
            params![name, description, kind.to_string(), config.to_string(), now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, name, "strategy created");
        Ok(id)
    }

    pub async fn update_strategy(
        &self,
        id: i64,
        name: &str,
        description: &str,
        config: &serde_json::Value,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE strategies SET name = ?2, description = ?3, config = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, name, description, config.to_string(), now_ms()],
        )?;
        if changed == 0 {
            return Err(EngineError::LedgerConsistency(format!(
                "strategy {id} not found"
            )));
        }
        Ok(())
    }

    pub async fn set_strategy_status(&self, id: i64, status: StrategyStatus) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE strategies SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub async fn get_strategy(&self, id: i64) -> EngineResult<Option<StrategyRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, description, kind, config, status, created_at, updated_at
             FROM strategies WHERE id = ?1",
        )?;
        let record = stmt
            .query_row(params![id], strategy_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn list_strategies(&self) -> EngineResult<Vec<StrategyRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, description, kind, config, status, created_at, updated_at
             FROM strategies ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], strategy_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletion is forbidden while the strategy has an open run.
    pub async fn delete_strategy(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let open: Option<i64> = conn
            .query_row(
                "SELECT id FROM runs WHERE strategy_id = ?1 AND stopped_at IS NULL",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(run_id) = open {
            return Err(EngineError::LedgerConsistency(format!(
                "strategy {id} still has open run {run_id}"
            )));
        }
        let changed = conn.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::LedgerConsistency(format!(
                "strategy {id} not found"
            )));
        }
        debug!(id, "strategy deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Open a run; fails with LedgerConsistency when one is already open.
    pub async fn open_run(&self, strategy_id: i64, start_balance: f64) -> EngineResult<i64> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO runs (strategy_id, started_at, start_balance) VALUES (?1, ?2, ?3)",
            params![strategy_id, now_ms(), start_balance],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!(strategy_id, run_id = id, start_balance, "run opened");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EngineError::LedgerConsistency(format!(
                    "strategy {strategy_id} already has an open run"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close_run(
        &self,
        run_id: i64,
        end_balance: Option<f64>,
        counters: &RunCounters,
        status: RunStatus,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE runs SET stopped_at = ?2, end_balance = ?3, total_trades = ?4,
                    win_trades = ?5, loss_trades = ?6, realized_pnl = ?7, status = ?8
             WHERE id = ?1 AND stopped_at IS NULL",
            params![
                run_id,
                now_ms(),
                end_balance,
                counters.total_trades,
                counters.win_trades,
                counters.loss_trades,
                counters.realized_pnl,
                status.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::LedgerConsistency(format!(
                "run {run_id} is not open"
            )));
        }
        debug!(run_id, status = %status, "run closed");
        Ok(())
    }

    pub async fn open_run_id(&self, strategy_id: i64) -> EngineResult<Option<i64>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT id FROM runs WHERE strategy_id = ?1 AND stopped_at IS NULL",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub async fn get_run(&self, run_id: i64) -> EngineResult<Option<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, started_at, stopped_at, start_balance, end_balance,
                    total_trades, win_trades, loss_trades, realized_pnl, status
             FROM runs WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![run_id], run_from_row).optional()?)
    }

    pub async fn list_runs(&self, strategy_id: i64) -> EngineResult<Vec<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, started_at, stopped_at, start_balance, end_balance,
                    total_trades, win_trades, loss_trades, realized_pnl, status
             FROM runs WHERE strategy_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![strategy_id], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Append a trade to its open run and fold it into the run counters, in
    /// one transaction. Appending against a closed (or missing) run fails.
    pub async fn append_trade(&self, run_id: i64, trade: &NewTrade) -> EngineResult<TradeRecord> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let stopped_at: Option<Option<i64>> = tx
            .query_row(
                "SELECT stopped_at FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match stopped_at {
            None => {
                return Err(EngineError::LedgerConsistency(format!(
                    "run {run_id} does not exist"
                )))
            }
            Some(Some(_)) => {
                return Err(EngineError::LedgerConsistency(format!(
                    "run {run_id} is closed; trade not appended"
                )))
            }
            Some(None) => {}
        }

        tx.execute(
            "INSERT INTO trades (strategy_id, run_id, kind, side, symbol, price, qty, pnl, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.strategy_id,
                run_id,
                trade.kind.to_string(),
                trade.side.to_string(),
                trade.symbol,
                trade.price,
                trade.qty,
                trade.pnl,
                trade.executed_at
            ],
        )?;
        let id = tx.last_insert_rowid();

        let (win, loss) = match trade.pnl {
            Some(pnl) if pnl > 0.0 => (1, 0),
            Some(pnl) if pnl < 0.0 => (0, 1),
            _ => (0, 0),
        };
        tx.execute(
            "UPDATE runs SET total_trades = total_trades + 1,
                    win_trades = win_trades + ?2,
                    loss_trades = loss_trades + ?3,
                    realized_pnl = realized_pnl + ?4
             WHERE id = ?1",
            params![run_id, win, loss, trade.pnl.unwrap_or(0.0)],
        )?;

        tx.commit()?;
        debug!(trade_id = id, run_id, kind = %trade.kind, "trade appended");

        Ok(TradeRecord {
            id,
            strategy_id: trade.strategy_id,
            run_id,
            kind: trade.kind,
            side: trade.side,
            symbol: trade.symbol.clone(),
            price: trade.price,
            qty: trade.qty,
            pnl: trade.pnl,
            executed_at: trade.executed_at,
        })
    }

    pub async fn list_trades(
        &self,
        strategy_id: Option<i64>,
        run_id: Option<i64>,
        offset: u32,
        limit: u32,
    ) -> EngineResult<Page<TradeRecord>> {
        let conn = self.conn.lock().await;

        let (filter, filter_id) = match (strategy_id, run_id) {
            (_, Some(run)) => ("WHERE run_id = ?1", run),
            (Some(strategy), None) => ("WHERE strategy_id = ?1", strategy),
            (None, None) => ("WHERE ?1 >= 0", 0),
        };

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM trades {filter}"),
            params![filter_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, strategy_id, run_id, kind, side, symbol, price, qty, pnl, executed_at
             FROM trades {filter} ORDER BY id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![filter_id, limit, offset], trade_from_row)?;
        let items = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(Page { items, total })
    }

    pub async fn list_run_trades(&self, run_id: i64) -> EngineResult<Vec<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, run_id, kind, side, symbol, price, qty, pnl, executed_at
             FROM trades WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], trade_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Persist the run's position snapshot; `None` deletes it.
    pub async fn upsert_position(
        &self,
        run_id: i64,
        position: Option<&Position>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        match position {
            Some(pos) => {
                conn.execute(
                    "INSERT INTO positions
                        (run_id, symbol, side, entry_price, qty, notional, leverage,
                         opened_at, mark_price, additions)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(run_id) DO UPDATE SET
                        symbol = excluded.symbol, side = excluded.side,
                        entry_price = excluded.entry_price, qty = excluded.qty,
                        notional = excluded.notional, leverage = excluded.leverage,
                        opened_at = excluded.opened_at, mark_price = excluded.mark_price,
                        additions = excluded.additions",
                    params![
                        run_id,
                        pos.symbol,
                        pos.side.to_string(),
                        pos.entry_price,
                        pos.qty,
                        pos.notional,
                        pos.leverage,
                        pos.opened_at,
                        pos.mark_price,
                        pos.additions
                    ],
                )?;
            }
            None => {
                conn.execute("DELETE FROM positions WHERE run_id = ?1", params![run_id])?;
            }
        }
        Ok(())
    }

    pub async fn get_position(&self, run_id: i64) -> EngineResult<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, side, entry_price, qty, notional, leverage, opened_at,
                    mark_price, additions
             FROM positions WHERE run_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![run_id], position_from_row)
            .optional()?)
    }

    // -------------------------------------------------------------------------
    // Account snapshots
    // -------------------------------------------------------------------------

    pub async fn snapshot_account(&self, snapshot: &AccountSnapshot) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO account_snapshots (captured_at, total, free, used, unrealized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.captured_at,
                snapshot.total,
                snapshot.free,
                snapshot.used,
                snapshot.unrealized_pnl
            ],
        )?;
        Ok(())
    }

    pub async fn query_snapshots(&self, since_ms: i64) -> EngineResult<Vec<AccountSnapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT captured_at, total, free, used, unrealized_pnl
             FROM account_snapshots WHERE captured_at >= ?1 ORDER BY captured_at ASC",
        )?;
        let rows = stmt.query_map(params![since_ms], |row| {
            Ok(AccountSnapshot {
                captured_at: row.get(0)?,
                total: row.get(1)?,
                free: row.get(2)?,
                used: row.get(3)?,
                unrealized_pnl: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop snapshots older than the retention window; returns rows removed.
    pub async fn prune_snapshots(&self, before_ms: i64) -> EngineResult<u64> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM account_snapshots WHERE captured_at < ?1",
            params![before_ms],
        )?;
        Ok(removed as u64)
    }

    // -------------------------------------------------------------------------
    // Backtests
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_backtest(
        &self,
        strategy_id: i64,
        symbol: &str,
        timeframe: &str,
        start_ms: i64,
        end_ms: i64,
        initial_balance: f64,
        fee_pct: f64,
    ) -> EngineResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO backtests
                (strategy_id, symbol, timeframe, start_ms, end_ms, initial_balance,
                 fee_pct, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                strategy_id,
                symbol,
                timeframe,
                start_ms,
                end_ms,
                initial_balance,
                fee_pct,
                now_ms()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn mark_backtest_running(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE backtests SET status = 'running' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub async fn complete_backtest(
        &self,
        id: i64,
        stats: &serde_json::Value,
        equity_curve: &serde_json::Value,
        trades: &serde_json::Value,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE backtests SET status = 'completed', stats = ?2, equity_curve = ?3,
                    trades = ?4, finished_at = ?5 WHERE id = ?1",
            params![
                id,
                stats.to_string(),
                equity_curve.to_string(),
                trades.to_string(),
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub async fn fail_backtest(&self, id: i64, message: &str) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE backtests SET status = 'failed', error = ?2, finished_at = ?3 WHERE id = ?1",
            params![id, message, now_ms()],
        )?;
        Ok(())
    }

    pub async fn get_backtest(&self, id: i64) -> EngineResult<Option<BacktestRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, symbol, timeframe, start_ms, end_ms, initial_balance,
                    fee_pct, status, error, stats, equity_curve, trades, created_at, finished_at
             FROM backtests WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![id], |row| backtest_from_row(row, true))
            .optional()?)
    }

    /// Listing omits the heavy equity-curve and trade payloads.
    pub async fn list_backtests(&self) -> EngineResult<Vec<BacktestRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, symbol, timeframe, start_ms, end_ms, initial_balance,
                    fee_pct, status, error, stats, equity_curve, trades, created_at, finished_at
             FROM backtests ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| backtest_from_row(row, false))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn delete_backtest(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM backtests WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::LedgerConsistency(format!(
                "backtest {id} not found"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn parse_enum<T: std::str::FromStr>(raw: String, idx: usize) -> Result<T, rusqlite::Error> {
    raw.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, raw, rusqlite::types::Type::Text)
    })
}

fn strategy_from_row(row: &Row<'_>) -> Result<StrategyRecord, rusqlite::Error> {
    let config_raw: String = row.get(4)?;
    Ok(StrategyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kind: parse_enum(row.get::<_, String>(3)?, 3)?,
        config: serde_json::from_str(&config_raw).unwrap_or(serde_json::Value::Null),
        status: parse_enum(row.get::<_, String>(5)?, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord, rusqlite::Error> {
    Ok(RunRecord {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        started_at: row.get(2)?,
        stopped_at: row.get(3)?,
        start_balance: row.get(4)?,
        end_balance: row.get(5)?,
        counters: RunCounters {
            total_trades: row.get(6)?,
            win_trades: row.get(7)?,
            loss_trades: row.get(8)?,
            realized_pnl: row.get(9)?,
        },
        status: parse_enum(row.get::<_, String>(10)?, 10)?,
    })
}

fn trade_from_row(row: &Row<'_>) -> Result<TradeRecord, rusqlite::Error> {
    Ok(TradeRecord {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        run_id: row.get(2)?,
        kind: parse_enum(row.get::<_, String>(3)?, 3)?,
        side: parse_enum(row.get::<_, String>(4)?, 4)?,
        symbol: row.get(5)?,
        price: row.get(6)?,
        qty: row.get(7)?,
        pnl: row.get(8)?,
        executed_at: row.get(9)?,
    })
}

fn position_from_row(row: &Row<'_>) -> Result<Position, rusqlite::Error> {
    Ok(Position {
        symbol: row.get(0)?,
        side: parse_enum(row.get::<_, String>(1)?, 1)?,
        entry_price: row.get(2)?,
        qty: row.get(3)?,
        notional: row.get(4)?,
        leverage: row.get(5)?,
        opened_at: row.get(6)?,
        mark_price: row.get(7)?,
        additions: row.get(8)?,
    })
}

fn backtest_from_row(row: &Row<'_>, with_payload: bool) -> Result<BacktestRecord, rusqlite::Error> {
    let parse_json = |raw: Option<String>| {
        raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
    };
    let stats: Option<String> = row.get(10)?;
    let equity: Option<String> = row.get(11)?;
    let trades: Option<String> = row.get(12)?;

    Ok(BacktestRecord {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: row.get(3)?,
        start_ms: row.get(4)?,
        end_ms: row.get(5)?,
        initial_balance: row.get(6)?,
        fee_pct: row.get(7)?,
        status: parse_enum(row.get::<_, String>(8)?, 8)?,
        error: row.get(9)?,
        stats: parse_json(stats),
        equity_curve: if with_payload { parse_json(equity) } else { None },
        trades: if with_payload { parse_json(trades) } else { None },
        created_at: row.get(13)?,
        finished_at: row.get(14)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fill;
    use serde_json::json;

    fn new_trade(kind: TradeKind, pnl: Option<f64>) -> NewTrade {
        NewTrade {
            strategy_id: 1,
            kind,
            side: Side::Long,
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            qty: 0.004,
            pnl,
            executed_at: now_ms(),
        }
    }

    async fn seeded() -> (Ledger, i64) {
        let ledger = Ledger::open_in_memory().unwrap();
        let id = ledger
            .create_strategy("mart", "test", StrategyKind::Config, &json!({"kernel": "martingale"}))
            .await
            .unwrap();
        (ledger, id)
    }

    #[tokio::test]
    async fn strategy_crud_roundtrip() {
        let (ledger, id) = seeded().await;
        let record = ledger.get_strategy(id).await.unwrap().unwrap();
        assert_eq!(record.name, "mart");
        assert_eq!(record.kind, StrategyKind::Config);
        assert_eq!(record.status, StrategyStatus::Stopped);

        ledger
            .update_strategy(id, "mart2", "updated", &json!({"kernel": "dca"}))
            .await
            .unwrap();
        let record = ledger.get_strategy(id).await.unwrap().unwrap();
        assert_eq!(record.name, "mart2");
        assert_eq!(record.config["kernel"], "dca");

        assert_eq!(ledger.list_strategies().await.unwrap().len(), 1);
        ledger.delete_strategy(id).await.unwrap();
        assert!(ledger.get_strategy(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_open_run_invariant() {
        let (ledger, id) = seeded().await;
        let run = ledger.open_run(id, 1000.0).await.unwrap();

        let err = ledger.open_run(id, 1000.0).await.unwrap_err();
        assert_eq!(err.kind(), "ledger_consistency");

        ledger
            .close_run(run, Some(1010.0), &RunCounters::default(), RunStatus::Completed)
            .await
            .unwrap();
        // A new run may open once the old one is closed.
        ledger.open_run(id, 1010.0).await.unwrap();
    }

    #[tokio::test]
    async fn delete_blocked_while_run_open() {
        let (ledger, id) = seeded().await;
        ledger.open_run(id, 1000.0).await.unwrap();
        assert!(ledger.delete_strategy(id).await.is_err());
    }

    #[tokio::test]
    async fn append_trade_updates_counters() {
        let (ledger, id) = seeded().await;
        let run = ledger.open_run(id, 1000.0).await.unwrap();

        ledger.append_trade(run, &new_trade(TradeKind::Open, None)).await.unwrap();
        ledger
            .append_trade(run, &new_trade(TradeKind::Close, Some(25.0)))
            .await
            .unwrap();
        ledger.append_trade(run, &new_trade(TradeKind::Open, None)).await.unwrap();
        ledger
            .append_trade(run, &new_trade(TradeKind::Close, Some(-10.0)))
            .await
            .unwrap();

        let record = ledger.get_run(run).await.unwrap().unwrap();
        assert_eq!(record.counters.total_trades, 4);
        assert_eq!(record.counters.win_trades, 1);
        assert_eq!(record.counters.loss_trades, 1);
        assert!((record.counters.realized_pnl - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn append_to_closed_run_fails() {
        let (ledger, id) = seeded().await;
        let run = ledger.open_run(id, 1000.0).await.unwrap();
        ledger
            .close_run(run, None, &RunCounters::default(), RunStatus::Completed)
            .await
            .unwrap();

        let err = ledger
            .append_trade(run, &new_trade(TradeKind::Open, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ledger_consistency");
        // Nothing was recorded.
        assert!(ledger.list_run_trades(run).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trade_listing_filters_and_pages() {
        let (ledger, id) = seeded().await;
        let run = ledger.open_run(id, 1000.0).await.unwrap();
        for _ in 0..5 {
            ledger.append_trade(run, &new_trade(TradeKind::Add, None)).await.unwrap();
        }

        let page = ledger.list_trades(Some(id), None, 0, 3).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 3);

        let page = ledger.list_trades(None, Some(run), 3, 3).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);

        let page = ledger.list_trades(None, None, 0, 100).await.unwrap();
        assert_eq!(page.total, 5);
    }

    #[tokio::test]
    async fn position_upsert_and_clear() {
        let (ledger, id) = seeded().await;
        let run = ledger.open_run(id, 1000.0).await.unwrap();

        let mut pos = Position::open(
            "BTCUSDT",
            Side::Long,
            &Fill {
                price: 50_000.0,
                qty: 0.004,
                timestamp: 1,
            },
            10,
        );
        ledger.upsert_position(run, Some(&pos)).await.unwrap();

        pos.set_mark(49_000.0);
        ledger.upsert_position(run, Some(&pos)).await.unwrap();
        let stored = ledger.get_position(run).await.unwrap().unwrap();
        assert_eq!(stored.mark_price, 49_000.0);
        assert_eq!(stored, pos);

        ledger.upsert_position(run, None).await.unwrap();
        assert!(ledger.get_position(run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshots_query_and_prune() {
        let ledger = Ledger::open_in_memory().unwrap();
        for (ts, total) in [(1_000, 900.0), (2_000, 950.0), (3_000, 1000.0)] {
            ledger
                .snapshot_account(&AccountSnapshot {
                    captured_at: ts,
                    total,
                    free: total,
                    used: 0.0,
                    unrealized_pnl: 0.0,
                })
                .await
                .unwrap();
        }

        assert_eq!(ledger.query_snapshots(1_500).await.unwrap().len(), 2);
        let removed = ledger.prune_snapshots(2_500).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ledger.query_snapshots(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backtest_lifecycle() {
        let (ledger, id) = seeded().await;
        let bt = ledger
            .create_backtest(id, "BTCUSDT", "1h", 0, 1_000_000, 1000.0, 0.04)
            .await
            .unwrap();

        ledger.mark_backtest_running(bt).await.unwrap();
        ledger
            .complete_backtest(
                bt,
                &json!({"total_return": 0.05}),
                &json!([[0, 1000.0], [1, 1050.0]]),
                &json!([]),
            )
            .await
            .unwrap();

        let record = ledger.get_backtest(bt).await.unwrap().unwrap();
        assert_eq!(record.status, BacktestStatus::Completed);
        assert!(record.equity_curve.is_some());

        // Listing omits the payloads.
        let listing = ledger.list_backtests().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].equity_curve.is_none());

        ledger.delete_backtest(bt).await.unwrap();
        assert!(ledger.get_backtest(bt).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_backtest_stores_message() {
        let (ledger, id) = seeded().await;
        let bt = ledger
            .create_backtest(id, "BTCUSDT", "1h", 0, 1, 1000.0, 0.0)
            .await
            .unwrap();
        ledger.fail_backtest(bt, "no bars in range").await.unwrap();
        let record = ledger.get_backtest(bt).await.unwrap().unwrap();
        assert_eq!(record.status, BacktestStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("no bars in range"));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path_str = path.to_str().unwrap();

        {
            let ledger = Ledger::open(path_str).unwrap();
            ledger
                .create_strategy("persist", "", StrategyKind::Config, &json!({}))
                .await
                .unwrap();
        }

        let ledger = Ledger::open(path_str).unwrap();
        assert_eq!(ledger.list_strategies().await.unwrap().len(), 1);
    }
}
