// =============================================================================
// Account monitor — periodic balance snapshots with retention
// =============================================================================
//
// Every `poll_interval` the monitor captures {total, free, used, aggregate
// unrealized pnl} to the ledger, prunes snapshots past the retention window,
// and publishes an `account` event. Fetch failures are logged and retried on
// the next cycle; the loop never dies.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::exchange::ExchangeAdapter;
use crate::ledger::Ledger;
use crate::supervisor::Supervisor;
use crate::types::AccountSnapshot;

pub async fn run_account_monitor(
    ledger: Ledger,
    exchange: Arc<dyn ExchangeAdapter>,
    bus: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
    poll_interval: Duration,
    retention: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let balance = match exchange.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "account snapshot skipped: balance fetch failed");
                continue;
            }
        };

        // Aggregate unrealized pnl across every live strategy position.
        let unrealized_pnl = match supervisor.statuses().await {
            Ok(statuses) => statuses
                .iter()
                .filter_map(|s| s.position.as_ref())
                .map(|p| p.unrealized_pnl)
                .sum(),
            Err(e) => {
                warn!(error = %e, "account snapshot: status read failed");
                0.0
            }
        };

        let now = Utc::now().timestamp_millis();
        let snapshot = AccountSnapshot {
            captured_at: now,
            total: balance.total,
            free: balance.free,
            used: balance.used,
            unrealized_pnl,
        };

        if let Err(e) = ledger.snapshot_account(&snapshot).await {
            warn!(error = %e, "account snapshot persist failed");
            continue;
        }

        match ledger
            .prune_snapshots(now - retention.as_millis() as i64)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "old account snapshots pruned"),
            Err(e) => warn!(error = %e, "snapshot prune failed"),
        }

        bus.publish(Event::Account {
            balance,
            unrealized_pnl,
        });
    }
}
