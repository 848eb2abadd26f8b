// =============================================================================
// Event bus — in-process fan-out of engine events
// =============================================================================
//
// Topic-filtered publish/subscribe. Each subscriber owns a bounded channel;
// publishing never blocks: when a subscriber's buffer is full the event is
// dropped for that subscriber and its drop counter bumps. Events reach each
// subscriber in publication order per topic.
//
// Subscription lifetime is explicit: `subscribe` returns a handle whose
// receiver ends when `unsubscribe` (or drop of the bus-side sender) occurs.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::position::Position;
use crate::types::{AccountBalance, RunCounters, TradeRecord};

// ---------------------------------------------------------------------------
// Topics and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StrategyStatus,
    Trade,
    Position,
    Account,
    BacktestProgress,
    Error,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::StrategyStatus,
        Topic::Trade,
        Topic::Position,
        Topic::Account,
        Topic::BacktestProgress,
        Topic::Error,
    ];
}

/// Everything the engine announces to the outside.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StrategyStatus {
        strategy_id: i64,
        status: String,
        counters: RunCounters,
    },
    Trade {
        trade: TradeRecord,
    },
    Position {
        strategy_id: i64,
        position: Option<Position>,
    },
    Account {
        balance: AccountBalance,
        unrealized_pnl: f64,
    },
    BacktestProgress {
        backtest_id: i64,
        current: usize,
        total: usize,
        percentage: f64,
        current_balance: f64,
    },
    Error {
        strategy_id: Option<i64>,
        kind: String,
        message: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::StrategyStatus { .. } => Topic::StrategyStatus,
            Self::Trade { .. } => Topic::Trade,
            Self::Position { .. } => Topic::Position,
            Self::Account { .. } => Topic::Account,
            Self::BacktestProgress { .. } => Topic::BacktestProgress,
            Self::Error { .. } => Topic::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    topics: Vec<Topic>,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Handle returned by `subscribe`. Receiving continues until the matching
/// `unsubscribe` call closes the bus side.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Events dropped for this subscriber because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct EventBus {
    subscribers: RwLock<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for `topics` with a buffer of `capacity` events.
    pub fn subscribe(&self, topics: &[Topic], capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        self.subscribers.write().insert(
            id,
            SubscriberSlot {
                topics: topics.to_vec(),
                tx,
                dropped: dropped.clone(),
            },
        );
        debug!(subscriber = id, ?topics, capacity, "subscriber registered");

        Subscription { id, rx, dropped }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Deliver to every interested subscriber without blocking. Full buffers
    /// drop the event for that subscriber; disconnected receivers are pruned.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut stale = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (&id, slot) in subscribers.iter() {
                if !slot.topics.contains(&topic) {
                    continue;
                }
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(id),
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in stale {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(strategy_id: i64) -> Event {
        Event::StrategyStatus {
            strategy_id,
            status: "running".into(),
            counters: RunCounters::default(),
        }
    }

    fn error_event() -> Event {
        Event::Error {
            strategy_id: None,
            kind: "config".into(),
            message: "boom".into(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[Topic::StrategyStatus], 16);

        for i in 0..5 {
            bus.publish(status_event(i));
        }
        for i in 0..5 {
            match sub.rx.recv().await.unwrap() {
                Event::StrategyStatus { strategy_id, .. } => assert_eq!(strategy_id, i),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topics_filter_delivery() {
        let bus = EventBus::new();
        let mut errors_only = bus.subscribe(&[Topic::Error], 16);

        bus.publish(status_event(1));
        bus.publish(error_event());

        match errors_only.rx.recv().await.unwrap() {
            Event::Error { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(errors_only.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[Topic::StrategyStatus], 2);

        // Publisher never blocks even though the buffer holds only 2.
        for i in 0..10 {
            bus.publish(status_event(i));
        }
        assert_eq!(sub.dropped_count(), 8);

        // A fast subscriber registered alongside is unaffected.
        let fast = bus.subscribe(&[Topic::StrategyStatus], 32);
        bus.publish(status_event(99));
        assert_eq!(fast.dropped_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_stream() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[Topic::StrategyStatus], 4);
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[Topic::StrategyStatus], 4);
        drop(sub);

        bus.publish(status_event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
