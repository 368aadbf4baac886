// =============================================================================
// Core event fan-out — broadcast channel feeding the presentation layer
// =============================================================================
//
// Every observable state change (ticker update, insight update, order result,
// feed status) is published as a `CoreEvent`. Consumers subscribe for their
// own `broadcast::Receiver`; a publish with no live subscribers is not an
// error, the event is simply dropped.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::execution::OrderResult;
use crate::types::{ConnectionState, Timeframe};

/// Default capacity of the broadcast ring. Slow consumers that fall further
/// behind than this observe a `Lagged` error and resubscribe.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Every event the core raises towards the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreEvent {
    /// A period snapshot for `symbol` at `timeframe` was refreshed.
    TickerUpdated { symbol: String, timeframe: Timeframe },

    /// The insight state for `symbol` was re-evaluated.
    InsightUpdated { symbol: String },

    /// An order submission completed (successfully or not).
    OrderCompleted { result: Box<OrderResult> },

    /// A live feed's connection state changed.
    FeedStatusChanged {
        symbol: String,
        state: ConnectionState,
    },
}

/// Cheap-to-clone handle around one broadcast sender.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Obtain a fresh receiver. Receivers only observe events published after
    /// this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never fails; with no subscribers the event is
    /// dropped silently.
    pub fn publish(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            debug!("core event dropped (no subscribers)");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
