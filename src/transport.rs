// =============================================================================
// Exchange transport boundary
// =============================================================================
//
// The wire-level REST/stream client lives outside this crate. The core only
// sees this trait: a clock probe, an authoritative-time fetch, order
// placement, and live trade-feed lifecycle. Implementations own reconnects,
// serialization, and request signing.
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::{ConnectionState, OrderFill, OrderRequest, RawTradeEvent};

/// Delivery endpoints handed to the transport when a trade feed is opened.
///
/// The transport pushes every raw trade into `trades` and every connection
/// state change into `status`. Both are unbounded so the transport's delivery
/// callback never blocks.
#[derive(Debug, Clone)]
pub struct FeedSink {
    pub trades: mpsc::UnboundedSender<RawTradeEvent>,
    pub status: mpsc::UnboundedSender<ConnectionState>,
}

/// Handle to one open trade feed. Dropping the handle does not close the
/// feed; teardown is explicit via `close`.
pub trait FeedHandle: Send + Sync {
    /// Synchronously tear down the underlying stream subscription.
    fn close(&self);
}

/// The operations this core consumes from the exchange.
#[async_trait]
pub trait ExchangeTransport: Send + Sync + 'static {
    /// Measure one request/response round trip.
    async fn ping(&self) -> Result<Duration>;

    /// Fetch the exchange's authoritative current time.
    async fn server_time(&self) -> Result<DateTime<Utc>>;

    /// Submit one order and wait for the placement result.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill>;

    /// Open a live trade feed for `symbol`, delivering into `sink`.
    fn open_trade_feed(&self, symbol: &str, sink: FeedSink) -> Result<Box<dyn FeedHandle>>;
}

// =============================================================================
// Test transport
// =============================================================================
