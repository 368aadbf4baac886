// =============================================================================
// Order Execution Queue — serialized submissions to the exchange
// =============================================================================
//
// Multi-producer FIFO feeding a single drainer. The scheduled tick try-locks
// the processing guard and, if acquired, drains the queue completely:
// each request is submitted and its result fully reported before the next is
// dequeued, so submissions never overlap and never reorder, even under
// bursty enqueue from multiple callers. A held guard skips the tick instead
// of queueing it.
//
// A rejected submission is reported and the drain continues; it never halts
// the loop or discards queued requests.
// =============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::events::{CoreEvent, EventBus};
use crate::transport::ExchangeTransport;
use crate::types::{OrderFill, OrderRequest};

/// Outcome of one submission attempt.
#[derive(Debug, Clone, Serialize)]
pub enum OrderOutcome {
    /// The exchange accepted the order; fill data attached.
    Filled(OrderFill),
    /// The exchange (or transport) rejected the order.
    Rejected { reason: String },
}

/// Result notification for one processed request.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub request: OrderRequest,
    pub outcome: OrderOutcome,
}

pub struct OrderExecutionQueue {
    tx: mpsc::UnboundedSender<OrderRequest>,
    /// Consumer side; the tokio mutex is the processing guard, held across
    /// the transport await while a drain is running.
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OrderRequest>>,
    bus: EventBus,
    /// Execution-tracking sink for requests with a non-zero correlation id.
    tracking: parking_lot::Mutex<Option<mpsc::UnboundedSender<(u64, OrderResult)>>>,
}

impl OrderExecutionQueue {
    pub fn new(bus: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            bus,
            tracking: parking_lot::Mutex::new(None),
        }
    }

    /// Queue one request for submission. Non-blocking; callers on any thread.
    pub fn enqueue(&self, request: OrderRequest) -> Result<()> {
        info!(
            symbol = %request.symbol,
            side = %request.side,
            kind = %request.kind,
            quantity = %request.quantity,
            client_id = %request.client_id,
            "order enqueued"
        );
        self.tx
            .send(request)
            .map_err(|_| anyhow!("order execution queue is closed"))
    }

    /// Install the sink that receives results for correlation-tracked
    /// requests (`correlation_id != 0`).
    pub fn set_tracking_sink(&self, sink: mpsc::UnboundedSender<(u64, OrderResult)>) {
        *self.tracking.lock() = Some(sink);
    }

    /// Drain the queue completely in FIFO order, one submission at a time.
    ///
    /// Returns the number of processed requests; zero when the guard was
    /// already held (previous drain still running) or the queue was empty.
    pub async fn process_pending(&self, transport: &dyn ExchangeTransport) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            trace!("order tick skipped (previous drain still running)");
            return 0;
        };

        let mut processed = 0;
        while let Ok(request) = rx.try_recv() {
            let outcome = match transport.place_order(&request).await {
                Ok(fill) => {
                    info!(
                        symbol = %request.symbol,
                        client_id = %request.client_id,
                        exchange_order_id = fill.exchange_order_id,
                        filled = %fill.filled_quantity,
                        "order filled"
                    );
                    OrderOutcome::Filled(fill)
                }
                Err(err) => {
                    warn!(
                        symbol = %request.symbol,
                        client_id = %request.client_id,
                        error = %err,
                        "order rejected"
                    );
                    OrderOutcome::Rejected {
                        reason: err.to_string(),
                    }
                }
            };

            let result = OrderResult { request, outcome };
            if result.request.correlation_id != 0 {
                if let Some(sink) = self.tracking.lock().as_ref() {
                    let _ = sink.send((result.request.correlation_id, result.clone()));
                }
            }
            self.bus.publish(CoreEvent::OrderCompleted {
                result: Box::new(result),
            });
            processed += 1;
        }
        processed
    }

    /// Cooperative processing loop. An in-flight drain finishes before the
    /// loop exits on cancellation.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn ExchangeTransport>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("order execution loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.process_pending(transport.as_ref()).await;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn requests_submit_in_fifo_order_without_overlap() {
        let transport = MockTransport::new();
        let queue = OrderExecutionQueue::new(EventBus::default());
        let mut events = queue.bus.subscribe();

        let r1 = OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1));
        let r2 = OrderRequest::market("ETHUSDT", OrderSide::Sell, dec!(2));
        let r3 = OrderRequest::market("SOLUSDT", OrderSide::Buy, dec!(3));
        let expected = vec![r1.client_id, r2.client_id, r3.client_id];

        queue.enqueue(r1).unwrap();
        queue.enqueue(r2).unwrap();
        queue.enqueue(r3).unwrap();

        assert_eq!(queue.process_pending(transport.as_ref()).await, 3);
        assert_eq!(*transport.placed.lock(), expected);
        assert!(!transport.overlap_detected.load(Ordering::SeqCst));

        // Result notifications arrive in the same order.
        for id in expected {
            match events.try_recv().unwrap() {
                CoreEvent::OrderCompleted { result } => {
                    assert_eq!(result.request.client_id, id);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn a_rejection_does_not_halt_the_drain() {
        let transport = MockTransport::new();
        transport.fail_next_orders.store(1, Ordering::SeqCst);

        let queue = OrderExecutionQueue::new(EventBus::default());
        let mut events = queue.bus.subscribe();

        queue
            .enqueue(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1)))
            .unwrap();
        queue
            .enqueue(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(2)))
            .unwrap();

        assert_eq!(queue.process_pending(transport.as_ref()).await, 2);

        let first = events.try_recv().unwrap();
        let second = events.try_recv().unwrap();
        match (first, second) {
            (
                CoreEvent::OrderCompleted { result: a },
                CoreEvent::OrderCompleted { result: b },
            ) => {
                assert!(matches!(a.outcome, OrderOutcome::Rejected { .. }));
                assert!(matches!(b.outcome, OrderOutcome::Filled(_)));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn correlation_tracked_results_reach_the_sink() {
        let transport = MockTransport::new();
        let queue = OrderExecutionQueue::new(EventBus::default());

        let (sink, mut tracked) = mpsc::unbounded_channel();
        queue.set_tracking_sink(sink);

        let mut tracked_req = OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1));
        tracked_req.correlation_id = 7;
        let fire_and_forget = OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(2));

        queue.enqueue(tracked_req).unwrap();
        queue.enqueue(fire_and_forget).unwrap();
        queue.process_pending(transport.as_ref()).await;

        let (correlation, result) = tracked.try_recv().unwrap();
        assert_eq!(correlation, 7);
        assert_eq!(result.request.correlation_id, 7);
        // The zero-correlation request is fire-and-forget.
        assert!(tracked.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_held_guard_skips_the_tick() {
        let transport = MockTransport::new();
        let queue = OrderExecutionQueue::new(EventBus::default());
        queue
            .enqueue(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1)))
            .unwrap();

        let _held = queue.rx.lock().await;
        assert_eq!(queue.process_pending(transport.as_ref()).await, 0);
    }
}
