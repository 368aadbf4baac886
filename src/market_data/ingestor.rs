// =============================================================================
// Trade Event Ingestor — coalesces the raw trade firehose into ticks
// =============================================================================
//
// Raw trades arrive on the transport's delivery callback and are pushed into
// an unbounded MPSC queue; sending never blocks the transport. A scheduled
// pass try-locks the receiver and drains it, accumulating min/max/sum/volume
// with decimal arithmetic. The pass is bounded by a wall-clock budget so a
// burst can never starve sibling timers — leftover events simply wait for the
// next pass. If the previous pass is still running the tick is skipped
// outright instead of queued.
//
// One pass produces at most one `AggregatedTick` (average = sum/count, not
// volume-weighted), appended to every subscribed window.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::clock::ClockSynchronizer;
use crate::market_data::TickWindow;
use crate::types::{AggregatedTick, RawTradeEvent};

// ---------------------------------------------------------------------------
// Batch accumulator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Coalescer {
    count: u64,
    price_sum: Decimal,
    high: Decimal,
    low: Decimal,
    volume: Decimal,
}

impl Coalescer {
    fn absorb(&mut self, event: &RawTradeEvent) {
        if self.count == 0 {
            self.high = event.price;
            self.low = event.price;
        } else {
            self.high = self.high.max(event.price);
            self.low = self.low.min(event.price);
        }
        self.price_sum += event.price;
        self.volume += event.quantity;
        self.count += 1;
    }

    /// One tick from the accumulated batch; `None` when nothing was absorbed.
    fn finish(self, timestamp: DateTime<Utc>) -> Option<AggregatedTick> {
        if self.count == 0 {
            return None;
        }
        Some(AggregatedTick {
            average: self.price_sum / Decimal::from(self.count),
            high: self.high,
            low: self.low,
            volume: self.volume,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct TradeEventIngestor {
    symbol: String,
    tx: mpsc::UnboundedSender<RawTradeEvent>,
    /// Consumer side. `try_lock` on the scheduled pass implements the
    /// skip-if-busy drain guard.
    rx: Mutex<mpsc::UnboundedReceiver<RawTradeEvent>>,
    /// Windows that receive every coalesced tick.
    windows: Vec<Arc<TickWindow>>,
    /// Wall-clock budget for one drain pass.
    drain_budget: StdDuration,
}

impl TradeEventIngestor {
    pub fn new(
        symbol: impl Into<String>,
        windows: Vec<Arc<TickWindow>>,
        drain_budget: StdDuration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            symbol: symbol.into(),
            tx,
            rx: Mutex::new(rx),
            windows,
            drain_budget,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Producer handle for the transport's delivery callback. Sending never
    /// blocks.
    pub fn sender(&self) -> mpsc::UnboundedSender<RawTradeEvent> {
        self.tx.clone()
    }

    /// One coalescing pass. Returns the appended tick, or `None` when the
    /// pass was skipped (previous pass still draining) or the queue yielded
    /// no events.
    pub fn drain_and_coalesce(&self, now: DateTime<Utc>) -> Option<AggregatedTick> {
        let Some(mut rx) = self.rx.try_lock() else {
            trace!(symbol = %self.symbol, "drain pass skipped (previous pass still running)");
            return None;
        };

        let started = Instant::now();
        let mut batch = Coalescer::default();
        while started.elapsed() < self.drain_budget {
            match rx.try_recv() {
                Ok(event) => batch.absorb(&event),
                Err(_) => break,
            }
        }
        drop(rx);

        let tick = batch.finish(now)?;
        for window in &self.windows {
            window.append(tick);
        }
        trace!(symbol = %self.symbol, average = %tick.average, volume = %tick.volume, "batch coalesced");
        Some(tick)
    }

    /// Scheduled coalescing loop. An in-flight pass finishes before the loop
    /// exits on cancellation.
    pub async fn run(
        self: Arc<Self>,
        clock: Arc<ClockSynchronizer>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(symbol = %self.symbol, "trade ingestor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.drain_and_coalesce(clock.estimate_now());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Minute roll-up
// ---------------------------------------------------------------------------

/// Summarises a span of lower-timeframe ticks into one higher-timeframe tick
/// and fans it out to the coarser windows.
pub struct TickCompactor {
    source: Arc<TickWindow>,
    targets: Vec<Arc<TickWindow>>,
    span: Duration,
}

impl TickCompactor {
    pub fn new(source: Arc<TickWindow>, targets: Vec<Arc<TickWindow>>, span: Duration) -> Self {
        Self {
            source,
            targets,
            span,
        }
    }

    /// Summarise the last `span` of source ticks into one tick appended to
    /// every target window. An empty span produces nothing.
    pub fn compact(&self, now: DateTime<Utc>) -> Option<AggregatedTick> {
        let ticks = self.source.query(now - self.span);
        if ticks.is_empty() {
            return None;
        }

        let mut high = ticks[0].high;
        let mut low = ticks[0].low;
        let mut volume = Decimal::ZERO;
        let mut average_sum = Decimal::ZERO;
        for tick in &ticks {
            high = high.max(tick.high);
            low = low.min(tick.low);
            volume += tick.volume;
            average_sum += tick.average;
        }

        let tick = AggregatedTick {
            average: average_sum / Decimal::from(ticks.len() as u64),
            high,
            low,
            volume,
            timestamp: now,
        };
        for target in &self.targets {
            target.append(tick);
        }
        debug!(span_secs = self.span.num_seconds(), source_ticks = ticks.len(), "ticks compacted");
        Some(tick)
    }

    pub async fn run(
        self: Arc<Self>,
        clock: Arc<ClockSynchronizer>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tick compactor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.compact(clock.estimate_now());
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
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn trade(price: Decimal, quantity: Decimal) -> RawTradeEvent {
        RawTradeEvent {
            symbol: "BTCUSDT".into(),
            price,
            quantity,
            trade_id: 1,
            event_time: Utc::now(),
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn coalesces_a_batch_into_one_tick() {
        let window = Arc::new(TickWindow::new("seconds"));
        let ingestor = TradeEventIngestor::new(
            "BTCUSDT",
            vec![Arc::clone(&window)],
            StdDuration::from_millis(50),
        );

        let tx = ingestor.sender();
        tx.send(trade(dec!(100), dec!(1))).unwrap();
        tx.send(trade(dec!(104), dec!(2))).unwrap();
        tx.send(trade(dec!(96), dec!(0.5))).unwrap();

        let tick = ingestor.drain_and_coalesce(at(0)).unwrap();
        assert_eq!(tick.average, dec!(100));
        assert_eq!(tick.high, dec!(104));
        assert_eq!(tick.low, dec!(96));
        assert_eq!(tick.volume, dec!(3.5));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn empty_queue_produces_no_tick() {
        let window = Arc::new(TickWindow::new("seconds"));
        let ingestor = TradeEventIngestor::new(
            "BTCUSDT",
            vec![Arc::clone(&window)],
            StdDuration::from_millis(50),
        );

        assert!(ingestor.drain_and_coalesce(at(0)).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn exhausted_budget_leaves_events_for_the_next_pass() {
        let window = Arc::new(TickWindow::new("seconds"));
        // Zero budget: the pass gives up before dequeuing anything.
        let mut ingestor =
            TradeEventIngestor::new("BTCUSDT", vec![Arc::clone(&window)], StdDuration::ZERO);

        ingestor.sender().send(trade(dec!(100), dec!(1))).unwrap();
        assert!(ingestor.drain_and_coalesce(at(0)).is_none());

        // A later pass with a real budget picks the event up.
        ingestor.drain_budget = StdDuration::from_millis(50);
        let tick = ingestor.drain_and_coalesce(at(1)).unwrap();
        assert_eq!(tick.average, dec!(100));
    }

    #[test]
    fn busy_drain_guard_skips_the_pass() {
        let ingestor =
            TradeEventIngestor::new("BTCUSDT", Vec::new(), StdDuration::from_millis(50));
        ingestor.sender().send(trade(dec!(100), dec!(1))).unwrap();

        let _held = ingestor.rx.lock();
        assert!(ingestor.drain_and_coalesce(at(0)).is_none());
    }

    #[test]
    fn repeated_drains_append_in_timestamp_order() {
        let window = Arc::new(TickWindow::new("seconds"));
        let ingestor = TradeEventIngestor::new(
            "BTCUSDT",
            vec![Arc::clone(&window)],
            StdDuration::from_millis(50),
        );
        let tx = ingestor.sender();

        for step in 0..5 {
            tx.send(trade(dec!(100) + Decimal::from(step), dec!(1))).unwrap();
            ingestor.drain_and_coalesce(at(step)).unwrap();
        }

        let ticks = window.query(at(-1));
        assert_eq!(ticks.len(), 5);
        for pair in ticks.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn compactor_summarises_the_span_into_coarser_windows() {
        let seconds = Arc::new(TickWindow::new("seconds"));
        let minutes = Arc::new(TickWindow::new("minutes"));
        let hours = Arc::new(TickWindow::new("hours"));

        for (offset, avg) in [(0, dec!(100)), (20, dec!(102)), (40, dec!(98))] {
            seconds.append(AggregatedTick {
                average: avg,
                high: avg + dec!(1),
                low: avg - dec!(1),
                volume: dec!(2),
                timestamp: at(offset),
            });
        }

        let compactor = TickCompactor::new(
            Arc::clone(&seconds),
            vec![Arc::clone(&minutes), Arc::clone(&hours)],
            Duration::minutes(1),
        );
        let tick = compactor.compact(at(60)).unwrap();

        assert_eq!(tick.average, dec!(100));
        assert_eq!(tick.high, dec!(103));
        assert_eq!(tick.low, dec!(97));
        assert_eq!(tick.volume, dec!(6));
        assert_eq!(minutes.len(), 1);
        assert_eq!(hours.len(), 1);
    }

    #[test]
    fn compactor_on_an_empty_span_produces_nothing() {
        let seconds = Arc::new(TickWindow::new("seconds"));
        let minutes = Arc::new(TickWindow::new("minutes"));
        let compactor = TickCompactor::new(
            Arc::clone(&seconds),
            vec![Arc::clone(&minutes)],
            Duration::minutes(1),
        );

        assert!(compactor.compact(at(0)).is_none());
        assert!(minutes.is_empty());
    }
}
