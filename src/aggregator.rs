// =============================================================================
// Period Aggregator — rolling statistics per timeframe
// =============================================================================
//
// Each timeframe (1m / 5m / 15m / 1h) is re-evaluated on its own schedule,
// finer timeframes more frequently than coarser ones, by querying the
// appropriate tick window for everything inside the lookback. An empty range
// is "no update": the tracker keeps the last valid snapshot instead of
// publishing zeros.
//
// All arithmetic is fixed-point decimal; repeated accumulation must not
// accumulate binary rounding drift.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::clock::ClockSynchronizer;
use crate::events::{CoreEvent, EventBus};
use crate::market_data::TickWindow;
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Rolling statistics over one lookback. Ephemeral: recomputed each schedule
/// tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSnapshot {
    /// Arithmetic mean of the per-tick averages.
    pub average: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    /// Display spread: `((high - average) + (average - low)) / 2`.
    /// Deliberately not `high - low`; preserved from the trading desk's
    /// original definition.
    pub spread: Decimal,
    pub evaluated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Summarise all ticks within `reference - lookback ..= reference`.
///
/// Returns `None` on an empty range — callers must not update derived state
/// on an empty result. The low accumulator starts at a zero sentinel and
/// only adopts a tick's low once it leaves zero, so zero-priced sentinel
/// ticks never clamp the minimum.
pub fn evaluate(
    window: &TickWindow,
    lookback: Duration,
    reference: DateTime<Utc>,
) -> Option<PeriodSnapshot> {
    let ticks = window.query(reference - lookback);
    if ticks.is_empty() {
        return None;
    }

    let mut low = Decimal::ZERO;
    let mut high = Decimal::ZERO;
    let mut volume = Decimal::ZERO;
    let mut average_sum = Decimal::ZERO;

    for tick in &ticks {
        if low.is_zero() {
            low = tick.low;
        }
        low = low.min(tick.low);
        high = high.max(tick.high);
        volume += tick.volume;
        average_sum += tick.average;
    }

    let average = average_sum / Decimal::from(ticks.len() as u64);
    let spread = ((high - average) + (average - low)) / Decimal::TWO;

    Some(PeriodSnapshot {
        average,
        high,
        low,
        volume,
        spread,
        evaluated_at: reference,
    })
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Last-known-good snapshot per timeframe for one symbol. Read by the
/// insight engine and the presentation layer.
pub struct PeriodTracker {
    symbol: String,
    snapshots: RwLock<HashMap<Timeframe, PeriodSnapshot>>,
}

impl PeriodTracker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Re-evaluate one timeframe against its window. Returns the fresh
    /// snapshot, or `None` when the range was empty (previous snapshot is
    /// preserved).
    pub fn refresh(
        &self,
        timeframe: Timeframe,
        window: &TickWindow,
        reference: DateTime<Utc>,
    ) -> Option<PeriodSnapshot> {
        let snapshot = evaluate(window, timeframe.lookback(), reference)?;
        self.snapshots.write().insert(timeframe, snapshot);
        trace!(
            symbol = %self.symbol,
            timeframe = %timeframe,
            average = %snapshot.average,
            volume = %snapshot.volume,
            "period refreshed"
        );
        Some(snapshot)
    }

    pub fn snapshot(&self, timeframe: Timeframe) -> Option<PeriodSnapshot> {
        self.snapshots.read().get(&timeframe).copied()
    }

    /// Copy of every tracked snapshot, for the presentation layer.
    pub fn all(&self) -> HashMap<Timeframe, PeriodSnapshot> {
        self.snapshots.read().clone()
    }

    /// Forget every snapshot; called when the tracked symbol changes.
    pub fn clear(&self) {
        self.snapshots.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Scheduled evaluation loop
// ---------------------------------------------------------------------------

/// Periodic evaluation of one timeframe. Each timeframe gets its own loop so
/// coarse aggregates are not recomputed at the fine cadence.
pub async fn run_timeframe(
    tracker: Arc<PeriodTracker>,
    window: Arc<TickWindow>,
    timeframe: Timeframe,
    interval: StdDuration,
    clock: Arc<ClockSynchronizer>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(symbol = %tracker.symbol(), timeframe = %timeframe, "aggregation loop stopped");
                break;
            }
            _ = ticker.tick() => {
                if tracker.refresh(timeframe, &window, clock.estimate_now()).is_some() {
                    bus.publish(CoreEvent::TickerUpdated {
                        symbol: tracker.symbol().to_string(),
                        timeframe,
                    });
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
    use crate::types::AggregatedTick;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn tick(avg: Decimal, high: Decimal, low: Decimal, volume: Decimal, seconds: i64) -> AggregatedTick {
        AggregatedTick {
            average: avg,
            high,
            low,
            volume,
            timestamp: at(seconds),
        }
    }

    #[test]
    fn empty_range_returns_no_update() {
        let window = TickWindow::new("seconds");
        assert!(evaluate(&window, Duration::minutes(1), at(0)).is_none());
    }

    #[test]
    fn ticks_outside_the_lookback_are_ignored() {
        let window = TickWindow::new("seconds");
        window.append(tick(dec!(50), dec!(55), dec!(45), dec!(1), -120));
        window.append(tick(dec!(100), dec!(101), dec!(99), dec!(1), -10));

        let snapshot = evaluate(&window, Duration::minutes(1), at(0)).unwrap();
        assert_eq!(snapshot.average, dec!(100));
        assert_eq!(snapshot.high, dec!(101));
        assert_eq!(snapshot.low, dec!(99));
    }

    #[test]
    fn statistics_cover_the_whole_range() {
        let window = TickWindow::new("seconds");
        window.append(tick(dec!(100), dec!(110), dec!(95), dec!(3), -40));
        window.append(tick(dec!(102), dec!(108), dec!(90), dec!(2), -20));

        let snapshot = evaluate(&window, Duration::minutes(1), at(0)).unwrap();
        assert_eq!(snapshot.average, dec!(101));
        assert_eq!(snapshot.high, dec!(110));
        assert_eq!(snapshot.low, dec!(90));
        assert_eq!(snapshot.volume, dec!(5));
        assert_eq!(snapshot.evaluated_at, at(0));
    }

    #[test]
    fn spread_uses_the_two_sided_average_formula() {
        let window = TickWindow::new("seconds");
        window.append(tick(dec!(101), dec!(110), dec!(90), dec!(1), -5));

        let snapshot = evaluate(&window, Duration::minutes(1), at(0)).unwrap();
        // ((110 - 101) + (101 - 90)) / 2 = (9 + 11) / 2
        assert_eq!(snapshot.spread, dec!(10));
        assert_ne!(snapshot.spread, snapshot.high - snapshot.low);
    }

    #[test]
    fn zero_sentinel_lows_do_not_clamp_the_minimum() {
        let window = TickWindow::new("seconds");
        window.append(tick(dec!(5), dec!(5), dec!(0), dec!(1), -30));
        window.append(tick(dec!(5), dec!(6), dec!(5), dec!(1), -10));

        let snapshot = evaluate(&window, Duration::minutes(1), at(0)).unwrap();
        assert_eq!(snapshot.low, dec!(5));
    }

    #[test]
    fn tracker_preserves_last_known_good_on_empty_refresh() {
        let window = TickWindow::new("seconds");
        let tracker = PeriodTracker::new("BTCUSDT");

        window.append(tick(dec!(100), dec!(101), dec!(99), dec!(1), -5));
        tracker.refresh(Timeframe::Minute, &window, at(0)).unwrap();

        // Far in the future the lookback range is empty: no update, previous
        // snapshot stays visible.
        assert!(tracker.refresh(Timeframe::Minute, &window, at(600)).is_none());
        let kept = tracker.snapshot(Timeframe::Minute).unwrap();
        assert_eq!(kept.average, dec!(100));
        assert_eq!(kept.evaluated_at, at(0));
    }

    #[test]
    fn tracker_clear_forgets_all_snapshots() {
        let window = TickWindow::new("seconds");
        let tracker = PeriodTracker::new("BTCUSDT");
        window.append(tick(dec!(100), dec!(101), dec!(99), dec!(1), -5));
        tracker.refresh(Timeframe::Minute, &window, at(0));

        tracker.clear();
        assert!(tracker.snapshot(Timeframe::Minute).is_none());
        assert!(tracker.all().is_empty());
    }
}
