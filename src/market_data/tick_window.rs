// =============================================================================
// TickWindow — thread-safe append-only store of aggregated ticks
// =============================================================================
//
// One window per retained lookback class (seconds, minutes, hours), each with
// its own guard so unrelated timeframes never contend. The single producer
// appends in non-decreasing timestamp order; aggregation queries take a
// snapshot copy so a concurrent prune can never invalidate an in-progress
// read.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::types::AggregatedTick;

pub struct TickWindow {
    /// Window label used in logs ("seconds", "minutes", "hours").
    name: &'static str,
    /// Insertion order equals time order; timestamps are non-decreasing by
    /// producer discipline, the window does not enforce it.
    ticks: Mutex<Vec<AggregatedTick>>,
}

impl TickWindow {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ticks: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, tick: AggregatedTick) {
        self.ticks.lock().push(tick);
    }

    /// All ticks with `timestamp >= cutoff`, as an isolated snapshot copy.
    pub fn query(&self, cutoff: DateTime<Utc>) -> Vec<AggregatedTick> {
        self.ticks
            .lock()
            .iter()
            .filter(|t| t.timestamp >= cutoff)
            .copied()
            .collect()
    }

    /// Drop every tick older than `now - retention`. Returns how many were
    /// removed.
    pub fn prune(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let mut ticks = self.ticks.lock();
        let before = ticks.len();
        ticks.retain(|t| t.timestamp >= cutoff);
        let removed = before - ticks.len();
        if removed > 0 {
            debug!(window = self.name, removed, remaining = ticks.len(), "window pruned");
        }
        removed
    }

    pub fn clear(&self) {
        self.ticks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.ticks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.lock().is_empty()
    }

    /// Most recent tick, if any.
    pub fn last(&self) -> Option<AggregatedTick> {
        self.ticks.lock().last().copied()
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

    fn tick_at(seconds: i64) -> AggregatedTick {
        AggregatedTick {
            average: dec!(100),
            high: dec!(101),
            low: dec!(99),
            volume: dec!(1),
            timestamp: Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
        }
    }

    #[test]
    fn query_is_inclusive_of_the_cutoff() {
        let window = TickWindow::new("seconds");
        window.append(tick_at(0));
        window.append(tick_at(10));
        window.append(tick_at(20));

        let ticks = window.query(Utc.timestamp_opt(1_700_000_010, 0).unwrap());
        assert_eq!(ticks.len(), 2);
        assert_eq!(
            ticks[0].timestamp,
            Utc.timestamp_opt(1_700_000_010, 0).unwrap()
        );
    }

    #[test]
    fn prune_removes_only_expired_ticks() {
        let window = TickWindow::new("seconds");
        window.append(tick_at(0));
        window.append(tick_at(30));
        window.append(tick_at(60));

        let now = Utc.timestamp_opt(1_700_000_066, 0).unwrap();
        let removed = window.prune(Duration::seconds(40), now);

        assert_eq!(removed, 1);
        assert_eq!(window.len(), 2);
        assert_eq!(window.query(now - Duration::seconds(120)).len(), 2);
    }

    #[test]
    fn query_snapshot_survives_a_concurrent_prune() {
        let window = TickWindow::new("seconds");
        window.append(tick_at(0));
        window.append(tick_at(10));

        let snapshot = window.query(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        window.prune(
            Duration::seconds(1),
            Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        );

        // The snapshot is isolated from the prune.
        assert_eq!(snapshot.len(), 2);
        assert_eq!(window.len(), 0);
    }

    #[test]
    fn clear_empties_the_window() {
        let window = TickWindow::new("seconds");
        window.append(tick_at(0));
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.last(), None);
    }
}
