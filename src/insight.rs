// =============================================================================
// Insight Engine — comparative signals across timeframes
// =============================================================================
//
// Every engine tick the current period snapshots are compared: the shortest
// timeframe's high/low against the 5m, 15m, and 1h highs/lows, a volume
// regime classification from the minute/hour volume ratio, and warm-up
// latches that gate consumers until enough run time has accumulated.
//
// The combined new-high/new-low flags use a quorum rule: they fire only when
// exactly three of the three per-timeframe comparisons agree. The rule is
// count == 3, not a boolean AND — preserved from the desk's original
// definition, do not simplify.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::aggregator::PeriodTracker;
use crate::events::{CoreEvent, EventBus};
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Volume regime
// ---------------------------------------------------------------------------

/// Volume regime derived from the minute/hour volume ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeLevel {
    /// Not classified yet (warm-up, or no hour volume observed).
    Invalid,
    Weak,
    Slow,
    Average,
    Strong,
    High,
    Extreme,
}

impl Default for VolumeLevel {
    fn default() -> Self {
        Self::Invalid
    }
}

impl std::fmt::Display for VolumeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "Invalid"),
            Self::Weak => write!(f, "Weak"),
            Self::Slow => write!(f, "Slow"),
            Self::Average => write!(f, "Average"),
            Self::Strong => write!(f, "Strong"),
            Self::High => write!(f, "High"),
            Self::Extreme => write!(f, "Extreme"),
        }
    }
}

/// Strict descending threshold ladder over the raw minute/hour volume ratio;
/// the first match wins.
pub fn classify_volume_ratio(ratio: Decimal) -> VolumeLevel {
    if ratio > Decimal::from(5) {
        VolumeLevel::Extreme
    } else if ratio > Decimal::new(35, 1) {
        VolumeLevel::High
    } else if ratio > Decimal::ONE {
        VolumeLevel::Strong
    } else if ratio > Decimal::new(75, 2) {
        VolumeLevel::Average
    } else if ratio > Decimal::new(5, 1) {
        VolumeLevel::Slow
    } else {
        VolumeLevel::Weak
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Derived comparison flags, mutated in place each evaluation cycle and read
/// by the presentation layer. Not persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightState {
    pub new_high_five: bool,
    pub new_low_five: bool,
    pub new_high_fifteen: bool,
    pub new_low_fifteen: bool,
    pub new_high_hour: bool,
    pub new_low_hour: bool,

    /// Quorum flags: set only when exactly three of the three per-timeframe
    /// comparisons agree.
    pub new_high: bool,
    pub new_low: bool,

    pub volume_level: VolumeLevel,

    /// One-way warm-up latches; only `clear()` resets them.
    pub ready: bool,
    pub ready_fifteen: bool,

    /// Continuous run time of the current tracking session, in seconds.
    pub running_secs: u64,
}

fn exactly_three(flags: [bool; 3]) -> bool {
    flags.iter().filter(|&&flag| flag).count() == 3
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct InsightEngine {
    state: RwLock<InsightState>,
    /// Stopwatch for the warm-up latches; reset only by `clear()`.
    running_since: Mutex<Instant>,
    ready_after: StdDuration,
    ready_fifteen_after: StdDuration,
}

impl InsightEngine {
    pub fn new(ready_after: StdDuration, ready_fifteen_after: StdDuration) -> Self {
        Self {
            state: RwLock::new(InsightState::default()),
            running_since: Mutex::new(Instant::now()),
            ready_after,
            ready_fifteen_after,
        }
    }

    /// Current derived state, as a copy.
    pub fn snapshot(&self) -> InsightState {
        self.state.read().clone()
    }

    /// One evaluation cycle against the tracker's current snapshots.
    ///
    /// Returns false when the shortest timeframe has no snapshot yet (nothing
    /// is derived; the previous state stays visible). A missing coarser
    /// snapshot makes its comparison false for this cycle, and a zero hour
    /// volume keeps the previous volume level.
    pub fn update(&self, tracker: &PeriodTracker) -> bool {
        let Some(minute) = tracker.snapshot(Timeframe::Minute) else {
            return false;
        };
        let five = tracker.snapshot(Timeframe::FiveMinutes);
        let fifteen = tracker.snapshot(Timeframe::FifteenMinutes);
        let hour = tracker.snapshot(Timeframe::Hour);

        let elapsed = self.running_since.lock().elapsed();

        let mut state = self.state.write();

        state.new_high_five = five.map_or(false, |s| minute.high >= s.high);
        state.new_low_five = five.map_or(false, |s| minute.low <= s.low);
        state.new_high_fifteen = fifteen.map_or(false, |s| minute.high >= s.high);
        state.new_low_fifteen = fifteen.map_or(false, |s| minute.low <= s.low);
        state.new_high_hour = hour.map_or(false, |s| minute.high >= s.high);
        state.new_low_hour = hour.map_or(false, |s| minute.low <= s.low);

        state.new_high = exactly_three([
            state.new_high_five,
            state.new_high_fifteen,
            state.new_high_hour,
        ]);
        state.new_low = exactly_three([
            state.new_low_five,
            state.new_low_fifteen,
            state.new_low_hour,
        ]);

        if let Some(hour) = hour {
            if hour.volume > Decimal::ZERO {
                state.volume_level = classify_volume_ratio(minute.volume / hour.volume);
            }
        }

        state.running_secs = elapsed.as_secs();
        if elapsed >= self.ready_fifteen_after {
            state.ready_fifteen = true;
        }
        if elapsed >= self.ready_after {
            state.ready = true;
        }

        trace!(
            symbol = %tracker.symbol(),
            new_high = state.new_high,
            new_low = state.new_low,
            volume_level = %state.volume_level,
            "insight evaluated"
        );
        true
    }

    /// Reset every derived flag and the run-time stopwatch; called when the
    /// tracked symbol changes.
    pub fn clear(&self) {
        *self.state.write() = InsightState::default();
        *self.running_since.lock() = Instant::now();
        info!("insight state cleared");
    }

    /// Periodic evaluation loop.
    pub async fn run(
        self: Arc<Self>,
        tracker: Arc<PeriodTracker>,
        interval: StdDuration,
        bus: EventBus,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(symbol = %tracker.symbol(), "insight loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if self.update(&tracker) {
                        bus.publish(CoreEvent::InsightUpdated {
                            symbol: tracker.symbol().to_string(),
                        });
                    }
                }
            }
        }
    }
}
