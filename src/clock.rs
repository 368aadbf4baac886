// =============================================================================
// Clock Synchronizer — remote-time estimation with periodic recalibration
// =============================================================================
//
// The exchange's clock is authoritative for every timestamp this core
// produces, but fetching it is a network round trip. The synchronizer fetches
// it once, compensates for half the measured round trip, and anchors it to a
// monotonic local stopwatch; `estimate_now()` is then anchor + local elapsed
// + an accumulated correction offset.
//
// On a fixed interval the offset is re-measured: the correction absorbs clock
// drift without resetting the local baseline. A failed probe only bumps a
// counter — the previous latency and anchors stay intact, so the estimate
// keeps moving forward on local time alone.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::ExchangeTransport;

/// Remote/local correspondence captured at calibration time.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    /// Remote server time at the moment `local` was captured.
    remote: DateTime<Utc>,
    /// Monotonic local baseline.
    local: Instant,
}

/// Mutable synchroniser state. All fields live behind one guard so a reader
/// can never observe a half-applied recalibration.
#[derive(Debug)]
pub struct ClockEstimate {
    anchor: Option<Anchor>,
    /// Half of the last successful round trip.
    latency: StdDuration,
    /// Accumulated drift correction applied on top of the anchor.
    correction: Duration,
    /// Number of recalibrations that adjusted the correction.
    corrections: u64,
    /// Number of scheduled probes that failed.
    missed_probes: u64,
}

impl Default for ClockEstimate {
    fn default() -> Self {
        Self {
            anchor: None,
            latency: StdDuration::ZERO,
            correction: Duration::zero(),
            corrections: 0,
            missed_probes: 0,
        }
    }
}

pub struct ClockSynchronizer {
    state: Mutex<ClockEstimate>,
    /// Latched true after the first full calibration cycle.
    ready: AtomicBool,
    recalibration_interval: StdDuration,
}

impl ClockSynchronizer {
    pub fn new(recalibration_interval: StdDuration) -> Self {
        Self {
            state: Mutex::new(ClockEstimate::default()),
            ready: AtomicBool::new(false),
            recalibration_interval,
        }
    }

    /// Current best estimate of the remote server time.
    ///
    /// Before the first calibration this falls back to the local wall clock;
    /// consumers that need an authoritative value must gate on `is_ready()`.
    pub fn estimate_now(&self) -> DateTime<Utc> {
        let state = self.state.lock();
        match state.anchor {
            Some(anchor) => {
                let elapsed = Duration::milliseconds(anchor.local.elapsed().as_millis() as i64);
                anchor.remote + elapsed + state.correction
            }
            None => Utc::now(),
        }
    }

    /// True once the first probe + time fetch has completed. Never reverts.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn missed_probes(&self) -> u64 {
        self.state.lock().missed_probes
    }

    pub fn corrections(&self) -> u64 {
        self.state.lock().corrections
    }

    /// Half of the last successful round trip.
    pub fn latency(&self) -> StdDuration {
        self.state.lock().latency
    }

    /// Run one full probe-and-fetch cycle.
    ///
    /// The first successful cycle anchors the estimate and latches readiness;
    /// subsequent cycles fold the observed drift into the correction offset.
    /// Any failure leaves the previous estimate untouched.
    pub async fn recalibrate(&self, transport: &dyn ExchangeTransport) -> Result<()> {
        let rtt = match transport.ping().await {
            Ok(rtt) if !rtt.is_zero() => rtt,
            Ok(_) => {
                self.state.lock().missed_probes += 1;
                bail!("clock probe returned a non-positive round trip");
            }
            Err(err) => {
                self.state.lock().missed_probes += 1;
                return Err(err.context("clock probe failed"));
            }
        };
        let latency = rtt / 2;

        let observed = match transport.server_time().await {
            Ok(at) => at,
            Err(err) => {
                self.state.lock().missed_probes += 1;
                return Err(err.context("server time fetch failed"));
            }
        };
        // The observed value is already `latency` old by the time it arrives.
        let remote_now = observed + Duration::milliseconds(latency.as_millis() as i64);

        let mut state = self.state.lock();
        state.latency = latency;
        match state.anchor {
            None => {
                state.anchor = Some(Anchor {
                    remote: remote_now,
                    local: Instant::now(),
                });
                info!(
                    latency_ms = latency.as_millis() as u64,
                    remote = %remote_now,
                    "clock calibrated"
                );
            }
            Some(anchor) => {
                let elapsed = Duration::milliseconds(anchor.local.elapsed().as_millis() as i64);
                let current = anchor.remote + elapsed + state.correction;
                let drift = remote_now - current;
                state.correction = state.correction + drift;
                state.corrections += 1;
                debug!(
                    drift_ms = drift.num_milliseconds(),
                    corrections = state.corrections,
                    latency_ms = latency.as_millis() as u64,
                    "clock recalibrated"
                );
            }
        }
        drop(state);

        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Periodic recalibration loop. The first tick fires immediately so the
    /// synchroniser calibrates at startup.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn ExchangeTransport>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.recalibration_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("clock synchronizer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.recalibrate(transport.as_ref()).await {
                        warn!(error = %err, "clock recalibration failed; retrying next cycle");
                    }
                }
            }
        }
    }
}
