// =============================================================================
// Core Configuration — schedules, retentions, readiness thresholds
// =============================================================================
//
// Every periodic loop interval and window retention lives here so the core can
// be tuned without recompiling. All fields carry `#[serde(default)]` so that
// adding new fields never breaks loading an older config file. Persistence
// uses an atomic tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_clock_recalibration_secs() -> u64 {
    900
}

fn default_drain_interval_ms() -> u64 {
    1_000
}

fn default_drain_budget_ms() -> u64 {
    50
}

fn default_seconds_retention_secs() -> u64 {
    66
}

fn default_minutes_retention_secs() -> u64 {
    960
}

fn default_hours_retention_secs() -> u64 {
    3_960
}

fn default_prune_interval_secs() -> u64 {
    30
}

fn default_rollup_interval_secs() -> u64 {
    60
}

fn default_minute_eval_secs() -> u64 {
    1
}

fn default_five_eval_secs() -> u64 {
    5
}

fn default_fifteen_eval_secs() -> u64 {
    15
}

fn default_hour_eval_secs() -> u64 {
    30
}

fn default_insight_interval_secs() -> u64 {
    15
}

fn default_ready_after_secs() -> u64 {
    3_600
}

fn default_ready_fifteen_after_secs() -> u64 {
    900
}

fn default_order_tick_ms() -> u64 {
    100
}

// =============================================================================
// CoreConfig
// =============================================================================

/// Top-level configuration for the Helios market-data and execution core.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    // --- Clock synchronisation ----------------------------------------------

    /// How often the remote clock offset is re-measured.
    #[serde(default = "default_clock_recalibration_secs")]
    pub clock_recalibration_secs: u64,

    // --- Trade ingestion ----------------------------------------------------

    /// Interval between coalescing passes over the raw trade queue.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Wall-clock budget for a single coalescing pass. Events still queued
    /// when the budget expires are left for the next pass.
    #[serde(default = "default_drain_budget_ms")]
    pub drain_budget_ms: u64,

    // --- Window retentions --------------------------------------------------

    /// Retention of the seconds window (feeds the 1m lookback).
    #[serde(default = "default_seconds_retention_secs")]
    pub seconds_retention_secs: u64,

    /// Retention of the minutes window (feeds the 5m and 15m lookbacks).
    #[serde(default = "default_minutes_retention_secs")]
    pub minutes_retention_secs: u64,

    /// Retention of the hours window (feeds the 1h lookback).
    #[serde(default = "default_hours_retention_secs")]
    pub hours_retention_secs: u64,

    /// Interval between prune passes on each window.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    /// Interval between minute roll-ups from the seconds window into the
    /// minutes and hours windows.
    #[serde(default = "default_rollup_interval_secs")]
    pub rollup_interval_secs: u64,

    // --- Aggregation schedules ----------------------------------------------
    // Finer timeframes evaluate more frequently than coarser ones so coarse
    // aggregates are not recomputed wastefully.

    #[serde(default = "default_minute_eval_secs")]
    pub minute_eval_secs: u64,

    #[serde(default = "default_five_eval_secs")]
    pub five_eval_secs: u64,

    #[serde(default = "default_fifteen_eval_secs")]
    pub fifteen_eval_secs: u64,

    #[serde(default = "default_hour_eval_secs")]
    pub hour_eval_secs: u64,

    // --- Insight evaluation -------------------------------------------------

    /// Interval between insight evaluation cycles.
    #[serde(default = "default_insight_interval_secs")]
    pub insight_interval_secs: u64,

    /// Continuous run time after which the full warm-up latch sets.
    #[serde(default = "default_ready_after_secs")]
    pub ready_after_secs: u64,

    /// Continuous run time after which the fifteen-minute latch sets.
    #[serde(default = "default_ready_fifteen_after_secs")]
    pub ready_fifteen_after_secs: u64,

    // --- Order execution ----------------------------------------------------

    /// Interval between order-queue drain attempts.
    #[serde(default = "default_order_tick_ms")]
    pub order_tick_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            clock_recalibration_secs: default_clock_recalibration_secs(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_budget_ms: default_drain_budget_ms(),
            seconds_retention_secs: default_seconds_retention_secs(),
            minutes_retention_secs: default_minutes_retention_secs(),
            hours_retention_secs: default_hours_retention_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            rollup_interval_secs: default_rollup_interval_secs(),
            minute_eval_secs: default_minute_eval_secs(),
            five_eval_secs: default_five_eval_secs(),
            fifteen_eval_secs: default_fifteen_eval_secs(),
            hour_eval_secs: default_hour_eval_secs(),
            insight_interval_secs: default_insight_interval_secs(),
            ready_after_secs: default_ready_after_secs(),
            ready_fifteen_after_secs: default_ready_fifteen_after_secs(),
            order_tick_ms: default_order_tick_ms(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read core config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse core config from {}", path.display()))?;

        info!(path = %path.display(), "core config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise core config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "core config saved (atomic)");
        Ok(())
    }

    pub fn clock_recalibration(&self) -> Duration {
        Duration::from_secs(self.clock_recalibration_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn drain_budget(&self) -> Duration {
        Duration::from_millis(self.drain_budget_ms)
    }

    pub fn order_tick(&self) -> Duration {
        Duration::from_millis(self.order_tick_ms)
    }
}
