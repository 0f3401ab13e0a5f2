// src/core/governor.rs

//! Wall-clock-driven token bucket enforcing the configured disk-write speed
//! across all backup file writers on one node.
//!
//! The control loop ticks roughly every 100ms. A writer may initiate a write
//! only while the words written this period are within the period quota; a
//! write that has already entered the file-system queue is never rejected,
//! so a single period may overflow by up to one maximum write. The spill is
//! carried into following periods. Timing uses the tokio monotonic clock, so
//! wall-clock jumps cannot distort the accounting.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Tolerated scheduling jitter before the next tick delay is adjusted.
const JITTER_TOLERANCE_MS: i64 = 10;

#[derive(Debug)]
pub struct WriteRateGovernor {
    /// Word quota per control period.
    curr_speed: u64,
    /// Words initiated so far this period, including consumed carry-over.
    words_written: u64,
    /// Spill-over from previous periods not yet charged to a period.
    carry: u64,
    tick_period: Duration,
    last_tick: Option<Instant>,
    /// Tolerance term for the monitoring report, in words.
    max_write_words: u64,
    monitor_window: Duration,
    monitor_elapsed: Duration,
    monitor_words: u64,
}

impl WriteRateGovernor {
    pub fn new(
        speed_words_per_tick: u64,
        tick_period: Duration,
        monitor_window: Duration,
        max_write_words: u64,
    ) -> Self {
        Self {
            curr_speed: speed_words_per_tick,
            words_written: 0,
            carry: 0,
            tick_period,
            last_tick: None,
            max_write_words,
            monitor_window,
            monitor_elapsed: Duration::ZERO,
            monitor_words: 0,
        }
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub fn current_speed(&self) -> u64 {
        self.curr_speed
    }

    /// Live override of the per-period quota (admin channel).
    pub fn set_speed(&mut self, speed_words_per_tick: u64) {
        self.curr_speed = speed_words_per_tick;
    }

    /// A writer may initiate the next write only within the period quota.
    pub fn write_permitted(&self) -> bool {
        self.words_written <= self.curr_speed
    }

    /// Charges `words` that just entered the file-system queue.
    pub fn note_written(&mut self, words: u64) {
        self.words_written += words;
        self.monitor_words += words;
    }

    /// Closes the current period and opens the next. Returns the delay until
    /// the next tick, compensated for the measured scheduling jitter.
    pub fn on_tick(&mut self, now: Instant) -> Duration {
        let elapsed = self
            .last_tick
            .map(|t| now.duration_since(t))
            .unwrap_or(self.tick_period);
        self.last_tick = Some(now);

        // Spill from the period that just closed joins the carry; the next
        // period starts pre-charged with its share. The "+1" makes a window
        // that exactly filled a period block all further writes in the next.
        self.carry += self.words_written.saturating_sub(self.curr_speed);
        let take = self.carry.min(self.curr_speed + 1);
        self.words_written = take;
        self.carry -= take;

        self.observe_rate(elapsed);

        let drift_ms = elapsed.as_millis() as i64 - self.tick_period.as_millis() as i64;
        if drift_ms.abs() <= JITTER_TOLERANCE_MS {
            self.tick_period
        } else if drift_ms > 0 {
            // Ran late: shorten the next delay, clamped to half a period.
            let shortened = self.tick_period.saturating_sub(Duration::from_millis(drift_ms as u64));
            shortened.max(self.tick_period / 2)
        } else {
            // Ran early: stretch the next delay, clamped to a period and a half.
            let stretched = self.tick_period + Duration::from_millis((-drift_ms) as u64);
            stretched.min(self.tick_period * 3 / 2)
        }
    }

    /// Accumulates the monitoring window and reports an effective rate above
    /// the quota plus a single maximum-write tolerance.
    fn observe_rate(&mut self, elapsed: Duration) {
        self.monitor_elapsed += elapsed;
        if self.monitor_elapsed < self.monitor_window {
            return;
        }

        let periods =
            (self.monitor_elapsed.as_millis() / self.tick_period.as_millis().max(1)).max(1) as u64;
        let avg_per_period = self.monitor_words / periods;
        if avg_per_period > self.curr_speed + self.max_write_words / 4 {
            info!(
                "backup disk write rate above configured limit: {} words/period averaged over {:?} (limit {})",
                avg_per_period, self.monitor_elapsed, self.curr_speed
            );
        }

        self.monitor_elapsed = Duration::ZERO;
        self.monitor_words = 0;
    }
}
