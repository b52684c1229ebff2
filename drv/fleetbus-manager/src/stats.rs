// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manager counters and latency accumulators.

use std::time::{Duration, Instant};

/// Counters and duration accumulators over the manager's lifetime (or
/// since the last [`reset`](Statistics::reset)).
///
/// Durations are sums; divide by the matching count for a mean. The
/// per-cycle register counters track how many registers each cycle moved,
/// with a running max and an exponential moving average.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    // Protocol calls, by class.
    pub read_count: u64,
    pub write_count: u64,
    pub sync_read_count: u64,
    pub sync_write_count: u64,

    // Total bytes moved by each call class.
    pub read_length: u64,
    pub write_length: u64,
    pub sync_read_length: u64,
    pub sync_write_length: u64,

    // Summed and maximum call durations, by class.
    pub read_duration: Duration,
    pub write_duration: Duration,
    pub sync_read_duration: Duration,
    pub sync_write_duration: Duration,
    pub max_read_duration: Duration,
    pub max_write_duration: Duration,
    pub max_sync_read_duration: Duration,
    pub max_sync_write_duration: Duration,

    // Cycle machinery.
    pub flush_count: u64,
    pub wait_next_flush_count: u64,
    pub wait_next_flush_cooperative_count: u64,
    pub force_read_count: u64,
    pub force_write_count: u64,
    /// Time the manager spent from cycle start to opening the second
    /// barrier (includes waiting for cooperative users).
    pub wait_users_duration: Duration,
    /// Time user threads spent inside `wait_next_flush`.
    pub wait_manager_duration: Duration,

    pub emergency_count: u64,
    pub exit_emergency_count: u64,

    // Response accounting.
    pub device_ok_count: u64,
    pub device_warning_count: u64,
    pub device_quiet_count: u64,
    pub device_error_count: u64,
    pub read_error_count: u64,
    pub write_error_count: u64,

    // Registers moved per cycle: current accumulator, EMA mean, max.
    pub reg_read_per_flush_accu: u64,
    pub reg_read_per_flush_mean: f64,
    pub reg_read_per_flush_max: u64,
    pub reg_written_per_flush_accu: u64,
    pub reg_written_per_flush_mean: f64,
    pub reg_written_per_flush_max: u64,

    // Cycle period tracking.
    pub max_flush_period: Duration,
    pub sum_flush_period: Duration,
    last_flush: Option<Instant>,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn note_read(&mut self, len: usize, duration: Duration) {
        self.read_count += 1;
        self.read_length += len as u64;
        self.read_duration += duration;
        self.max_read_duration = self.max_read_duration.max(duration);
    }

    pub(crate) fn note_write(&mut self, len: usize, duration: Duration) {
        self.write_count += 1;
        self.write_length += len as u64;
        self.write_duration += duration;
        self.max_write_duration = self.max_write_duration.max(duration);
    }

    pub(crate) fn note_sync_read(&mut self, len: usize, duration: Duration) {
        self.sync_read_count += 1;
        self.sync_read_length += len as u64;
        self.sync_read_duration += duration;
        self.max_sync_read_duration =
            self.max_sync_read_duration.max(duration);
    }

    pub(crate) fn note_sync_write(&mut self, len: usize, duration: Duration) {
        self.sync_write_count += 1;
        self.sync_write_length += len as u64;
        self.sync_write_duration += duration;
        self.max_sync_write_duration =
            self.max_sync_write_duration.max(duration);
    }

    /// Folds the per-cycle register accumulators into their running mean
    /// and max, tracks the cycle period, and counts the cycle.
    pub(crate) fn note_flush_start(&mut self, now: Instant) {
        self.flush_count += 1;

        if self.reg_read_per_flush_max == 0 {
            self.reg_read_per_flush_mean = self.reg_read_per_flush_accu as f64;
        } else {
            self.reg_read_per_flush_mean = 0.99 * self.reg_read_per_flush_mean
                + 0.01 * self.reg_read_per_flush_accu as f64;
        }
        self.reg_read_per_flush_max = self
            .reg_read_per_flush_max
            .max(self.reg_read_per_flush_accu);
        self.reg_read_per_flush_accu = 0;

        if self.reg_written_per_flush_max == 0 {
            self.reg_written_per_flush_mean =
                self.reg_written_per_flush_accu as f64;
        } else {
            self.reg_written_per_flush_mean = 0.99
                * self.reg_written_per_flush_mean
                + 0.01 * self.reg_written_per_flush_accu as f64;
        }
        self.reg_written_per_flush_max = self
            .reg_written_per_flush_max
            .max(self.reg_written_per_flush_accu);
        self.reg_written_per_flush_accu = 0;

        if let Some(last) = self.last_flush {
            let period = now.duration_since(last);
            self.max_flush_period = self.max_flush_period.max(period);
            self.sum_flush_period += period;
        }
        self.last_flush = Some(now);
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        total / count as u32
    }
}

impl core::fmt::Display for Statistics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "statistics:")?;
        writeln!(
            f,
            "  cycles: {} (mean period {:?}, max {:?})",
            self.flush_count,
            mean(self.sum_flush_period, self.flush_count.saturating_sub(1)),
            self.max_flush_period,
        )?;
        writeln!(
            f,
            "  reads: {} calls, {} bytes, mean {:?}, max {:?}",
            self.read_count,
            self.read_length,
            mean(self.read_duration, self.read_count),
            self.max_read_duration,
        )?;
        writeln!(
            f,
            "  writes: {} calls, {} bytes, mean {:?}, max {:?}",
            self.write_count,
            self.write_length,
            mean(self.write_duration, self.write_count),
            self.max_write_duration,
        )?;
        writeln!(
            f,
            "  sync reads: {} calls, {} bytes, mean {:?}, max {:?}",
            self.sync_read_count,
            self.sync_read_length,
            mean(self.sync_read_duration, self.sync_read_count),
            self.max_sync_read_duration,
        )?;
        writeln!(
            f,
            "  sync writes: {} calls, {} bytes, mean {:?}, max {:?}",
            self.sync_write_count,
            self.sync_write_length,
            mean(self.sync_write_duration, self.sync_write_count),
            self.max_sync_write_duration,
        )?;
        writeln!(
            f,
            "  regs per cycle: read mean {:.1} max {}, written mean {:.1} \
             max {}",
            self.reg_read_per_flush_mean,
            self.reg_read_per_flush_max,
            self.reg_written_per_flush_mean,
            self.reg_written_per_flush_max,
        )?;
        writeln!(
            f,
            "  waits: {} plain, {} cooperative, users {:?}, manager {:?}",
            self.wait_next_flush_count,
            self.wait_next_flush_cooperative_count,
            self.wait_users_duration,
            self.wait_manager_duration,
        )?;
        writeln!(
            f,
            "  force: {} reads, {} writes; emergency: {} stop, {} resume",
            self.force_read_count,
            self.force_write_count,
            self.emergency_count,
            self.exit_emergency_count,
        )?;
        write!(
            f,
            "  responses: {} ok, {} warning, {} quiet, {} error; retries: \
             {} read, {} write",
            self.device_ok_count,
            self.device_warning_count,
            self.device_quiet_count,
            self.device_error_count,
            self.read_error_count,
            self.write_error_count,
        )
    }
}
