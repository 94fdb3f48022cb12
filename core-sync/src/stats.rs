//! Aggregate statistics for one orchestrator run.

use crate::job::{JobKind, JobState};
use serde::Serialize;
use std::time::Duration;

/// Outcome counts for one worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub done: u64,
    pub failed: u64,
    pub retry_pending: u64,
}

/// Job duration percentiles (nearest-rank).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationSummary {
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl DurationSummary {
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        Self {
            p50: percentile(&samples, 50),
            p90: percentile(&samples, 90),
            p99: percentile(&samples, 99),
            max: samples[samples.len() - 1],
        }
    }
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// Summary returned by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Jobs that reached `done` in this run
    pub done: u64,
    /// Jobs that became terminally `failed` in this run
    pub failed: u64,
    /// Jobs that failed this run but remain eligible for a later one
    pub retry_pending: u64,
    /// Jobs skipped because they were already terminal
    pub skipped: u64,
    /// Pending jobs never claimed (item limit or cancellation)
    pub not_started: u64,
    pub download: PoolStats,
    pub upload: PoolStats,
    pub elapsed: Duration,
    pub durations: DurationSummary,
}

impl RunStats {
    /// Jobs that finished an attempt in this run, whatever the outcome
    pub fn processed(&self) -> u64 {
        self.done + self.failed + self.retry_pending
    }

    pub fn pool(&self, kind: JobKind) -> &PoolStats {
        match kind {
            JobKind::Download => &self.download,
            JobKind::Upload => &self.upload,
        }
    }
}

/// Accumulates per-job outcomes while workers run.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    stats: RunStats,
    samples: Vec<Duration>,
}

impl StatsCollector {
    pub(crate) fn record(&mut self, kind: JobKind, outcome: JobState, took: Duration) {
        let pool = match kind {
            JobKind::Download => &mut self.stats.download,
            JobKind::Upload => &mut self.stats.upload,
        };
        match outcome {
            JobState::Done => {
                pool.done += 1;
                self.stats.done += 1;
            }
            JobState::Failed => {
                pool.failed += 1;
                self.stats.failed += 1;
            }
            JobState::Pending | JobState::InFlight => {
                pool.retry_pending += 1;
                self.stats.retry_pending += 1;
            }
        }
        self.samples.push(took);
    }

    pub(crate) fn skipped(&mut self, count: u64) {
        self.stats.skipped += count;
    }

    pub(crate) fn not_started(&mut self, count: u64) {
        self.stats.not_started += count;
    }

    pub(crate) fn done(&self) -> u64 {
        self.stats.done
    }

    pub(crate) fn finish(self, elapsed: Duration) -> RunStats {
        RunStats {
            elapsed,
            durations: DurationSummary::from_samples(self.samples),
            ..self.stats
        }
    }
}
