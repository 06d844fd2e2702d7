use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::transfer::TransferError;
use crate::util::lock_unpoisoned;

/// Per-attempt statistics contract. `start` is called once per request at
/// submission; exactly one of `finish_ok`/`finish_ec` is called for every
/// attempt that ran; `store_time_to_start` records the attempt's time to
/// first byte when the engine measured one.
pub trait StatsSink: Send + Sync {
    fn start(&self);
    fn store_time_to_start(&self, elapsed: Duration);
    fn finish_ok(&self, status: u16);
    fn finish_ec(&self, error: &TransferError);
}

#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub requests_started: u64,
    pub attempts_ok: u64,
    pub attempts_failed: u64,
    pub time_to_start_samples: u64,
    pub time_to_start_total_ms: u64,
    pub time_to_start_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Default stats sink: lock-free counters with a point-in-time snapshot.
#[derive(Clone, Debug, Default)]
pub struct ClientStats {
    inner: Arc<ClientStatsInner>,
}

#[derive(Debug, Default)]
struct ClientStatsInner {
    requests_started: AtomicU64,
    attempts_ok: AtomicU64,
    attempts_failed: AtomicU64,
    time_to_start_samples: AtomicU64,
    time_to_start_total_ms: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        let time_to_start_samples = inner.time_to_start_samples.load(Ordering::Relaxed);
        let time_to_start_total_ms = inner.time_to_start_total_ms.load(Ordering::Relaxed);
        let time_to_start_avg_ms = if time_to_start_samples == 0 {
            0.0
        } else {
            time_to_start_total_ms as f64 / time_to_start_samples as f64
        };

        StatsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            attempts_ok: inner.attempts_ok.load(Ordering::Relaxed),
            attempts_failed: inner.attempts_failed.load(Ordering::Relaxed),
            time_to_start_samples,
            time_to_start_total_ms,
            time_to_start_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

/// Forwards every per-attempt call to the client's default sink and to a
/// caller-supplied one, so snapshots keep working when a custom sink is
/// installed.
pub(crate) struct FanoutStats {
    default_sink: ClientStats,
    custom_sink: Arc<dyn StatsSink>,
}

impl FanoutStats {
    pub(crate) fn new(default_sink: ClientStats, custom_sink: Arc<dyn StatsSink>) -> Self {
        Self {
            default_sink,
            custom_sink,
        }
    }
}

impl StatsSink for FanoutStats {
    fn start(&self) {
        self.default_sink.start();
        self.custom_sink.start();
    }

    fn store_time_to_start(&self, elapsed: Duration) {
        self.default_sink.store_time_to_start(elapsed);
        self.custom_sink.store_time_to_start(elapsed);
    }

    fn finish_ok(&self, status: u16) {
        self.default_sink.finish_ok(status);
        self.custom_sink.finish_ok(status);
    }

    fn finish_ec(&self, error: &TransferError) {
        self.default_sink.finish_ec(error);
        self.custom_sink.finish_ec(error);
    }
}

impl StatsSink for ClientStats {
    fn start(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    fn store_time_to_start(&self, elapsed: Duration) {
        self.inner
            .time_to_start_samples
            .fetch_add(1, Ordering::Relaxed);
        self.inner.time_to_start_total_ms.fetch_add(
            elapsed.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn finish_ok(&self, status: u16) {
        self.inner.attempts_ok.fetch_add(1, Ordering::Relaxed);
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn finish_ec(&self, error: &TransferError) {
        self.inner.attempts_failed.fetch_add(1, Ordering::Relaxed);
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error.kind.as_str().to_owned()).or_insert(0) += 1;
    }
}
