use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Stats {
    images_indexed: AtomicU64,
    images_acquired: AtomicU64,
    images_skipped: AtomicU64,
    images_processed: AtomicU64,
    faces_recorded: AtomicU64,
    batches_flushed: AtomicU64,
    encode_failures: AtomicU64,
    started: Instant,
    last_run_start: parking_lot::Mutex<Option<Instant>>,
    last_run_elapsed: parking_lot::Mutex<Option<f64>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub images_indexed: u64,
    pub images_acquired: u64,
    pub images_skipped: u64,
    pub images_processed: u64,
    pub faces_recorded: u64,
    pub batches_flushed: u64,
    pub encode_failures: u64,
    pub run_active: bool,
    pub last_run_elapsed_secs: Option<f64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            images_indexed: AtomicU64::new(0),
            images_acquired: AtomicU64::new(0),
            images_skipped: AtomicU64::new(0),
            images_processed: AtomicU64::new(0),
            faces_recorded: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            started: Instant::now(),
            last_run_start: parking_lot::Mutex::new(None),
            last_run_elapsed: parking_lot::Mutex::new(None),
        }
    }
    pub fn inc_indexed(&self, n: u64) { self.images_indexed.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_acquired(&self, n: u64) { self.images_acquired.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_skipped(&self, n: u64) { self.images_skipped.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_processed(&self, n: u64) { self.images_processed.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_faces(&self, n: u64) { self.faces_recorded.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_batches(&self, n: u64) { self.batches_flushed.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_encode_failures(&self, n: u64) { self.encode_failures.fetch_add(n, Ordering::Relaxed); }
    pub fn uptime_secs(&self) -> u64 { self.started.elapsed().as_secs() }

    pub fn start_run(&self) {
        *self.last_run_start.lock() = Some(Instant::now());
    }

    // Keeps the elapsed time of the finished run for display while idle
    pub fn finish_run(&self) {
        let mut guard = self.last_run_start.lock();
        if let Some(start) = guard.take() {
            *self.last_run_elapsed.lock() = Some(start.elapsed().as_secs_f64());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            images_indexed: self.images_indexed.load(Ordering::Relaxed),
            images_acquired: self.images_acquired.load(Ordering::Relaxed),
            images_skipped: self.images_skipped.load(Ordering::Relaxed),
            images_processed: self.images_processed.load(Ordering::Relaxed),
            faces_recorded: self.faces_recorded.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            run_active: self.last_run_start.lock().is_some(),
            last_run_elapsed_secs: *self.last_run_elapsed.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_run_timer() {
        let stats = Stats::new();
        stats.inc_acquired(3);
        stats.inc_skipped(1);
        stats.inc_faces(5);
        stats.start_run();
        assert!(stats.snapshot().run_active);
        stats.finish_run();

        let snap = stats.snapshot();
        assert_eq!(snap.images_acquired, 3);
        assert_eq!(snap.images_skipped, 1);
        assert_eq!(snap.faces_recorded, 5);
        assert!(!snap.run_active);
        assert!(snap.last_run_elapsed_secs.is_some());
    }
}
