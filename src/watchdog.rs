//! Host rewrite of `WatchdogManager`: no hardware timer to arm, so this
//! tracks per-task feed timestamps and reports staleness. `check_health`
//! replaces the firmware's reset-on-starve behavior with a critical alarm;
//! the orchestrator decides whether that escalates to process exit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct FeedStats {
    pub feed_count: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub total_interval_ms: u64,
}

impl Default for FeedStats {
    fn default() -> Self {
        FeedStats {
            feed_count: 0,
            min_interval_ms: u64::MAX,
            max_interval_ms: 0,
            total_interval_ms: 0,
        }
    }
}

impl FeedStats {
    pub fn average_interval_ms(&self) -> f64 {
        if self.feed_count == 0 {
            0.0
        } else {
            self.total_interval_ms as f64 / self.feed_count as f64
        }
    }
}

struct TaskState {
    last_feed: Instant,
    stats: FeedStats,
}

pub struct Watchdog {
    min_feed_interval: Duration,
    timeout: Duration,
    tasks: Mutex<HashMap<&'static str, TaskState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Starved(&'static str),
}

impl Watchdog {
    pub fn new(timeout_ms: u64, min_feed_interval_ms: u64) -> Self {
        Watchdog {
            min_feed_interval: Duration::from_millis(min_feed_interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a task so `check_health` starts tracking it. Should be
    /// called once at task startup, before the first `feed`.
    pub fn register(&self, task: &'static str) {
        self.tasks.lock().entry(task).or_insert_with(|| TaskState {
            last_feed: Instant::now(),
            stats: FeedStats::default(),
        });
    }

    /// Rate-limited feed: a call arriving sooner than `min_feed_interval`
    /// after the previous one is silently ignored, mirroring
    /// `validateFeedInterval()`.
    pub fn feed(&self, task: &'static str) {
        let mut tasks = self.tasks.lock();
        let now = Instant::now();
        let entry = tasks.entry(task).or_insert_with(|| TaskState {
            last_feed: now,
            stats: FeedStats::default(),
        });
        let elapsed = now.duration_since(entry.last_feed);
        if entry.stats.feed_count > 0 && elapsed < self.min_feed_interval {
            return;
        }
        let elapsed_ms = elapsed.as_millis() as u64;
        entry.stats.feed_count += 1;
        entry.stats.min_interval_ms = entry.stats.min_interval_ms.min(elapsed_ms);
        entry.stats.max_interval_ms = entry.stats.max_interval_ms.max(elapsed_ms);
        entry.stats.total_interval_ms += elapsed_ms;
        entry.last_feed = now;
    }

    pub fn stats_for(&self, task: &'static str) -> Option<FeedStats> {
        self.tasks.lock().get(&task).map(|t| t.stats)
    }

    /// Returns the first task (if any) that has gone stale beyond the
    /// configured timeout.
    pub fn check_health(&self) -> HealthStatus {
        let tasks = self.tasks.lock();
        let now = Instant::now();
        for (name, state) in tasks.iter() {
            if now.duration_since(state.last_feed) > self.timeout {
                return HealthStatus::Starved(name);
            }
        }
        HealthStatus::Healthy
    }
}

/// Stands in for `esp_reset_reason()`: the marker file is created at boot
/// and removed on a clean shutdown, so finding it already present means the
/// previous run never got that far. Returns whether the prior run looks
/// unclean, then (re)creates the marker for this run.
pub fn check_and_arm_shutdown_marker(marker_path: &str) -> bool {
    let path = Path::new(marker_path);
    let dirty = path.exists();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, b"");
    dirty
}

/// Removes the marker on a clean shutdown so the next boot doesn't report
/// a false `WatchdogReset`.
pub fn clear_shutdown_marker(marker_path: &str) {
    let _ = std::fs::remove_file(marker_path);
}
