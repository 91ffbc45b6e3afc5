use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 120;

/// Rolling timing metrics for a pipeline stage.
///
/// # Example
/// ```rust
/// use visor_core::prelude::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.record(std::time::Duration::from_millis(5));
/// assert!(metrics.total_samples() >= 1);
/// ```
#[derive(Default, Clone)]
pub struct StageMetrics {
    inner: Arc<StageState>,
}

#[derive(Default)]
struct StageState {
    count: AtomicU64,
    last_nanos: AtomicU64,
    window: Mutex<WindowState>,
}

struct WindowState {
    samples: VecDeque<(Instant, u64)>,
    max: usize,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max: DEFAULT_WINDOW,
        }
    }
}

impl StageMetrics {
    /// Record a single duration sample.
    pub fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        self.inner.last_nanos.store(nanos, Ordering::Relaxed);
        let mut win = self.inner.window.lock();
        win.samples.push_back((Instant::now(), nanos));
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    /// Total samples recorded over the lifetime.
    pub fn total_samples(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Rolling average of samples in milliseconds.
    pub fn avg_millis(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        let count = win.samples.len();
        if count == 0 {
            return None;
        }
        let total: u128 = win.samples.iter().map(|(_, n)| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / count as f64)
    }

    /// Most recent sample in milliseconds.
    pub fn last_millis(&self) -> Option<f64> {
        let last = self.inner.last_nanos.load(Ordering::Relaxed);
        if last == 0 {
            None
        } else {
            Some(last as f64 / 1_000_000.0)
        }
    }

    /// Rolling FPS based on sample timestamps.
    pub fn fps(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        if win.samples.len() < 2 {
            return None;
        }
        let first = win.samples.front()?.0;
        let last = win.samples.back()?.0;
        let span = last.saturating_duration_since(first).as_secs_f64();
        if span > 0.0 {
            Some(win.samples.len() as f64 / span)
        } else {
            None
        }
    }
}

/// Counters the stream controller publishes for external observers.
///
/// `captured_fps` is the previous wall-clock second's grab count, stored
/// atomically at each second rollover.
#[derive(Debug, Default)]
pub struct StreamTelemetry {
    captured_fps: AtomicU32,
    fluency_passed: AtomicU64,
    dropped_failed: AtomicU64,
    dropped_late: AtomicU64,
}

impl StreamTelemetry {
    /// Publish the completed second's capture count.
    pub fn set_captured_fps(&self, fps: u32) {
        self.captured_fps.store(fps, Ordering::Relaxed);
    }

    /// Capture rate over the last completed second.
    pub fn captured_fps(&self) -> u32 {
        self.captured_fps.load(Ordering::Relaxed)
    }

    /// Count a frame skipped by fluency pacing.
    pub fn count_fluency_passed(&self) {
        self.fluency_passed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an encode job that failed.
    pub fn count_dropped_failed(&self) {
        self.dropped_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an encode job that missed its deadline.
    pub fn count_dropped_late(&self) {
        self.dropped_late.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot (fluency-passed, dropped-failed, dropped-late).
    pub fn drops(&self) -> (u64, u64, u64) {
        (
            self.fluency_passed.load(Ordering::Relaxed),
            self.dropped_failed.load(Ordering::Relaxed),
            self.dropped_late.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_window_tracks_samples() {
        let metrics = StageMetrics::default();
        assert!(metrics.avg_millis().is_none());
        metrics.record(Duration::from_millis(4));
        metrics.record(Duration::from_millis(6));
        let avg = metrics.avg_millis().unwrap();
        assert!((avg - 5.0).abs() < 0.5, "avg {avg}");
        assert_eq!(metrics.total_samples(), 2);
    }

    #[test]
    fn telemetry_counters() {
        let telemetry = StreamTelemetry::default();
        telemetry.set_captured_fps(60);
        telemetry.count_fluency_passed();
        telemetry.count_dropped_late();
        assert_eq!(telemetry.captured_fps(), 60);
        assert_eq!(telemetry.drops(), (1, 0, 1));
    }
}
