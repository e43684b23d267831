// Download progress aggregation for one job.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Highest percentage reported before the merge has finished.
pub const MAX_DOWNLOAD_PERCENT: f64 = 95.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub percent: f64,
    pub bytes_downloaded: u64,
    pub estimated_total_bytes: u64,
    /// Average rate since the download phase started, in bytes per second
    pub bytes_per_second: f64,
    pub segments_done: usize,
    pub segments_total: usize,
}

/// Size estimate for a stream of `duration_secs` at `bitrate_bps`.
pub fn estimate_total_bytes(duration_secs: f64, bitrate_bps: u64) -> u64 {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0;
    }
    (duration_secs * bitrate_bps as f64 / 8.0) as u64
}

/// Shared between the in-flight segment downloads of a job.
#[derive(Debug)]
pub struct ProgressTracker {
    estimated_total_bytes: u64,
    segments_total: usize,
    interval: Duration,
    started: Instant,
    bytes: AtomicU64,
    segments_done: AtomicUsize,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressTracker {
    pub fn new(estimated_total_bytes: u64, segments_total: usize, interval: Duration) -> Self {
        Self {
            estimated_total_bytes,
            segments_total,
            interval,
            started: Instant::now(),
            bytes: AtomicU64::new(0),
            segments_done: AtomicUsize::new(0),
            last_emit: Mutex::new(None),
        }
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Account for freshly written bytes. Returns an event when the throttle
    /// interval has elapsed since the last one.
    pub fn record_bytes(&self, n: u64) -> Option<ProgressEvent> {
        self.bytes.fetch_add(n, Ordering::Relaxed);

        let now = Instant::now();
        let mut last = self.last_emit.lock();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => None,
            _ => {
                *last = Some(now);
                drop(last);
                Some(self.snapshot())
            }
        }
    }

    /// Mark one segment as complete. Always returns an event.
    pub fn segment_done(&self) -> ProgressEvent {
        self.segments_done.fetch_add(1, Ordering::Relaxed);
        *self.last_emit.lock() = Some(Instant::now());
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressEvent {
        let bytes = self.bytes_downloaded();
        let percent = if self.estimated_total_bytes == 0 {
            0.0
        } else {
            (bytes as f64 / self.estimated_total_bytes as f64 * 100.0).min(MAX_DOWNLOAD_PERCENT)
        };
        self.event(percent, bytes)
    }

    /// The final event, sent once the output file is in place.
    pub fn finished(&self) -> ProgressEvent {
        self.event(100.0, self.bytes_downloaded())
    }

    fn event(&self, percent: f64, bytes: u64) -> ProgressEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressEvent {
            percent,
            bytes_downloaded: bytes,
            estimated_total_bytes: self.estimated_total_bytes,
            bytes_per_second: if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            },
            segments_done: self.segments_done.load(Ordering::Relaxed),
            segments_total: self.segments_total,
        }
    }
}
