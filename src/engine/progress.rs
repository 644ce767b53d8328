use crate::config::ProgressCallback;
use crate::model::ProgressSnapshot;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EWMA_ALPHA: f64 = 0.2;

/// Thread-safe progress rollup. Workers only ever add on the write path;
/// speed smoothing happens on the reporter task.
pub(crate) struct ProgressTracker {
  // -1 means unknown.
  total: AtomicI64,
  downloaded: AtomicU64,
  last_observed: AtomicU64,
  speed_ewma: Mutex<f64>,
  started: Instant,
}

impl ProgressTracker {
  pub fn new(total: Option<u64>, restored: u64) -> Self {
    ProgressTracker {
      total: AtomicI64::new(total.map(|t| t as i64).unwrap_or(-1)),
      downloaded: AtomicU64::new(restored),
      last_observed: AtomicU64::new(restored),
      speed_ewma: Mutex::new(0.0),
      started: Instant::now(),
    }
  }

  pub fn add(&self, bytes: u64) {
    self.downloaded.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn downloaded(&self) -> u64 {
    self.downloaded.load(Ordering::Relaxed)
  }

  pub fn total(&self) -> Option<u64> {
    let raw = self.total.load(Ordering::Relaxed);
    (raw >= 0).then_some(raw as u64)
  }

  /// Folds the bytes seen since the previous observation into the EWMA.
  fn observe(&self, interval: Duration) {
    let now = self.downloaded();
    let before = self.last_observed.swap(now, Ordering::Relaxed);
    let instant_bps = (now.saturating_sub(before)) as f64 / interval.as_secs_f64().max(1e-6);
    let mut ewma = self.speed_ewma.lock();
    *ewma = *ewma * (1.0 - EWMA_ALPHA) + instant_bps * EWMA_ALPHA;
  }

  pub fn snapshot(&self) -> ProgressSnapshot {
    let downloaded = self.downloaded();
    let total = self.total();
    let speed_bps = *self.speed_ewma.lock();
    let eta = match total {
      Some(total) if speed_bps > 1.0 && total > downloaded => {
        Some(Duration::from_secs_f64((total - downloaded) as f64 / speed_bps))
      }
      _ => None,
    };
    ProgressSnapshot {
      total,
      downloaded,
      speed_bps,
      elapsed: self.started.elapsed(),
      eta,
    }
  }
}

/// Periodically snapshots the tracker and invokes the caller's callback from
/// a dedicated task, off the worker I/O paths.
pub(crate) fn spawn_reporter(
  tracker: Arc<ProgressTracker>,
  callback: ProgressCallback,
  interval: Duration,
  cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the first observation
    // spans a real interval.
    tick.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tick.tick() => {
          tracker.observe(interval);
          callback(tracker.snapshot());
        }
      }
    }
  })
}
