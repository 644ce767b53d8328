use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Byte-rate throttle shared by all chunk workers of one download.
///
/// Credits accrue from wall time on demand, inside `acquire` itself, so no
/// refill task runs in the background and nothing outlives the download. A
/// limit <= 0 disables throttling entirely.
pub(crate) struct RateLimiter {
  limit_bps: f64,
  bucket: Option<Mutex<Bucket>>,
}

struct Bucket {
  credits: f64,
  refreshed: Instant,
}

impl RateLimiter {
  pub(crate) fn new(limit_bps: i64) -> Self {
    RateLimiter {
      limit_bps: limit_bps as f64,
      bucket: (limit_bps > 0).then(|| {
        Mutex::new(Bucket {
          credits: 0.0,
          refreshed: Instant::now(),
        })
      }),
    }
  }

  /// Waits until `bytes` of budget are available, then spends them. The lock
  /// is only held to settle the bucket; the waiting happens in plain sleeps
  /// sized to the remaining deficit.
  pub(crate) async fn acquire(&self, bytes: usize) {
    let Some(bucket) = &self.bucket else { return };
    // Credits are capped at one second of budget, so a frame larger than
    // that costs a full bucket instead of waiting forever.
    let need = (bytes as f64).min(self.limit_bps);
    if need <= 0.0 {
      return;
    }

    loop {
      let deficit = {
        let mut bucket = bucket.lock();
        let now = Instant::now();
        let idle = now.saturating_duration_since(bucket.refreshed);
        bucket.credits = (bucket.credits + idle.as_secs_f64() * self.limit_bps).min(self.limit_bps);
        bucket.refreshed = now;
        if bucket.credits >= need {
          bucket.credits -= need;
          return;
        }
        need - bucket.credits
      };
      tokio::time::sleep(Duration::from_secs_f64(deficit / self.limit_bps)).await;
    }
  }
}
