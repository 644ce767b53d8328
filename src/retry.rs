use crate::config::RetryConfig;
use crate::error::DownloadError;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared state threaded through retried operations: the cancellation signal
/// and the run-wide retry counter reported in the final stats.
pub struct RetryContext<'a> {
  pub cancel: &'a CancellationToken,
  pub retries: &'a AtomicU32,
}

/// Decides whether a failed attempt is worth another try and how long to wait
/// before it. One controller instance serves a whole download.
#[derive(Debug, Clone)]
pub struct RetryController {
  cfg: RetryConfig,
}

impl RetryController {
  pub fn new(cfg: RetryConfig) -> Self {
    RetryController { cfg }
  }

  pub fn should_retry(&self, err: &DownloadError, attempt: u32) -> bool {
    attempt < self.cfg.max_retries && err.is_retriable()
  }

  /// Exponential back-off capped at `max_delay`. The exponent is compared
  /// against `max_delay / base_delay` before multiplying so large attempt
  /// numbers cannot overflow past the cap.
  pub fn next_delay(&self, attempt: u32) -> Duration {
    let base = self.cfg.base_delay.as_secs_f64();
    let max = self.cfg.max_delay.as_secs_f64();
    let factor = self.cfg.backoff_factor.max(1.0);

    let ceiling = max / base;
    let growth = factor.powi(attempt.min(i32::MAX as u32) as i32);
    let mut delay = if !growth.is_finite() || growth >= ceiling {
      max
    } else {
      (base * growth).min(max)
    };

    if self.cfg.jitter {
      let scale: f64 = rand::thread_rng().gen_range(0.9..=1.1);
      delay *= scale;
    }

    Duration::from_secs_f64(delay.max(0.0))
  }

  /// Runs `op` until it succeeds, fails with a non-retriable error, exhausts
  /// the retry budget, or the context is cancelled. Cancellation during the
  /// back-off sleep propagates as `Cancelled`, not the last attempt's error.
  pub async fn execute<T, F, Fut>(
    &self,
    ctx: &RetryContext<'_>,
    mut op: F,
  ) -> Result<T, DownloadError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
  {
    let mut attempt = 0u32;
    loop {
      if ctx.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
      }
      match op().await {
        Ok(value) => return Ok(value),
        Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
        Err(err) => {
          if !self.should_retry(&err, attempt) {
            return Err(err);
          }
          let delay = self.next_delay(attempt);
          tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "backing off before retry");
          ctx.retries.fetch_add(1, Ordering::Relaxed);
          tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
          }
          attempt += 1;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  fn no_jitter(base_ms: u64, max_ms: u64, factor: f64) -> RetryController {
    RetryController::new(RetryConfig {
      max_retries: 5,
      base_delay: Duration::from_millis(base_ms),
      max_delay: Duration::from_millis(max_ms),
      backoff_factor: factor,
      jitter: false,
    })
  }

  #[test]
  fn backoff_grows_exponentially_then_caps() {
    let ctl = no_jitter(100, 1_000, 2.0);
    assert_eq!(ctl.next_delay(0), Duration::from_millis(100));
    assert_eq!(ctl.next_delay(1), Duration::from_millis(200));
    assert_eq!(ctl.next_delay(2), Duration::from_millis(400));
    assert_eq!(ctl.next_delay(3), Duration::from_millis(800));
    assert_eq!(ctl.next_delay(4), Duration::from_millis(1_000));
    assert_eq!(ctl.next_delay(5), Duration::from_millis(1_000));
  }

  #[test]
  fn backoff_is_monotone_non_decreasing() {
    let ctl = no_jitter(10, 5_000, 1.7);
    let mut prev = Duration::ZERO;
    for attempt in 0..40 {
      let d = ctl.next_delay(attempt);
      assert!(d >= prev, "delay shrank at attempt {attempt}");
      prev = d;
    }
  }

  #[test]
  fn huge_attempt_numbers_do_not_overflow() {
    let ctl = no_jitter(1, 60_000, 10.0);
    assert_eq!(ctl.next_delay(u32::MAX), Duration::from_millis(60_000));
    assert_eq!(ctl.next_delay(1_000), Duration::from_millis(60_000));
  }

  #[test]
  fn jitter_stays_within_ten_percent() {
    let ctl = RetryController::new(RetryConfig {
      max_retries: 3,
      base_delay: Duration::from_millis(1_000),
      max_delay: Duration::from_secs(60),
      backoff_factor: 1.0,
      jitter: true,
    });
    for _ in 0..200 {
      let d = ctl.next_delay(0);
      assert!(d >= Duration::from_millis(900), "too short: {d:?}");
      assert!(d <= Duration::from_millis(1_100), "too long: {d:?}");
    }
  }

  #[test]
  fn should_retry_respects_budget_and_kind() {
    let ctl = no_jitter(10, 100, 2.0);
    let transient = DownloadError::NetworkTransient("reset".to_string());
    let fatal = DownloadError::HttpClient {
      status: 404,
      message: "not found".to_string(),
    };
    assert!(ctl.should_retry(&transient, 0));
    assert!(ctl.should_retry(&transient, 4));
    assert!(!ctl.should_retry(&transient, 5));
    assert!(!ctl.should_retry(&fatal, 0));
  }

  #[tokio::test]
  async fn execute_retries_until_success() {
    let ctl = no_jitter(1, 10, 2.0);
    let cancel = CancellationToken::new();
    let retries = AtomicU32::new(0);
    let ctx = RetryContext {
      cancel: &cancel,
      retries: &retries,
    };

    let calls = AtomicU32::new(0);
    let result = ctl
      .execute(&ctx, || {
        let n = calls.fetch_add(1, Ordering::Relaxed);
        async move {
          if n < 2 {
            Err(DownloadError::NetworkTransient("flaky".to_string()))
          } else {
            Ok(n)
          }
        }
      })
      .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(retries.load(Ordering::Relaxed), 2);
  }

  #[tokio::test]
  async fn execute_bounds_total_attempts() {
    let ctl = no_jitter(1, 2, 2.0);
    let cancel = CancellationToken::new();
    let retries = AtomicU32::new(0);
    let ctx = RetryContext {
      cancel: &cancel,
      retries: &retries,
    };

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = ctl
      .execute(&ctx, || {
        calls.fetch_add(1, Ordering::Relaxed);
        async { Err(DownloadError::HttpServer { status: 503, message: "busy".to_string() }) }
      })
      .await;

    assert!(result.is_err());
    // max_retries = 5 -> at most 6 attempts total.
    assert_eq!(calls.load(Ordering::Relaxed), 6);
  }

  #[tokio::test]
  async fn execute_propagates_cancellation_over_last_error() {
    let ctl = no_jitter(50, 500, 2.0);
    let cancel = CancellationToken::new();
    let retries = AtomicU32::new(0);
    let ctx = RetryContext {
      cancel: &cancel,
      retries: &retries,
    };

    cancel.cancel();
    let result: Result<(), _> = ctl
      .execute(&ctx, || async {
        Err(DownloadError::NetworkTransient("never seen".to_string()))
      })
      .await;
    assert!(matches!(result, Err(DownloadError::Cancelled)));
  }
}
