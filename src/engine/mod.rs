//! Engine facade: probe, plan, resume reconciliation, dispatch, finalise.

pub mod plan;
pub mod sink;

mod pool;
mod progress;
mod resume;
mod worker;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::limit::RateLimiter;
use crate::model::{DownloadStats, RemoteResource};
use crate::probe;
use crate::retry::{RetryContext, RetryController};
use crate::transport;
use parking_lot::Mutex;
use plan::Chunk;
use progress::ProgressTracker;
use resume::ResumeManager;
use sink::{Sink, SinkWriter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Everything one download's workers share. Chunk state and the sidecar sit
/// behind locks held only across state transitions, never across I/O.
pub(crate) struct Shared {
  pub cfg: DownloadConfig,
  pub client: reqwest::Client,
  pub resource: RemoteResource,
  pub sink: SinkWriter,
  pub progress: Arc<ProgressTracker>,
  pub limiter: RateLimiter,
  pub retry: RetryController,
  pub retries: AtomicU32,
  pub cancel: CancellationToken,
  pub chunks: Mutex<Vec<Chunk>>,
  pub resume: ResumeManager,
  pub first_error: Mutex<Option<DownloadError>>,
}

/// Download engine. One instance holds a configured HTTP client and can run
/// any number of downloads; each `download` call owns its sink and plan for
/// the duration of the run.
pub struct Downloader {
  cfg: DownloadConfig,
  client: reqwest::Client,
  retry: RetryController,
}

impl Downloader {
  pub fn new(cfg: DownloadConfig) -> Result<Downloader, DownloadError> {
    cfg.validate()?;
    let client = transport::build_client(&cfg)?;
    let retry = RetryController::new(cfg.retry);
    Ok(Downloader { cfg, client, retry })
  }

  pub fn config(&self) -> &DownloadConfig {
    &self.cfg
  }

  /// Downloads `url` into `sink`. Always returns stats; `success == false`
  /// implies `error` is set. Cancelling `cancel` stops the run promptly and
  /// leaves any resume sidecar in place.
  pub async fn download(
    &self,
    url: &str,
    sink: Sink,
    cancel: &CancellationToken,
  ) -> DownloadStats {
    let started_at = time::OffsetDateTime::now_utc();
    let started = Instant::now();

    let report = self.run(url, sink, cancel).await;

    let duration = started.elapsed();
    let finished_at = time::OffsetDateTime::now_utc();
    let avg_speed_bps = report.downloaded as f64 / duration.as_secs_f64().max(1e-6);
    let success = report.error.is_none();

    match &report.error {
      None => tracing::info!(
        url,
        bytes = report.downloaded,
        chunks = report.chunks_used,
        resumed = report.resumed,
        "download complete"
      ),
      Some(e) => tracing::warn!(url, error = %e, "download failed"),
    }

    DownloadStats {
      url: url.to_string(),
      filename: report.filename,
      total: report.total,
      downloaded: report.downloaded,
      started_at,
      finished_at,
      duration,
      avg_speed_bps,
      retries: report.retries,
      success,
      error: report.error,
      resumed: report.resumed,
      chunks_used: report.chunks_used,
    }
  }

  async fn run(&self, raw_url: &str, sink: Sink, cancel: &CancellationToken) -> RunReport {
    let retries = AtomicU32::new(0);

    let url = match Url::parse(raw_url) {
      Ok(url) => url,
      Err(e) => return RunReport::failed(DownloadError::InvalidInput(format!("invalid url: {e}"))),
    };
    if !matches!(url.scheme(), "http" | "https") {
      return RunReport::failed(DownloadError::InvalidInput(format!(
        "unsupported scheme: {}",
        url.scheme()
      )));
    }

    let single_stream_only = sink.is_stream();
    let dest = sink.path().map(|p| p.to_path_buf());

    // Workers, back-off sleeps and the watchdog all hang off this child
    // token, so a whole-download timeout or a first fatal error can stop the
    // run without touching the caller's token.
    let child = cancel.child_token();
    if let Some(deadline) = self.cfg.timeouts.whole_download {
      let token = child.clone();
      tokio::spawn(async move {
        tokio::select! {
          _ = token.cancelled() => {}
          _ = tokio::time::sleep(deadline) => {
            tracing::warn!("whole-download timeout elapsed, cancelling");
            token.cancel();
          }
        }
      });
    }

    let ctx = RetryContext {
      cancel: &child,
      retries: &retries,
    };
    let resource = match self
      .retry
      .execute(&ctx, || probe::probe(&self.client, &url, &self.cfg))
      .await
    {
      Ok(resource) => resource,
      Err(e) => {
        child.cancel();
        return RunReport::failed(e).with_retries(retries.load(Ordering::Relaxed));
      }
    };
    tracing::debug!(
      total = ?resource.total,
      ranges = resource.supports_ranges,
      final_url = %resource.final_url,
      "probe complete"
    );

    let filename = dest
      .as_ref()
      .and_then(|p| p.file_name())
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| resource.filename_hint.clone());
    let total = resource.total;

    // Cross-run resume needs a known size, range support and a real file.
    let resume_eligible = self.cfg.resume
      && !single_stream_only
      && dest.is_some()
      && total.is_some()
      && resource.supports_ranges;

    let mut prior = None;
    let mut sidecar_was_present = false;
    if self.cfg.resume && !single_stream_only {
      if let Some(dest) = &dest {
        if let Some(record) = resume::load(dest) {
          sidecar_was_present = true;
          if resume_eligible && record.matches(url.as_str(), total, &resource.validator) {
            prior = Some(record);
          } else {
            resume::discard(dest);
          }
        }
      }
    }

    let mut plan = plan::plan_with_chunk_size(
      &resource,
      &self.cfg,
      single_stream_only,
      prior.as_ref().map(|r| r.chunk_size),
    );
    let mut restored = 0u64;
    if let Some(record) = &prior {
      restored = resume::restore(record, &mut plan);
    }
    let resumed = restored > 0;
    let chunks_used = plan.chunks.len();
    let degree = plan.degree;
    tracing::info!(url = %url, chunks = chunks_used, degree, resumed, restored, "download planned");

    let manager = match (&dest, total) {
      (Some(dest), Some(total)) if resume_eligible => ResumeManager::new(
        dest,
        url.as_str(),
        total,
        resource.validator.clone(),
        plan.chunk_size.unwrap_or(total),
        prior.as_ref(),
      ),
      _ => ResumeManager::disabled(),
    };

    // A destination left behind by an interrupted run is fair game; a file
    // the engine knows nothing about needs the explicit overwrite flag.
    let allow_existing = resumed || sidecar_was_present;
    let writer = match SinkWriter::open(sink, total, allow_existing) {
      Ok(writer) => writer,
      Err(e) => {
        child.cancel();
        return RunReport {
          filename,
          total,
          downloaded: 0,
          retries: retries.load(Ordering::Relaxed),
          resumed,
          chunks_used,
          error: Some(e),
        };
      }
    };

    let tracker = Arc::new(ProgressTracker::new(total, restored));
    let reporter = self.cfg.progress.clone().map(|callback| {
      progress::spawn_reporter(
        tracker.clone(),
        callback,
        self.cfg.progress_interval,
        child.clone(),
      )
    });
    let limiter = RateLimiter::new(self.cfg.rate_limit_bps);

    let shared = Arc::new(Shared {
      cfg: self.cfg.clone(),
      client: self.client.clone(),
      resource,
      sink: writer,
      progress: tracker.clone(),
      limiter,
      retry: self.retry.clone(),
      retries,
      cancel: child.clone(),
      chunks: Mutex::new(plan.chunks),
      resume: manager,
      first_error: Mutex::new(None),
    });

    let outcome = pool::run(shared.clone(), degree).await;
    let downloaded = tracker.downloaded().saturating_sub(restored);

    let error = match outcome {
      Ok(()) => match shared.sink.finalize(tracker.downloaded(), total).await {
        Ok(()) => {
          shared.resume.finalize();
          None
        }
        Err(e) => Some(e),
      },
      Err(e) => {
        shared.sink.abort();
        Some(e)
      }
    };

    child.cancel();
    if let Some(handle) = reporter {
      let _ = handle.await;
    }

    RunReport {
      filename,
      total,
      downloaded,
      retries: shared.retries.load(Ordering::Relaxed),
      resumed,
      chunks_used,
      error,
    }
  }
}

struct RunReport {
  filename: String,
  total: Option<u64>,
  downloaded: u64,
  retries: u32,
  resumed: bool,
  chunks_used: usize,
  error: Option<DownloadError>,
}

impl RunReport {
  fn failed(error: DownloadError) -> RunReport {
    RunReport {
      filename: String::new(),
      total: None,
      downloaded: 0,
      retries: 0,
      resumed: false,
      chunks_used: 0,
      error: Some(error),
    }
  }

  fn with_retries(mut self, retries: u32) -> RunReport {
    self.retries = retries;
    self
  }
}
