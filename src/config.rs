use crate::error::DownloadError;
use crate::model::ProgressSnapshot;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const HARD_CONCURRENCY_CAP: usize = 16;
pub const MIN_CHUNK_SIZE: u64 = 32 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodic progress callback.
pub type ProgressCallback = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;
/// Invoked before each request is sent; may adjust the outgoing headers.
pub type PreRequestHook = Arc<dyn Fn(&Url, &mut HeaderMap) + Send + Sync>;
/// Invoked after each response's headers arrive.
pub type PostResponseHook = Arc<dyn Fn(&ResponseInfo) + Send + Sync>;
/// Invoked after each buffer lands in the sink: (offset, length).
pub type ChunkWrittenHook = Arc<dyn Fn(u64, usize) + Send + Sync>;

/// Headers-only view of a response, handed to [`PostResponseHook`].
#[derive(Debug, Clone)]
pub struct ResponseInfo {
  pub status: u16,
  pub url: Url,
}

/// Retry parameters consumed by the retry controller.
///
/// Profiles are constant values; they differ only in parameters, never in
/// algorithm.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub backoff_factor: f64,
  pub jitter: bool,
}

impl RetryConfig {
  pub const DEFAULT: RetryConfig = RetryConfig {
    max_retries: 3,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(30),
    backoff_factor: 2.0,
    jitter: true,
  };

  pub const NETWORK: RetryConfig = RetryConfig {
    max_retries: 5,
    base_delay: Duration::from_millis(250),
    max_delay: Duration::from_secs(60),
    backoff_factor: 2.0,
    jitter: true,
  };

  pub const FILE_SYSTEM: RetryConfig = RetryConfig {
    max_retries: 2,
    base_delay: Duration::from_millis(100),
    max_delay: Duration::from_secs(2),
    backoff_factor: 2.0,
    jitter: false,
  };

  pub const AGGRESSIVE: RetryConfig = RetryConfig {
    max_retries: 10,
    base_delay: Duration::from_millis(100),
    max_delay: Duration::from_secs(10),
    backoff_factor: 1.5,
    jitter: true,
  };

  pub const CONSERVATIVE: RetryConfig = RetryConfig {
    max_retries: 2,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(120),
    backoff_factor: 3.0,
    jitter: true,
  };

  pub fn validate(&self) -> Result<(), DownloadError> {
    if self.base_delay.is_zero() {
      return Err(DownloadError::InvalidInput(
        "retry.base_delay must be positive".to_string(),
      ));
    }
    if self.max_delay < self.base_delay {
      return Err(DownloadError::InvalidInput(
        "retry.max_delay must be >= retry.base_delay".to_string(),
      ));
    }
    if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
      return Err(DownloadError::InvalidInput(
        "retry.backoff_factor must be >= 1".to_string(),
      ));
    }
    Ok(())
  }
}

impl Default for RetryConfig {
  fn default() -> Self {
    RetryConfig::DEFAULT
  }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Timeouts {
  pub connect: Duration,
  pub read: Duration,
  /// No body bytes for this long inside a chunk counts as a transient failure.
  pub idle_read: Duration,
  /// Hard deadline for the whole download; expiry surfaces as `Cancelled`.
  pub whole_download: Option<Duration>,
}

impl Default for Timeouts {
  fn default() -> Self {
    Timeouts {
      connect: Duration::from_secs(15),
      read: Duration::from_secs(60),
      idle_read: Duration::from_secs(30),
      whole_download: None,
    }
  }
}

impl Timeouts {
  pub fn validate(&self) -> Result<(), DownloadError> {
    let named = [
      ("timeouts.connect", Some(self.connect)),
      ("timeouts.read", Some(self.read)),
      ("timeouts.idle_read", Some(self.idle_read)),
      ("timeouts.whole_download", self.whole_download),
    ];
    for (name, value) in named {
      let Some(value) = value else { continue };
      if value.is_zero() {
        return Err(DownloadError::InvalidInput(format!("{name} must be positive")));
      }
      if value > MAX_TIMEOUT {
        return Err(DownloadError::InvalidInput(format!("{name} must be <= 24h")));
      }
    }
    Ok(())
  }
}

/// Engine configuration. One value per download engine; cloning is cheap
/// (callbacks are behind `Arc`).
#[derive(Clone)]
pub struct DownloadConfig {
  /// Upper bound on parallel chunk workers. 0 means the default of 4.
  pub max_concurrency: usize,
  /// Requested chunk size in bytes. 0 means the 32 KiB minimum; the planner
  /// raises it as needed so chunk count stays near the concurrency degree.
  pub chunk_size: u64,
  pub resume: bool,
  pub retry: RetryConfig,
  pub timeouts: Timeouts,
  pub user_agent: String,
  /// Extra request headers, single-valued.
  pub headers: HashMap<String, String>,
  pub follow_redirects: bool,
  pub max_redirects: usize,
  pub insecure_tls: bool,
  /// Optional proxy URL applied to every request.
  pub proxy: Option<String>,
  /// Global byte-per-second budget shared by all workers. <= 0 disables it.
  pub rate_limit_bps: i64,
  pub progress: Option<ProgressCallback>,
  pub progress_interval: Duration,
  pub pre_request: Option<PreRequestHook>,
  pub post_response: Option<PostResponseHook>,
  pub on_chunk_written: Option<ChunkWrittenHook>,
}

impl Default for DownloadConfig {
  fn default() -> Self {
    DownloadConfig {
      max_concurrency: DEFAULT_CONCURRENCY,
      chunk_size: 0,
      resume: true,
      retry: RetryConfig::DEFAULT,
      timeouts: Timeouts::default(),
      user_agent: concat!("gdl/", env!("CARGO_PKG_VERSION")).to_string(),
      headers: HashMap::new(),
      follow_redirects: true,
      max_redirects: 10,
      insecure_tls: false,
      proxy: None,
      rate_limit_bps: 0,
      progress: None,
      progress_interval: Duration::from_millis(100),
      pre_request: None,
      post_response: None,
      on_chunk_written: None,
    }
  }
}

impl std::fmt::Debug for DownloadConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DownloadConfig")
      .field("max_concurrency", &self.max_concurrency)
      .field("chunk_size", &self.chunk_size)
      .field("resume", &self.resume)
      .field("retry", &self.retry)
      .field("timeouts", &self.timeouts)
      .field("user_agent", &self.user_agent)
      .field("headers", &self.headers)
      .field("follow_redirects", &self.follow_redirects)
      .field("max_redirects", &self.max_redirects)
      .field("insecure_tls", &self.insecure_tls)
      .field("proxy", &self.proxy)
      .field("rate_limit_bps", &self.rate_limit_bps)
      .field("progress", &self.progress.is_some())
      .field("progress_interval", &self.progress_interval)
      .field("pre_request", &self.pre_request.is_some())
      .field("post_response", &self.post_response.is_some())
      .field("on_chunk_written", &self.on_chunk_written.is_some())
      .finish()
  }
}

impl DownloadConfig {
  pub fn validate(&self) -> Result<(), DownloadError> {
    if self.chunk_size != 0 && !(1024..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
      return Err(DownloadError::InvalidInput(
        "chunk_size must be between 1 KiB and 100 MiB".to_string(),
      ));
    }
    if self.progress_interval.is_zero() {
      return Err(DownloadError::InvalidInput(
        "progress_interval must be positive".to_string(),
      ));
    }
    self.retry.validate()?;
    self.timeouts.validate()?;
    Ok(())
  }

  pub(crate) fn effective_concurrency(&self) -> usize {
    let requested = if self.max_concurrency == 0 {
      DEFAULT_CONCURRENCY
    } else {
      self.max_concurrency
    };
    requested.min(HARD_CONCURRENCY_CAP)
  }

  pub(crate) fn effective_chunk_size(&self) -> u64 {
    if self.chunk_size == 0 {
      MIN_CHUNK_SIZE
    } else {
      self.chunk_size
    }
  }
}
