use crate::error::DownloadError;
use std::time::Duration;
use url::Url;

/// Server-provided identity token for a resource version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Validator {
  Etag(String),
  LastModified(String),
  None,
}

impl Validator {
  pub fn is_none(&self) -> bool {
    matches!(self, Validator::None)
  }
}

/// Probe result. Immutable once built.
#[derive(Debug, Clone)]
pub struct RemoteResource {
  /// Total byte length, when the server reports one.
  pub total: Option<u64>,
  /// Whether the server acknowledged byte ranges (`Accept-Ranges` or a 206).
  pub supports_ranges: bool,
  pub content_type: Option<String>,
  pub validator: Validator,
  /// URL after following redirects.
  pub final_url: Url,
  /// Filename derived from Content-Disposition, the URL path, or "download".
  pub filename_hint: String,
}

/// Point-in-time progress, handed to the progress callback.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
  pub total: Option<u64>,
  /// Bytes present for this download, including bytes restored from a resume.
  pub downloaded: u64,
  /// Smoothed instantaneous speed in bytes per second.
  pub speed_bps: f64,
  pub elapsed: Duration,
  pub eta: Option<Duration>,
}

/// Terminal summary of one download run.
#[derive(Debug, Clone)]
pub struct DownloadStats {
  pub url: String,
  pub filename: String,
  pub total: Option<u64>,
  /// Bytes fetched over the network during this run (resumed bytes excluded).
  pub downloaded: u64,
  pub started_at: time::OffsetDateTime,
  pub finished_at: time::OffsetDateTime,
  pub duration: Duration,
  pub avg_speed_bps: f64,
  /// Retry attempts made across the probe and all chunks.
  pub retries: u32,
  pub success: bool,
  pub error: Option<DownloadError>,
  pub resumed: bool,
  pub chunks_used: usize,
}

impl DownloadStats {
  /// Convenience view for callers that prefer `Result`.
  pub fn into_result(self) -> Result<DownloadStats, DownloadError> {
    if self.success {
      Ok(self)
    } else {
      Err(self.error.clone().unwrap_or(DownloadError::StorageIo(
        "download failed without a recorded error".to_string(),
      )))
    }
  }
}
