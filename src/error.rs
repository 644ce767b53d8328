use std::error::Error as StdError;
use std::io;

/// Error taxonomy surfaced by the engine.
///
/// Retriability is decided by [`DownloadError::is_retriable`] alone; the retry
/// controller, the dispatcher and the stats reporting all key off the variant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Timeouts, connection refused/reset/aborted, DNS timeouts.
  #[error("transient network failure: {0}")]
  NetworkTransient(String),

  /// DNS resolution failures, TLS trust failures.
  #[error("network failure: {0}")]
  NetworkFatal(String),

  /// 4xx other than 408/429.
  #[error("http {status}: {message}")]
  HttpClient { status: u16, message: String },

  /// 5xx plus 408/429; retried up to the configured budget.
  #[error("http {status}: {message}")]
  HttpServer { status: u16, message: String },

  /// Validator mismatch while a download is in flight.
  #[error("remote resource changed: {0}")]
  ResourceChanged(String),

  /// 416 that resume progress cannot explain, or a server ignoring ranges.
  #[error("range not satisfiable: {0}")]
  RangeNotSatisfiable(String),

  #[error("no space left on device: {0}")]
  StorageSpace(String),

  #[error("storage permission denied: {0}")]
  StoragePermission(String),

  #[error("storage i/o failure: {0}")]
  StorageIo(String),

  #[error("cancelled")]
  Cancelled,

  /// Bytes on disk disagree with the expected length at finalise.
  #[error("corrupted download: {0}")]
  Corrupted(String),
}

impl DownloadError {
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      DownloadError::NetworkTransient(_) | DownloadError::HttpServer { .. }
    )
  }

  pub(crate) fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
    let code = status.as_u16();
    if status.is_server_error() || code == 408 || code == 429 {
      DownloadError::HttpServer {
        status: code,
        message: context.to_string(),
      }
    } else {
      DownloadError::HttpClient {
        status: code,
        message: context.to_string(),
      }
    }
  }

  pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
    if err.is_timeout() {
      return DownloadError::NetworkTransient(err.to_string());
    }

    if err.is_connect() {
      // Refused/reset/aborted connections are worth another attempt; failed
      // name resolution and certificate trust are not.
      if let Some(io) = io_cause(err) {
        return match io.kind() {
          io::ErrorKind::ConnectionRefused
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::TimedOut => DownloadError::NetworkTransient(err.to_string()),
          _ => classify_connect_message(err),
        };
      }
      return classify_connect_message(err);
    }

    if err.is_body() || err.is_decode() {
      // The connection died mid-stream.
      return DownloadError::NetworkTransient(err.to_string());
    }

    if err.is_builder() {
      return DownloadError::InvalidInput(err.to_string());
    }

    DownloadError::NetworkFatal(err.to_string())
  }

  pub(crate) fn from_io(err: &io::Error) -> Self {
    if err.kind() == io::ErrorKind::PermissionDenied {
      return DownloadError::StoragePermission(err.to_string());
    }
    if let Some(code) = err.raw_os_error() {
      if is_out_of_space(code) {
        return DownloadError::StorageSpace(err.to_string());
      }
      #[cfg(unix)]
      if code == 30 {
        // EROFS
        return DownloadError::StoragePermission(err.to_string());
      }
    }
    DownloadError::StorageIo(err.to_string())
  }
}

fn classify_connect_message(err: &reqwest::Error) -> DownloadError {
  let msg = err.to_string();
  let lowered = msg.to_ascii_lowercase();
  if lowered.contains("dns") || lowered.contains("lookup") {
    return DownloadError::NetworkFatal(msg);
  }
  if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
    return DownloadError::NetworkFatal(msg);
  }
  DownloadError::NetworkTransient(msg)
}

fn io_cause(err: &reqwest::Error) -> Option<&io::Error> {
  let mut source: Option<&(dyn StdError + 'static)> = err.source();
  while let Some(e) = source {
    if let Some(io) = e.downcast_ref::<io::Error>() {
      return Some(io);
    }
    source = e.source();
  }
  None
}

#[cfg(unix)]
fn is_out_of_space(code: i32) -> bool {
  // ENOSPC, EDQUOT (linux)
  code == 28 || code == 122
}

#[cfg(windows)]
fn is_out_of_space(code: i32) -> bool {
  // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
  code == 112 || code == 39
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_errors_and_throttling_are_retriable() {
    for code in [500u16, 502, 503, 504, 507, 408, 429] {
      let err = DownloadError::from_status(reqwest::StatusCode::from_u16(code).unwrap(), "x");
      assert!(err.is_retriable(), "expected {code} to be retriable");
      assert!(matches!(err, DownloadError::HttpServer { .. }));
    }
  }

  #[test]
  fn client_errors_are_fatal() {
    for code in [400u16, 401, 403, 404, 410] {
      let err = DownloadError::from_status(reqwest::StatusCode::from_u16(code).unwrap(), "x");
      assert!(!err.is_retriable(), "expected {code} to be fatal");
      assert!(matches!(err, DownloadError::HttpClient { .. }));
    }
  }

  #[test]
  fn storage_errors_map_by_kind() {
    let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
    assert!(matches!(
      DownloadError::from_io(&denied),
      DownloadError::StoragePermission(_)
    ));

    #[cfg(unix)]
    {
      let full = io::Error::from_raw_os_error(28);
      assert!(matches!(
        DownloadError::from_io(&full),
        DownloadError::StorageSpace(_)
      ));
    }

    let other = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
    assert!(matches!(
      DownloadError::from_io(&other),
      DownloadError::StorageIo(_)
    ));
  }

  #[test]
  fn cancellation_is_not_retriable() {
    assert!(!DownloadError::Cancelled.is_retriable());
  }
}
