//! Transport layer: HTTP client construction and strict range-header parsing.

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect;

pub(crate) fn build_client(cfg: &DownloadConfig) -> Result<reqwest::Client, DownloadError> {
  let mut builder = reqwest::Client::builder()
    .user_agent(cfg.user_agent.clone())
    .redirect(redirect_policy(cfg))
    .connect_timeout(cfg.timeouts.connect)
    .read_timeout(cfg.timeouts.read);

  if cfg.insecure_tls {
    builder = builder.danger_accept_invalid_certs(true);
  }
  if let Some(proxy_url) = &cfg.proxy {
    let proxy = reqwest::Proxy::all(proxy_url)
      .map_err(|e| DownloadError::InvalidInput(format!("invalid proxy url: {e}")))?;
    builder = builder.proxy(proxy);
  }

  builder
    .build()
    .map_err(|e| DownloadError::InvalidInput(format!("failed to build http client: {e}")))
}

fn redirect_policy(cfg: &DownloadConfig) -> redirect::Policy {
  if !cfg.follow_redirects {
    return redirect::Policy::none();
  }
  let max = cfg.max_redirects;
  let insecure = cfg.insecure_tls;
  redirect::Policy::custom(move |attempt| {
    if attempt.previous().len() > max {
      return attempt.error("too many redirects");
    }
    // Scheme downgrades are only followed when the caller opted out of
    // transport security checks.
    if !insecure {
      let from_https = attempt
        .previous()
        .last()
        .map(|u| u.scheme() == "https")
        .unwrap_or(false);
      if from_https && attempt.url().scheme() != "https" {
        return attempt.error("refusing redirect from https to http");
      }
    }
    attempt.follow()
  })
}

/// Builds the per-request header map from the configured extra headers.
pub(crate) fn request_headers(cfg: &DownloadConfig) -> Result<HeaderMap, DownloadError> {
  let mut headers = HeaderMap::with_capacity(cfg.headers.len());
  for (name, value) in &cfg.headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|_| DownloadError::InvalidInput(format!("invalid header name: {name}")))?;
    let value = HeaderValue::from_str(value)
      .map_err(|_| DownloadError::InvalidInput(format!("invalid value for header {name}")))?;
    headers.insert(name, value);
  }
  Ok(headers)
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
  header_str(headers, "accept-ranges")
    .map(|v| v.to_ascii_lowercase().contains("bytes"))
    .unwrap_or(false)
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
  header_str(headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok())
}

/// Inclusive wire form of a half-open interval: `bytes=start-` or
/// `bytes=start-(end-1)`.
pub(crate) fn format_range(start: u64, end: Option<u64>) -> String {
  match end {
    Some(end) => format!("bytes={start}-{}", end - 1),
    None => format!("bytes={start}-"),
  }
}

/// Parsed `Content-Range: bytes S-E/T` response header. `S`/`E` are the
/// server's inclusive bounds; `total` is `None` for `/*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
  pub start: u64,
  pub end_inclusive: u64,
  pub total: Option<u64>,
}

/// Strict parse. Malformed input is a protocol error, never a silent zero.
pub(crate) fn parse_content_range(value: &str) -> Result<ContentRange, DownloadError> {
  let malformed = || DownloadError::NetworkFatal(format!("malformed Content-Range: {value:?}"));

  let rest = value.trim().strip_prefix("bytes").ok_or_else(malformed)?;
  let rest = rest.trim_start();
  let (range_part, total_part) = rest.split_once('/').ok_or_else(malformed)?;

  let total = match total_part.trim() {
    "*" => None,
    t => Some(t.parse::<u64>().map_err(|_| malformed())?),
  };

  // "*/T" (as in a 416) carries no byte interval.
  let (start_part, end_part) = range_part.trim().split_once('-').ok_or_else(malformed)?;
  let start = start_part.trim().parse::<u64>().map_err(|_| malformed())?;
  let end_inclusive = end_part.trim().parse::<u64>().map_err(|_| malformed())?;

  if end_inclusive < start {
    return Err(malformed());
  }
  if let Some(total) = total {
    if end_inclusive >= total {
      return Err(malformed());
    }
  }

  Ok(ContentRange {
    start,
    end_inclusive,
    total,
  })
}
