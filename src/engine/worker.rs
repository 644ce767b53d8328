use crate::config::ResponseInfo;
use crate::engine::plan::Chunk;
use crate::engine::Shared;
use crate::error::DownloadError;
use crate::probe::validator_from_headers;
use crate::transport;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::StatusCode;
use std::sync::atomic::Ordering;

/// Fetches one chunk, retrying transient failures in place. On a mid-chunk
/// failure with bytes already written, the interval shrinks to the unwritten
/// suffix before the next attempt, so retries never refetch delivered bytes.
///
/// Returns the number of bytes durably written from the chunk's original
/// start alongside any terminal error, so the dispatcher can persist the
/// prefix for cross-run resume.
pub(crate) async fn run_chunk(shared: &Shared, chunk: &Chunk) -> Result<(), (u64, DownloadError)> {
  let original_start = chunk.start;
  let mut start = chunk.start;
  let end = chunk.end;
  // Range requests only make sense when the server honours them; a bounded
  // chunk against a range-blind server is the whole-body single stream.
  let ranged = shared.resource.supports_ranges && end.is_some();

  if let Some(end) = end {
    if start >= end {
      return Ok(());
    }
  }

  let mut attempt = 0u32;
  loop {
    if shared.cancel.is_cancelled() {
      return Err((start - original_start, DownloadError::Cancelled));
    }

    match fetch_once(shared, start, end, ranged).await {
      Ok(()) => return Ok(()),
      Err((transferred, err)) => {
        if ranged {
          start += transferred;
        }
        let done = start - original_start;

        if matches!(err, DownloadError::Cancelled) {
          return Err((done, DownloadError::Cancelled));
        }

        // Without range support a partially consumed body cannot be resumed
        // from an offset; re-requesting would duplicate bytes in the sink.
        let resumable = ranged || transferred == 0;
        if !resumable || !shared.retry.should_retry(&err, attempt) {
          return Err((done, err));
        }

        shared.retries.fetch_add(1, Ordering::Relaxed);
        let delay = shared.retry.next_delay(attempt);
        tracing::warn!(
          chunk = chunk.index,
          offset = start,
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "chunk attempt failed, backing off"
        );
        tokio::select! {
          _ = shared.cancel.cancelled() => return Err((done, DownloadError::Cancelled)),
          _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
      }
    }
  }
}

/// One GET attempt for `[start, end)`. The error side carries how many bytes
/// of this attempt landed in the sink.
async fn fetch_once(
  shared: &Shared,
  start: u64,
  end: Option<u64>,
  ranged: bool,
) -> Result<(), (u64, DownloadError)> {
  let cfg = &shared.cfg;
  let url = &shared.resource.final_url;

  let mut headers = transport::request_headers(cfg).map_err(|e| (0, e))?;
  if ranged {
    let value = transport::format_range(start, end);
    headers.insert(
      RANGE,
      HeaderValue::from_str(&value)
        .map_err(|_| (0, DownloadError::InvalidInput(format!("invalid range: {value}"))))?,
    );
  }
  if let Some(hook) = &cfg.pre_request {
    hook(url, &mut headers);
  }

  let resp = shared
    .client
    .get(url.clone())
    .headers(headers)
    .send()
    .await
    .map_err(|e| (0, DownloadError::from_reqwest(&e)))?;

  if let Some(hook) = &cfg.post_response {
    hook(&ResponseInfo {
      status: resp.status().as_u16(),
      url: resp.url().clone(),
    });
  }

  let status = resp.status();
  if ranged {
    if status == StatusCode::RANGE_NOT_SATISFIABLE {
      return Err((
        0,
        DownloadError::RangeNotSatisfiable(format!("server rejected {}", transport::format_range(start, end))),
      ));
    }
    if status != StatusCode::PARTIAL_CONTENT {
      if !status.is_success() {
        return Err((0, DownloadError::from_status(status, "ranged GET failed")));
      }
      // A 200 means the server ignored the Range header; its bytes would land
      // at the wrong offsets.
      return Err((
        0,
        DownloadError::RangeNotSatisfiable("server ignored range request".to_string()),
      ));
    }
    let content_range = transport::header_str(resp.headers(), "content-range")
      .ok_or_else(|| {
        (
          0,
          DownloadError::NetworkFatal("206 response without Content-Range".to_string()),
        )
      })?;
    let parsed = transport::parse_content_range(content_range).map_err(|e| (0, e))?;
    if parsed.start != start {
      return Err((
        0,
        DownloadError::NetworkFatal(format!(
          "server answered range from offset {}, requested {start}",
          parsed.start
        )),
      ));
    }
  } else if !status.is_success() {
    return Err((0, DownloadError::from_status(status, "GET failed")));
  }

  // A shifted validator here means the bytes would not belong to the probed
  // version of the resource.
  if !shared.resource.validator.is_none() {
    let seen = validator_from_headers(resp.headers());
    if !seen.is_none() && seen != shared.resource.validator {
      return Err((
        0,
        DownloadError::ResourceChanged(format!(
          "validator changed from {:?} to {:?}",
          shared.resource.validator, seen
        )),
      ));
    }
  }

  let expected = end.map(|e| e - start);
  let mut transferred = 0u64;
  let mut offset = start;
  let mut stream = resp.bytes_stream();

  loop {
    let frame: bytes::Bytes = tokio::select! {
      _ = shared.cancel.cancelled() => return Err((transferred, DownloadError::Cancelled)),
      next = tokio::time::timeout(cfg.timeouts.idle_read, stream.next()) => match next {
        Err(_) => {
          return Err((
            transferred,
            DownloadError::NetworkTransient("no body bytes before idle-read timeout".to_string()),
          ))
        }
        Ok(None) => break,
        Ok(Some(Err(e))) => return Err((transferred, DownloadError::from_reqwest(&e))),
        Ok(Some(Ok(frame))) => frame,
      }
    };

    if frame.is_empty() {
      continue;
    }
    if let Some(expected) = expected {
      if transferred + frame.len() as u64 > expected {
        return Err((
          transferred,
          DownloadError::NetworkFatal("server sent more bytes than requested".to_string()),
        ));
      }
    }

    tokio::select! {
      _ = shared.cancel.cancelled() => return Err((transferred, DownloadError::Cancelled)),
      _ = shared.limiter.acquire(frame.len()) => {}
    }

    shared
      .sink
      .write_at(offset, &frame)
      .await
      .map_err(|e| (transferred, e))?;
    shared.progress.add(frame.len() as u64);
    if let Some(hook) = &cfg.on_chunk_written {
      hook(offset, frame.len());
    }
    offset += frame.len() as u64;
    transferred += frame.len() as u64;
  }

  if let Some(expected) = expected {
    if transferred < expected {
      return Err((
        transferred,
        DownloadError::NetworkTransient(format!(
          "body ended after {transferred} of {expected} bytes"
        )),
      ));
    }
  }

  Ok(())
}
