use crate::config::{DownloadConfig, ResponseInfo};
use crate::error::DownloadError;
use crate::model::{RemoteResource, Validator};
use crate::naming;
use crate::transport;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::StatusCode;
use url::Url;

/// Preflight: learn size, range support, validator and final URL before any
/// byte is planned. HEAD first; servers that reject HEAD or withhold
/// Content-Length get a one-byte ranged GET instead.
pub async fn probe(
  client: &reqwest::Client,
  url: &Url,
  cfg: &DownloadConfig,
) -> Result<RemoteResource, DownloadError> {
  let mut headers = transport::request_headers(cfg)?;
  if let Some(hook) = &cfg.pre_request {
    hook(url, &mut headers);
  }

  let head = client
    .head(url.clone())
    .headers(headers.clone())
    .send()
    .await
    .map_err(|e| DownloadError::from_reqwest(&e))?;

  if let Some(hook) = &cfg.post_response {
    hook(&ResponseInfo {
      status: head.status().as_u16(),
      url: head.url().clone(),
    });
  }

  let status = head.status();
  let head_unsupported =
    status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED;

  if !status.is_success() && !head_unsupported {
    return Err(DownloadError::from_status(status, "probe (HEAD) failed"));
  }

  if status.is_success() {
    let resp_headers = head.headers();
    if let Some(total) = transport::content_length(resp_headers) {
      let supports_ranges = transport::accepts_byte_ranges(resp_headers);
      return Ok(build_resource(
        head.url().clone(),
        Some(total),
        supports_ranges,
        resp_headers,
      ));
    }
    // 2xx but no Content-Length: fall through to the ranged probe, which can
    // still reveal the size via Content-Range.
  }

  range_probe(client, url, cfg, headers).await
}

/// `GET` with `Range: bytes=0-0`. A 206 confirms range support and its
/// `Content-Range` carries the full size; a 200 means ranges are unsupported.
async fn range_probe(
  client: &reqwest::Client,
  url: &Url,
  cfg: &DownloadConfig,
  mut headers: HeaderMap,
) -> Result<RemoteResource, DownloadError> {
  headers.insert(RANGE, HeaderValue::from_static("bytes=0-0"));

  let resp = client
    .get(url.clone())
    .headers(headers)
    .send()
    .await
    .map_err(|e| DownloadError::from_reqwest(&e))?;

  if let Some(hook) = &cfg.post_response {
    hook(&ResponseInfo {
      status: resp.status().as_u16(),
      url: resp.url().clone(),
    });
  }

  let status = resp.status();
  if status == StatusCode::PARTIAL_CONTENT {
    let content_range = transport::header_str(resp.headers(), "content-range").ok_or_else(|| {
      DownloadError::NetworkFatal("206 response without Content-Range".to_string())
    })?;
    let parsed = transport::parse_content_range(content_range)?;
    return Ok(build_resource(
      resp.url().clone(),
      parsed.total,
      true,
      resp.headers(),
    ));
  }
  if status.is_success() {
    // Full-body response; the size may still be advertised.
    let total = transport::content_length(resp.headers());
    return Ok(build_resource(resp.url().clone(), total, false, resp.headers()));
  }
  Err(DownloadError::from_status(status, "probe (ranged GET) failed"))
}

fn build_resource(
  final_url: Url,
  total: Option<u64>,
  supports_ranges: bool,
  headers: &HeaderMap,
) -> RemoteResource {
  let content_type = transport::header_str(headers, "content-type").map(|s| s.to_string());
  let validator = validator_from_headers(headers);
  let filename_hint = naming::filename_hint(
    &final_url,
    transport::header_str(headers, "content-disposition"),
    content_type.as_deref(),
  );

  RemoteResource {
    total,
    supports_ranges,
    content_type,
    validator,
    final_url,
    filename_hint,
  }
}

pub(crate) fn validator_from_headers(headers: &HeaderMap) -> Validator {
  if let Some(etag) = transport::header_str(headers, "etag") {
    return Validator::Etag(etag.to_string());
  }
  if let Some(lm) = transport::header_str(headers, "last-modified") {
    return Validator::LastModified(lm.to_string());
  }
  Validator::None
}
