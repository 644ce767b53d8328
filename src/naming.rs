//! Filename hint derivation: Content-Disposition, URL path, MIME fallback.

use sanitize_filename::sanitize;
use url::Url;

const FALLBACK: &str = "download";

/// Best filename for a resource, in order of preference: the server's
/// Content-Disposition, the final URL's last path segment, a bare
/// `"download"` with a MIME-guessed extension.
pub(crate) fn filename_hint(
  url: &Url,
  content_disposition: Option<&str>,
  content_type: Option<&str>,
) -> String {
  if let Some(cd) = content_disposition {
    if let Some(name) = disposition_filename(cd) {
      let cleaned = sanitize(percent_decode(&name));
      if !cleaned.is_empty() {
        return cleaned;
      }
    }
  }

  if let Some(segment) = url
    .path_segments()
    .and_then(|mut s| s.next_back())
    .filter(|s| !s.is_empty())
  {
    let cleaned = sanitize(percent_decode(segment));
    if !cleaned.is_empty() && cleaned != "." {
      return cleaned;
    }
  }

  let mut name = FALLBACK.to_string();
  if let Some(ext) = content_type
    .and_then(|ct| mime_guess::get_mime_extensions_str(ct))
    .and_then(|exts| exts.first().copied())
  {
    name.push('.');
    name.push_str(ext);
  }
  name
}

/// Extracts the filename parameter from a Content-Disposition value.
/// `filename*=` (RFC 5987) wins over plain `filename=`.
fn disposition_filename(cd: &str) -> Option<String> {
  let cd = cd.trim();
  let lowered = cd.to_ascii_lowercase();

  if let Some(idx) = lowered.find("filename*=") {
    let raw = param_value(&cd[idx + "filename*=".len()..]);
    // RFC 5987: charset'lang'percent-encoded-value
    if let Some(pos) = raw.find("''") {
      let encoded = raw[pos + 2..].trim().trim_matches('"');
      if let Ok(decoded) = urlencoding::decode(encoded) {
        return Some(decoded.into_owned());
      }
    }
    let value = raw.trim().trim_matches('"');
    if !value.is_empty() {
      return Some(value.to_string());
    }
  }

  if let Some(idx) = lowered.find("filename=") {
    let value = param_value(&cd[idx + "filename=".len()..])
      .trim()
      .trim_matches('"')
      .to_string();
    if !value.is_empty() {
      return Some(value);
    }
  }

  None
}

/// The parameter value up to the next unquoted `;`, so a `filename*=` value
/// never swallows a following `filename=` parameter.
fn param_value(s: &str) -> &str {
  let s = s.trim_start();
  let mut in_quotes = false;
  let mut escaped = false;
  for (i, ch) in s.char_indices() {
    if escaped {
      escaped = false;
      continue;
    }
    match ch {
      '\\' if in_quotes => escaped = true,
      '"' => in_quotes = !in_quotes,
      ';' if !in_quotes => return s[..i].trim(),
      _ => {}
    }
  }
  s.trim()
}

/// Percent-decodes path segments and disposition values; some servers escape
/// even plain `filename=`.
fn percent_decode(s: &str) -> String {
  match urlencoding::decode(s) {
    Ok(v) => v.into_owned(),
    Err(_) => s.replace("%20", " "),
  }
}
