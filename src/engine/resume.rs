use crate::engine::plan::{ChunkState, Plan};
use crate::error::DownloadError;
use crate::model::Validator;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

const SIDECAR_SUFFIX: &str = "gdlresume";
const RECORD_VERSION: u32 = 1;

/// Sidecar document persisted next to the destination. Completed intervals
/// are half-open, sorted, and pairwise disjoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct ResumeRecord {
  pub version: u32,
  pub url: String,
  pub total: u64,
  pub validator: Validator,
  pub chunk_size: u64,
  pub completed: Vec<(u64, u64)>,
  pub created_at: String,
}

impl ResumeRecord {
  pub fn matches(&self, url: &str, total: Option<u64>, validator: &Validator) -> bool {
    self.version == RECORD_VERSION
      && self.url == url
      && Some(self.total) == total
      && self.validator == *validator
  }

  /// Bytes of `[start, end)` already present according to this record.
  fn covered_prefix(&self, start: u64, end: u64) -> u64 {
    let mut cursor = start;
    for &(s, e) in &self.completed {
      if s > cursor {
        break;
      }
      if e > cursor {
        cursor = e.min(end);
        if cursor == end {
          break;
        }
      }
    }
    cursor - start
  }
}

pub(crate) fn sidecar_path(dest: &Path) -> PathBuf {
  let mut name = dest.as_os_str().to_os_string();
  name.push(".");
  name.push(SIDECAR_SUFFIX);
  PathBuf::from(name)
}

/// Reads and parses the sidecar for `dest`. A missing file, a truncated or
/// otherwise unparsable document, and an unknown version all count as absent.
pub(crate) fn load(dest: &Path) -> Option<ResumeRecord> {
  let raw = std::fs::read(sidecar_path(dest)).ok()?;
  let record: ResumeRecord = serde_json::from_slice(&raw).ok()?;
  if record.version != RECORD_VERSION {
    return None;
  }
  Some(record)
}

pub(crate) fn discard(dest: &Path) {
  let path = sidecar_path(dest);
  if std::fs::remove_file(&path).is_ok() {
    tracing::info!(sidecar = %path.display(), "discarded stale resume sidecar");
  }
}

/// Applies a matching record to a freshly planned chunk list: fully covered
/// chunks flip to Completed, a covered prefix advances the chunk start.
/// Returns the number of bytes restored.
pub(crate) fn restore(record: &ResumeRecord, plan: &mut Plan) -> u64 {
  let mut restored = 0u64;
  for chunk in &mut plan.chunks {
    let Some(end) = chunk.end else { continue };
    let covered = record.covered_prefix(chunk.start, end);
    if covered == 0 {
      continue;
    }
    restored += covered;
    if chunk.start + covered == end {
      chunk.state = ChunkState::Completed;
    } else {
      chunk.start += covered;
    }
  }
  restored
}

/// Serialises completion writes and keeps the on-disk sidecar consistent via
/// temp-file + rename. Inert for stream sinks and when resume is disabled.
pub(crate) struct ResumeManager {
  inner: Option<Mutex<ManagerInner>>,
}

struct ManagerInner {
  path: PathBuf,
  record: ResumeRecord,
}

impl ResumeManager {
  pub fn disabled() -> Self {
    ResumeManager { inner: None }
  }

  pub fn new(
    dest: &Path,
    url: &str,
    total: u64,
    validator: Validator,
    chunk_size: u64,
    prior: Option<&ResumeRecord>,
  ) -> Self {
    let record = ResumeRecord {
      version: RECORD_VERSION,
      url: url.to_string(),
      total,
      validator,
      chunk_size,
      completed: prior.map(|r| r.completed.clone()).unwrap_or_default(),
      created_at: prior.map(|r| r.created_at.clone()).unwrap_or_else(now_rfc3339),
    };
    ResumeManager {
      inner: Some(Mutex::new(ManagerInner {
        path: sidecar_path(dest),
        record,
      })),
    }
  }

  /// Records `[start, end)` as durably written and persists the sidecar.
  pub fn mark_completed(&self, start: u64, end: u64) -> Result<(), DownloadError> {
    let Some(inner) = &self.inner else {
      return Ok(());
    };
    if end <= start {
      return Ok(());
    }
    let mut guard = inner.lock();
    insert_interval(&mut guard.record.completed, start, end);
    persist(&guard.path, &guard.record)
  }

  /// Removes the sidecar after a fully successful download.
  pub fn finalize(&self) {
    let Some(inner) = &self.inner else { return };
    let guard = inner.lock();
    let _ = std::fs::remove_file(&guard.path);
  }
}

fn insert_interval(intervals: &mut Vec<(u64, u64)>, start: u64, end: u64) {
  intervals.push((start, end));
  intervals.sort_unstable_by_key(|&(s, _)| s);
  // Coalesce adjacent or overlapping intervals.
  let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
  for &(s, e) in intervals.iter() {
    match merged.last_mut() {
      Some((_, last_end)) if s <= *last_end => *last_end = (*last_end).max(e),
      _ => merged.push((s, e)),
    }
  }
  *intervals = merged;
}

fn persist(path: &Path, record: &ResumeRecord) -> Result<(), DownloadError> {
  let body = serde_json::to_vec(record)
    .map_err(|e| DownloadError::StorageIo(format!("failed to encode resume sidecar: {e}")))?;

  let tmp = path.with_extension(format!("{SIDECAR_SUFFIX}.tmp"));
  std::fs::write(&tmp, &body).map_err(|e| DownloadError::from_io(&e))?;
  std::fs::rename(&tmp, path).map_err(|e| DownloadError::from_io(&e))
}

fn now_rfc3339() -> String {
  time::OffsetDateTime::now_utc()
    .format(&time::format_description::well_known::Rfc3339)
    .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DownloadConfig;
  use crate::engine::plan;
  use crate::model::RemoteResource;
  use url::Url;

  fn record(completed: Vec<(u64, u64)>) -> ResumeRecord {
    ResumeRecord {
      version: RECORD_VERSION,
      url: "https://example.com/file.bin".to_string(),
      total: 10_240,
      validator: Validator::Etag("\"v1\"".to_string()),
      chunk_size: 2_560,
      completed,
      created_at: now_rfc3339(),
    }
  }

  fn test_plan() -> Plan {
    let resource = RemoteResource {
      total: Some(10_240),
      supports_ranges: true,
      content_type: None,
      validator: Validator::Etag("\"v1\"".to_string()),
      final_url: Url::parse("https://example.com/file.bin").unwrap(),
      filename_hint: "file.bin".to_string(),
    };
    let cfg = DownloadConfig {
      max_concurrency: 4,
      chunk_size: 2_048,
      ..Default::default()
    };
    plan::plan(&resource, &cfg, false)
  }

  #[test]
  fn matches_requires_url_total_and_validator() {
    let rec = record(vec![]);
    let v = Validator::Etag("\"v1\"".to_string());
    assert!(rec.matches("https://example.com/file.bin", Some(10_240), &v));
    assert!(!rec.matches("https://example.com/other", Some(10_240), &v));
    assert!(!rec.matches("https://example.com/file.bin", Some(999), &v));
    assert!(!rec.matches("https://example.com/file.bin", None, &v));
    assert!(!rec.matches(
      "https://example.com/file.bin",
      Some(10_240),
      &Validator::Etag("\"v2\"".to_string())
    ));
  }

  #[test]
  fn restore_completes_covered_chunks_and_shrinks_prefixes() {
    let mut plan = test_plan();
    let first_end = plan.chunks[0].end.unwrap();
    let second_end = plan.chunks[1].end.unwrap();

    // First chunk fully done, second chunk half done.
    let half = plan.chunks[1].start + (second_end - plan.chunks[1].start) / 2;
    let rec = record(vec![(0, first_end), (plan.chunks[1].start, half)]);

    let restored = restore(&rec, &mut plan);
    assert_eq!(restored, first_end + (half - plan.chunks[1].start));
    assert_eq!(plan.chunks[0].state, ChunkState::Completed);
    assert_eq!(plan.chunks[1].state, ChunkState::Pending);
    assert_eq!(plan.chunks[1].start, half);
    assert_eq!(plan.chunks[2].state, ChunkState::Pending);
  }

  #[test]
  fn interval_insertion_keeps_disjoint_sorted_intervals() {
    let mut intervals = Vec::new();
    insert_interval(&mut intervals, 2_048, 4_096);
    insert_interval(&mut intervals, 0, 2_048);
    insert_interval(&mut intervals, 8_192, 10_240);
    assert_eq!(intervals, vec![(0, 4_096), (8_192, 10_240)]);
  }

  #[test]
  fn sidecar_roundtrip_and_discard() {
    let dir = std::env::temp_dir().join("gdl-resume-test");
    std::fs::create_dir_all(&dir).unwrap();
    let dest = dir.join("payload.bin");
    let _ = std::fs::remove_file(sidecar_path(&dest));

    let mgr = ResumeManager::new(
      &dest,
      "https://example.com/file.bin",
      10_240,
      Validator::Etag("\"v1\"".to_string()),
      2_560,
      None,
    );
    mgr.mark_completed(0, 2_560).unwrap();
    mgr.mark_completed(5_120, 7_680).unwrap();

    let loaded = load(&dest).expect("sidecar should parse");
    assert_eq!(loaded.completed, vec![(0, 2_560), (5_120, 7_680)]);
    assert_eq!(loaded.total, 10_240);

    discard(&dest);
    assert!(load(&dest).is_none());
  }

  #[test]
  fn truncated_sidecar_reads_as_absent() {
    let dir = std::env::temp_dir().join("gdl-resume-test");
    std::fs::create_dir_all(&dir).unwrap();
    let dest = dir.join("truncated.bin");
    std::fs::write(sidecar_path(&dest), b"{\"version\":1,\"url\":\"ht").unwrap();
    assert!(load(&dest).is_none());
    discard(&dest);
  }
}
