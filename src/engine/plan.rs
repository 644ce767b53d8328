use crate::config::DownloadConfig;
use crate::model::RemoteResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
  Pending,
  InFlight,
  Completed,
  Failed,
}

/// A half-open byte interval `[start, end)` handled by one worker.
/// `end == None` only for the single chunk of an unknown-size stream.
#[derive(Debug, Clone)]
pub struct Chunk {
  pub index: usize,
  pub start: u64,
  pub end: Option<u64>,
  pub state: ChunkState,
}

impl Chunk {
  pub fn len(&self) -> Option<u64> {
    self.end.map(|end| end - self.start)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == Some(0)
  }
}

/// Ordered chunk list plus the concurrency degree actually chosen.
#[derive(Debug, Clone)]
pub struct Plan {
  pub chunks: Vec<Chunk>,
  pub degree: usize,
  pub total: Option<u64>,
  /// Spacing used to cut the chunks; recorded in the resume sidecar so a
  /// later run reproduces the same boundaries.
  pub chunk_size: Option<u64>,
}

impl Plan {
  fn single(total: Option<u64>) -> Plan {
    let chunks = match total {
      // A zero-length resource needs no requests at all.
      Some(0) => Vec::new(),
      _ => vec![Chunk {
        index: 0,
        start: 0,
        end: total,
        state: ChunkState::Pending,
      }],
    };
    Plan {
      chunks,
      degree: 1,
      total,
      chunk_size: total,
    }
  }
}

/// Turns (size, range-support, config) into a chunk sequence.
///
/// Unknown size, missing range support, or a single-writer sink all force a
/// single stream. Otherwise the degree is bounded by the configured
/// concurrency and by how many minimum-size chunks the resource even has,
/// and the chunk size is raised so the chunk count stays near the degree.
pub fn plan(
  resource: &RemoteResource,
  cfg: &DownloadConfig,
  single_stream_only: bool,
) -> Plan {
  plan_with_chunk_size(resource, cfg, single_stream_only, None)
}

/// Same as [`plan`] but with an explicit chunk size, used when resuming so
/// chunk boundaries reproduce the previous run's layout.
pub(crate) fn plan_with_chunk_size(
  resource: &RemoteResource,
  cfg: &DownloadConfig,
  single_stream_only: bool,
  chunk_size_override: Option<u64>,
) -> Plan {
  let Some(total) = resource.total else {
    return Plan::single(None);
  };
  if !resource.supports_ranges || single_stream_only || total == 0 {
    return Plan::single(Some(total));
  }

  let min_chunk = cfg.effective_chunk_size();
  let degree = (total.div_ceil(min_chunk) as usize)
    .min(cfg.effective_concurrency())
    .max(1);

  let chunk_size = match chunk_size_override {
    Some(size) => size.max(1),
    None => min_chunk.max(total.div_ceil(degree as u64)),
  };

  let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
  let mut start = 0u64;
  while start < total {
    let end = (start + chunk_size).min(total);
    chunks.push(Chunk {
      index: chunks.len(),
      start,
      end: Some(end),
      state: ChunkState::Pending,
    });
    start = end;
  }

  let degree = degree.min(chunks.len()).max(1);
  Plan {
    chunks,
    degree,
    total: Some(total),
    chunk_size: Some(chunk_size),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Validator;
  use url::Url;

  fn resource(total: Option<u64>, ranges: bool) -> RemoteResource {
    RemoteResource {
      total,
      supports_ranges: ranges,
      content_type: None,
      validator: Validator::None,
      final_url: Url::parse("https://example.com/file.bin").unwrap(),
      filename_hint: "file.bin".to_string(),
    }
  }

  fn cfg(max_concurrency: usize, chunk_size: u64) -> DownloadConfig {
    DownloadConfig {
      max_concurrency,
      chunk_size,
      ..Default::default()
    }
  }

  fn assert_covers(plan: &Plan, total: u64) {
    let mut expected_start = 0u64;
    for (i, chunk) in plan.chunks.iter().enumerate() {
      assert_eq!(chunk.index, i);
      assert_eq!(chunk.start, expected_start, "gap or overlap at chunk {i}");
      let end = chunk.end.expect("bounded plan");
      assert!(end > chunk.start, "empty chunk {i}");
      expected_start = end;
    }
    assert_eq!(expected_start, total, "plan does not cover the resource");
  }

  #[test]
  fn unknown_size_forces_single_open_chunk() {
    let plan = plan(&resource(None, true), &cfg(8, 2048), false);
    assert_eq!(plan.degree, 1);
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].start, 0);
    assert_eq!(plan.chunks[0].end, None);
  }

  #[test]
  fn no_range_support_forces_single_chunk() {
    let plan = plan(&resource(Some(1 << 20), false), &cfg(8, 2048), false);
    assert_eq!(plan.degree, 1);
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].end, Some(1 << 20));
  }

  #[test]
  fn stream_sinks_force_single_chunk() {
    let plan = plan(&resource(Some(1 << 20), true), &cfg(8, 2048), true);
    assert_eq!(plan.degree, 1);
    assert_eq!(plan.chunks.len(), 1);
  }

  #[test]
  fn degree_is_bounded_by_chunk_count_and_config() {
    // 10 KiB at 2 KiB minimum chunks: at most 5 useful workers.
    let plan1 = plan(&resource(Some(10_240), true), &cfg(4, 2_048), false);
    assert_eq!(plan1.degree, 4);
    assert_covers(&plan1, 10_240);
    assert!(plan1.chunks.len() >= 2);

    // Tiny file: a single chunk regardless of requested concurrency.
    let plan2 = plan(&resource(Some(1_500), true), &cfg(8, 2_048), false);
    assert_eq!(plan2.degree, 1);
    assert_eq!(plan2.chunks.len(), 1);
  }

  #[test]
  fn coverage_holds_across_sizes() {
    for total in [1u64, 1_023, 1_024, 1_025, 10_240, 1 << 20, (1 << 20) + 7] {
      for conc in [1usize, 2, 4, 16] {
        for chunk in [1_024u64, 2_048, 65_536] {
          let plan = plan(&resource(Some(total), true), &cfg(conc, chunk), false);
          assert_covers(&plan, total);
          assert!(plan.degree >= 1 && plan.degree <= conc.max(1));
          assert!(plan.degree <= plan.chunks.len());
        }
      }
    }
  }

  #[test]
  fn zero_length_resource_plans_no_requests() {
    let plan = plan(&resource(Some(0), true), &cfg(4, 2_048), false);
    assert!(plan.chunks.is_empty());
    assert_eq!(plan.degree, 1);
  }

  #[test]
  fn resume_override_reproduces_boundaries() {
    let first = plan(&resource(Some(100_000), true), &cfg(3, 1_024), false);
    let chunk_size = first.chunks[0].end.unwrap() - first.chunks[0].start;
    let second = plan_with_chunk_size(
      &resource(Some(100_000), true),
      &cfg(3, 1_024),
      false,
      Some(chunk_size),
    );
    let firsts: Vec<_> = first.chunks.iter().map(|c| (c.start, c.end)).collect();
    let seconds: Vec<_> = second.chunks.iter().map(|c| (c.start, c.end)).collect();
    assert_eq!(firsts, seconds);
  }
}
