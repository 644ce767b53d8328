use crate::engine::plan::{Chunk, ChunkState};
use crate::engine::{worker, Shared};
use crate::error::DownloadError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// How long workers get to observe cancellation before being aborted.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the plan to completion or first fatal error. Degree 1 executes
/// inline on the caller's task; larger degrees spawn a bounded worker pool.
///
/// The first fatal error cancels the rest; later errors are discarded. The
/// call only returns once every worker has either finished or been reaped at
/// the end of the drain window.
pub(crate) async fn run(shared: Arc<Shared>, degree: usize) -> Result<(), DownloadError> {
  if degree <= 1 {
    worker_loop(shared.clone(), 0).await;
  } else {
    let mut workers = JoinSet::new();
    for worker_id in 0..degree {
      let sh = shared.clone();
      workers.spawn(async move { worker_loop(sh, worker_id).await });
    }

    // Normal phase: wait for workers, switching to a bounded drain as soon
    // as the cancellation signal fires.
    loop {
      tokio::select! {
        _ = shared.cancel.cancelled() => break,
        joined = workers.join_next() => {
          match joined {
            None => break,
            Some(Ok(())) => {}
            Some(Err(e)) => {
              tracing::error!(error = %e, "chunk worker panicked");
              record_error(&shared, DownloadError::StorageIo(format!("worker panicked: {e}")));
              shared.cancel.cancel();
              break;
            }
          }
        }
      }
    }

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while !workers.is_empty() {
      match tokio::time::timeout_at(deadline, workers.join_next()).await {
        Ok(None) => break,
        Ok(Some(_)) => {}
        Err(_) => {
          tracing::warn!("drain window elapsed, aborting remaining workers");
          workers.abort_all();
          while workers.join_next().await.is_some() {}
          break;
        }
      }
    }
  }

  if let Some(err) = shared.first_error.lock().take() {
    return Err(err);
  }
  if shared.cancel.is_cancelled() {
    return Err(DownloadError::Cancelled);
  }
  Ok(())
}

/// One worker: pull pending chunks until the plan is exhausted, a fatal
/// error occurs, or cancellation is observed.
async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
  loop {
    if shared.cancel.is_cancelled() {
      return;
    }
    let Some(chunk) = next_pending(&shared) else {
      return;
    };

    tracing::debug!(worker_id, chunk = chunk.index, start = chunk.start, "chunk started");
    match worker::run_chunk(&shared, &chunk).await {
      Ok(()) => {
        set_state(&shared, chunk.index, ChunkState::Completed);
        if let Some(end) = chunk.end {
          // A failed sidecar write costs resumability, not the download.
          if let Err(e) = shared.resume.mark_completed(chunk.start, end) {
            tracing::warn!(error = %e, "failed to persist resume sidecar");
          }
        }
      }
      Err((prefix, err)) => {
        set_state(&shared, chunk.index, ChunkState::Failed);
        if prefix > 0 && chunk.end.is_some() {
          if let Err(e) = shared.resume.mark_completed(chunk.start, chunk.start + prefix) {
            tracing::warn!(error = %e, "failed to persist resume sidecar");
          }
        }
        if !matches!(err, DownloadError::Cancelled) {
          tracing::warn!(worker_id, chunk = chunk.index, error = %err, "chunk failed");
          record_error(&shared, err);
        }
        shared.cancel.cancel();
        return;
      }
    }
  }
}

/// Claims the next Pending chunk under the plan lock.
fn next_pending(shared: &Shared) -> Option<Chunk> {
  let mut chunks = shared.chunks.lock();
  let chunk = chunks
    .iter_mut()
    .find(|c| c.state == ChunkState::Pending)?;
  chunk.state = ChunkState::InFlight;
  Some(chunk.clone())
}

fn set_state(shared: &Shared, index: usize, state: ChunkState) {
  let mut chunks = shared.chunks.lock();
  if let Some(chunk) = chunks.iter_mut().find(|c| c.index == index) {
    chunk.state = state;
  }
}

fn record_error(shared: &Shared, err: DownloadError) {
  let mut slot = shared.first_error.lock();
  if slot.is_none() {
    *slot = Some(err);
  }
}
