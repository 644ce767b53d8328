//! Concurrent HTTP/HTTPS download engine.
//!
//! Given a URL and a sink, `gdl` probes the remote resource, splits it into
//! byte-range chunks, fetches them over a bounded worker pool, and survives
//! transient failures and interruptions: retries back off exponentially,
//! mid-chunk failures resume from the last delivered byte, and a sidecar
//! file next to the destination lets a later run pick up completed chunks.
//!
//! ```no_run
//! use gdl::{CancellationToken, DownloadConfig, Downloader, Sink};
//!
//! # async fn example() -> Result<(), gdl::DownloadError> {
//! let downloader = Downloader::new(DownloadConfig::default())?;
//! let cancel = CancellationToken::new();
//! let stats = downloader
//!   .download(
//!     "https://example.com/large.bin",
//!     Sink::file("large.bin"),
//!     &cancel,
//!   )
//!   .await;
//! assert!(stats.success, "download failed: {:?}", stats.error);
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod limit;
mod model;
mod naming;
mod probe;
mod retry;
mod transport;

pub use config::{
  ChunkWrittenHook, DownloadConfig, PostResponseHook, PreRequestHook, ProgressCallback,
  ResponseInfo, RetryConfig, Timeouts, DEFAULT_CONCURRENCY, HARD_CONCURRENCY_CAP,
  MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use engine::plan::{plan, Chunk, ChunkState, Plan};
pub use engine::sink::Sink;
pub use engine::Downloader;
pub use error::DownloadError;
pub use model::{DownloadStats, ProgressSnapshot, RemoteResource, Validator};
pub use probe::probe;
pub use retry::{RetryContext, RetryController};

// Re-exported so callers do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
