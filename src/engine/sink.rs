use crate::error::DownloadError;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWrite;

/// Where downloaded bytes go.
///
/// File sinks accept positioned writes from any number of workers; stream
/// sinks are single-writer and the planner forces a single-chunk plan for
/// them.
pub enum Sink {
  File {
    path: PathBuf,
    /// Create missing parent directories instead of failing.
    create_dirs: bool,
    /// Replace an existing destination file.
    overwrite: bool,
  },
  Stream(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Sink {
  pub fn file(path: impl Into<PathBuf>) -> Sink {
    Sink::File {
      path: path.into(),
      create_dirs: false,
      overwrite: false,
    }
  }

  pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> Sink {
    Sink::Stream(Box::new(writer))
  }

  pub(crate) fn is_stream(&self) -> bool {
    matches!(self, Sink::Stream(_))
  }

  pub(crate) fn path(&self) -> Option<&Path> {
    match self {
      Sink::File { path, .. } => Some(path),
      Sink::Stream(_) => None,
    }
  }
}

impl std::fmt::Debug for Sink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Sink::File {
        path,
        create_dirs,
        overwrite,
      } => f
        .debug_struct("Sink::File")
        .field("path", path)
        .field("create_dirs", create_dirs)
        .field("overwrite", overwrite)
        .finish(),
      Sink::Stream(_) => f.write_str("Sink::Stream"),
    }
  }
}

#[cfg(unix)]
fn write_at_impl(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
  use std::os::unix::fs::FileExt;
  file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at_impl(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
  use std::os::windows::fs::FileExt;
  file.seek_write(buf, offset)
}

fn write_at_all(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
  while !buf.is_empty() {
    let n = write_at_impl(file, offset, buf)?;
    if n == 0 {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "failed to write to file",
      ));
    }
    offset += n as u64;
    buf = &buf[n..];
  }
  Ok(())
}

pub(crate) struct StreamState {
  writer: Box<dyn AsyncWrite + Send + Unpin>,
  cursor: u64,
}

/// Open, ready-to-write side of a [`Sink`]. Shared by reference across the
/// worker pool.
pub(crate) enum SinkWriter {
  File { file: File, path: PathBuf },
  Stream(tokio::sync::Mutex<StreamState>),
}

impl SinkWriter {
  /// Opens the sink. For files: optional parent creation, overwrite checks,
  /// and preallocation to the known total so workers can write at distinct
  /// offsets without coordination.
  pub(crate) fn open(
    sink: Sink,
    total: Option<u64>,
    allow_existing: bool,
  ) -> Result<SinkWriter, DownloadError> {
    match sink {
      Sink::Stream(writer) => Ok(SinkWriter::Stream(tokio::sync::Mutex::new(StreamState {
        writer,
        cursor: 0,
      }))),
      Sink::File {
        path,
        create_dirs,
        overwrite,
      } => {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
          if create_dirs {
            std::fs::create_dir_all(parent).map_err(|e| DownloadError::from_io(&e))?;
          } else if !parent.exists() {
            return Err(DownloadError::InvalidInput(format!(
              "destination directory does not exist: {}",
              parent.display()
            )));
          }
        }

        if path.exists() && !overwrite && !allow_existing {
          return Err(DownloadError::InvalidInput(format!(
            "destination already exists: {}",
            path.display()
          )));
        }

        let file = OpenOptions::new()
          .create(true)
          .write(true)
          .read(true)
          .open(&path)
          .map_err(|e| DownloadError::from_io(&e))?;

        if let Some(total) = total {
          file.set_len(total).map_err(|e| DownloadError::from_io(&e))?;
        }

        Ok(SinkWriter::File { file, path })
      }
    }
  }

  pub(crate) async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), DownloadError> {
    match self {
      SinkWriter::File { file, .. } => {
        write_at_all(file, offset, buf).map_err(|e| DownloadError::from_io(&e))
      }
      SinkWriter::Stream(state) => {
        use tokio::io::AsyncWriteExt;
        let mut state = state.lock().await;
        if offset != state.cursor {
          return Err(DownloadError::StorageIo(format!(
            "stream sink requires sequential writes (offset {offset}, cursor {})",
            state.cursor
          )));
        }
        state
          .writer
          .write_all(buf)
          .await
          .map_err(|e| DownloadError::from_io(&e))?;
        state.cursor += buf.len() as u64;
        Ok(())
      }
    }
  }

  /// Flushes, truncates unknown-size file output to the downloaded length,
  /// and verifies the on-disk length against the expected total.
  pub(crate) async fn finalize(
    &self,
    downloaded: u64,
    expected: Option<u64>,
  ) -> Result<(), DownloadError> {
    match self {
      SinkWriter::File { file, path } => {
        if expected.is_none() {
          file.set_len(downloaded).map_err(|e| DownloadError::from_io(&e))?;
        }
        file.sync_all().map_err(|e| DownloadError::from_io(&e))?;

        let on_disk = std::fs::metadata(path)
          .map_err(|e| DownloadError::from_io(&e))?
          .len();
        let expected_len = expected.unwrap_or(downloaded);
        if on_disk != expected_len {
          return Err(DownloadError::Corrupted(format!(
            "{} is {on_disk} bytes, expected {expected_len}",
            path.display()
          )));
        }
        Ok(())
      }
      SinkWriter::Stream(state) => {
        use tokio::io::AsyncWriteExt;
        let mut state = state.lock().await;
        if let Some(expected) = expected {
          if state.cursor != expected {
            return Err(DownloadError::Corrupted(format!(
              "stream received {} bytes, expected {expected}",
              state.cursor
            )));
          }
        }
        state
          .writer
          .flush()
          .await
          .map_err(|e| DownloadError::from_io(&e))
      }
    }
  }

  /// Closes handles without truncating, so a later run can resume.
  pub(crate) fn abort(&self) {
    if let SinkWriter::File { file, .. } = self {
      let _ = file.sync_all();
    }
  }
}
