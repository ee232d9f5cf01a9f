//! Where downloaded bytes land: a file on disk or an in-memory buffer.
//!
//! Two destinations are the same location iff their [`Location`]s compare
//! equal. The orchestrator relies on that, not on object identity, to keep a
//! single writer per location.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::error::DownloadError;
use super::model::Song;

/// Embeds descriptive tags into a finished file
pub trait TagWriter: Send + Sync {
    fn write_tags(&self, path: &Path, song: &Song) -> io::Result<()>;
}

/// Comparable identity of a destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    File(PathBuf),
    Memory(String),
}

#[derive(Clone)]
pub struct FileDestination {
    path: PathBuf,
    tag_writer: Option<Arc<dyn TagWriter>>,
}

impl fmt::Debug for FileDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDestination")
            .field("path", &self.path)
            .field("tagged", &self.tag_writer.is_some())
            .finish()
    }
}

impl FileDestination {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDestination {
    token: String,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryDestination {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Snapshot of the bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Destination {
    File(FileDestination),
    Memory(MemoryDestination),
}

impl Destination {
    /// A file named `file_name` inside `directory`. The path is made absolute
    /// so that equal locations compare equal however they were spelled.
    pub fn file(directory: &Path, file_name: impl AsRef<Path>) -> Self {
        let joined = directory.join(file_name);
        let path = std::path::absolute(&joined).unwrap_or(joined);
        Self::File(FileDestination {
            path,
            tag_writer: None,
        })
    }

    /// A buffer identified by `token`, for playback that should not touch disk
    pub fn memory(token: impl Into<String>) -> Self {
        Self::Memory(MemoryDestination {
            token: token.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Attaches a tag writer; memory destinations ignore it
    pub fn with_tag_writer(self, writer: Arc<dyn TagWriter>) -> Self {
        match self {
            Self::File(file) => Self::File(FileDestination {
                tag_writer: Some(writer),
                ..file
            }),
            memory => memory,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Self::File(file) => Location::File(file.path.clone()),
            Self::Memory(memory) => Location::Memory(memory.token.clone()),
        }
    }

    pub fn same_location(&self, other: &Destination) -> bool {
        self.location() == other.location()
    }

    pub fn description(&self) -> String {
        match self {
            Self::File(file) => file.path.display().to_string(),
            Self::Memory(memory) => format!("memory:{}", memory.token),
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryDestination> {
        match self {
            Self::Memory(memory) => Some(memory),
            Self::File(_) => None,
        }
    }

    /// Opens a fresh write sink, truncating earlier content. A missing parent
    /// directory is an error; directories are not created here.
    pub async fn open_sink(&self) -> Result<Sink, DownloadError> {
        match self {
            Self::File(file) => {
                let handle = File::create(&file.path)
                    .await
                    .map_err(|e| DownloadError::io(self.description(), e))?;
                Ok(Sink::File {
                    writer: BufWriter::new(handle),
                    path: file.path.clone(),
                })
            }
            Self::Memory(memory) => {
                memory.buffer.lock().clear();
                Ok(Sink::Memory {
                    buffer: Arc::clone(&memory.buffer),
                    token: memory.token.clone(),
                })
            }
        }
    }

    /// Removes partial or complete content. Absent content is not an error and
    /// other failures are only logged.
    pub fn delete(&self) {
        match self {
            Self::File(file) => match std::fs::remove_file(&file.path) {
                Ok(()) => debug!(path = %file.path.display(), "deleted download"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "failed to delete download")
                }
            },
            Self::Memory(memory) => {
                let mut buffer = memory.buffer.lock();
                buffer.clear();
                buffer.shrink_to_fit();
            }
        }
    }

    /// Called once after the sink is closed
    pub fn write_metadata(&self, song: &Song) -> Result<(), DownloadError> {
        match self {
            Self::File(FileDestination {
                path,
                tag_writer: Some(writer),
            }) => writer
                .write_tags(path, song)
                .map_err(|e| DownloadError::io(path.display().to_string(), e)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Write handle returned by [`Destination::open_sink`]
pub enum Sink {
    File {
        writer: BufWriter<File>,
        path: PathBuf,
    },
    Memory {
        buffer: Arc<Mutex<Vec<u8>>>,
        token: String,
    },
}

impl Sink {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        match self {
            Self::File { writer, path } => writer
                .write_all(chunk)
                .await
                .map_err(|e| DownloadError::io(path.display().to_string(), e)),
            Self::Memory { buffer, token } => {
                let mut buffer = buffer.lock();
                buffer.try_reserve(chunk.len()).map_err(|e| {
                    DownloadError::io(
                        format!("memory:{token}"),
                        io::Error::new(io::ErrorKind::OutOfMemory, e),
                    )
                })?;
                buffer.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    /// Flushes and closes the sink
    pub async fn close(self) -> Result<(), DownloadError> {
        match self {
            Self::File { mut writer, path } => {
                let location = path.display().to_string();
                writer
                    .flush()
                    .await
                    .map_err(|e| DownloadError::io(location.clone(), e))?;
                writer
                    .into_inner()
                    .sync_all()
                    .await
                    .map_err(|e| DownloadError::io(location, e))
            }
            Self::Memory { .. } => Ok(()),
        }
    }
}
