use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::destination::Destination;
use crate::utils::{sanitize_filename, unix_millis};

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// A catalog entry that can be downloaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// Length in seconds, when the catalog knows it
    #[serde(default)]
    pub duration: Option<f64>,
}

impl Song {
    pub fn new(id: u64, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration: None,
        }
    }

    pub fn display_name(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }

    /// File name used when the caller has no naming scheme of its own
    pub fn default_file_name(&self) -> String {
        format!("{}.mp3", sanitize_filename(&self.display_name()))
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Where the stream phase fetches from, as handed out by the resolve phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub url: String,
    pub stream_key: String,
    pub stream_server_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Initializing,
    Downloading,
    Finished,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Terminal states are absorbing; cancellation and failure are reachable
    /// from any live state, everything else only moves forward one step.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) | (_, Error) => true,
            (Pending, Initializing) | (Initializing, Downloading) | (Downloading, Finished) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// One download request and its live state.
///
/// Shared as `Arc<DownloadItem>` between the caller, the orchestrator and the
/// worker running it. Counters and status are updated in place.
#[derive(Debug)]
pub struct DownloadItem {
    id: u64,
    song: Mutex<Song>,
    destination: Mutex<Option<Destination>>,
    stored_path: Option<PathBuf>,
    target: OnceLock<TransferTarget>,
    total_bytes: Mutex<Option<u64>>,
    downloaded_bytes: AtomicU64,
    started_at: Mutex<Option<u64>>,
    stopped_at: Mutex<Option<u64>>,
    status: Mutex<DownloadStatus>,
    last_error: Mutex<Option<String>>,
}

impl DownloadItem {
    pub fn new(song: Song, destination: Destination) -> Self {
        Self::build(song, Some(destination), None)
    }

    /// An item known only by the path it was saved under, e.g. a history entry.
    /// Its destination is resolved against the download directory on demand.
    pub fn from_stored_path(song: Song, path: impl Into<PathBuf>) -> Self {
        Self::build(song, None, Some(path.into()))
    }

    fn build(song: Song, destination: Option<Destination>, stored_path: Option<PathBuf>) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            song: Mutex::new(song),
            destination: Mutex::new(destination),
            stored_path,
            target: OnceLock::new(),
            total_bytes: Mutex::new(None),
            downloaded_bytes: AtomicU64::new(0),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
            status: Mutex::new(DownloadStatus::Pending),
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn song(&self) -> Song {
        self.song.lock().clone()
    }

    pub fn destination(&self) -> Option<Destination> {
        self.destination.lock().clone()
    }

    pub fn set_destination(&self, destination: Destination) {
        *self.destination.lock() = Some(destination);
    }

    pub fn stored_path(&self) -> Option<&Path> {
        self.stored_path.as_deref()
    }

    pub fn target(&self) -> Option<&TransferTarget> {
        self.target.get()
    }

    /// Records the resolved target; only the first call has an effect
    pub fn set_target(&self, target: TransferTarget) {
        let _ = self.target.set(target);
    }

    /// Adopts the server's estimate when the catalog had no usable duration
    pub fn adopt_estimated_duration(&self, estimated_micros: u64) {
        let mut song = self.song.lock();
        let known = song.duration.is_some_and(|d| d > 0.0);
        if !known && estimated_micros > 0 {
            song.duration = Some(estimated_micros as f64 / 1_000_000.0);
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        *self.total_bytes.lock()
    }

    pub fn set_total_bytes(&self, total: Option<u64>) {
        *self.total_bytes.lock() = total;
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Acquire)
    }

    /// Adds to the downloaded counter and returns the new total
    pub fn add_downloaded_bytes(&self, n: u64) -> u64 {
        self.downloaded_bytes.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Fraction in `0.0..=1.0`, when the total size is known
    pub fn progress(&self) -> Option<f32> {
        match self.total_bytes() {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes() as f32 / total as f32).min(1.0))
            }
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<u64> {
        *self.started_at.lock()
    }

    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(unix_millis());
    }

    pub fn stopped_at(&self) -> Option<u64> {
        *self.stopped_at.lock()
    }

    pub fn mark_stopped(&self) {
        *self.stopped_at.lock() = Some(unix_millis());
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status.lock()
    }

    /// Moves to `next` if the state machine allows it. Returns whether the
    /// status changed.
    pub fn set_status(&self, next: DownloadStatus) -> bool {
        let mut status = self.status.lock();
        if status.can_transition_to(next) {
            *status = next;
            true
        } else {
            false
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }
}

impl fmt::Display for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.song.lock())
    }
}
