//! Task orchestration: worker pools, one writer per destination, start pacing,
//! cancellation and shutdown.
//!
//! All bookkeeping (the active set, the pacing clock, whether new work is
//! accepted) lives in one [`CoordinatorState`] behind a single mutex. Workers
//! are tokio tasks; a pool is a semaphore they must hold a permit of while
//! they run. Listener callbacks are never invoked with that mutex held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::pacing::PacingClock;
use super::transfer::{AbortHandle, TransferExecutor};
use crate::api::{ApiClient, StreamSource};
use crate::config::{ConfigError, DownloadConfig};
use crate::domain::{
    Destination, DownloadError, DownloadItem, DownloadListener, DownloadStatus, Song,
};

/// Where a submitted song should be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    /// A file in the configured download directory
    File { file_name: String },
    /// An in-memory buffer for immediate playback, run on the playback pool
    Memory,
}

impl DestinationKind {
    fn is_playback(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

struct ActiveDownload {
    item: Arc<DownloadItem>,
    abort: AbortHandle,
    listener: Option<Arc<dyn DownloadListener>>,
}

impl ActiveDownload {
    fn notify(&self) {
        if let Some(listener) = &self.listener {
            listener.status_changed(&self.item);
        }
    }
}

struct CoordinatorState {
    active: HashMap<u64, ActiveDownload>,
    pacing: PacingClock,
    accepting: bool,
}

struct Shared {
    config: DownloadConfig,
    source: Arc<dyn StreamSource>,
    state: Mutex<CoordinatorState>,
    downloads: Arc<Semaphore>,
    playback: Arc<Semaphore>,
    runtime: Handle,
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    /// Builds a coordinator whose workers run on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate.
    pub fn new(
        config: DownloadConfig,
        source: Arc<dyn StreamSource>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(
            max_parallel = config.max_parallel_downloads,
            pacing_ms = config.pacing_interval_ms,
            penalty_ms = config.interrupt_penalty_ms,
            "creating download coordinator"
        );

        let state = CoordinatorState {
            active: HashMap::new(),
            pacing: PacingClock::new(config.pacing_interval(), config.interrupt_penalty()),
            accepting: true,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                downloads: Arc::new(Semaphore::new(config.max_parallel_downloads)),
                playback: Arc::new(Semaphore::new(1)),
                state: Mutex::new(state),
                source,
                config,
                runtime,
            }),
        })
    }

    /// Builds a coordinator talking to the catalog over HTTP, on the current
    /// tokio runtime.
    pub fn connect(config: DownloadConfig) -> Result<Self, DownloadError> {
        let runtime = Handle::try_current().map_err(|_| DownloadError::NoRuntime)?;
        let client = ApiClient::new(config.api.clone())?;
        Ok(Self::new(config, Arc::new(client), runtime)?)
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.shared.config
    }

    /// Downloads `song` to a file named by [`Song::default_file_name`]
    pub fn download(
        &self,
        song: Song,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<Arc<DownloadItem>, DownloadError> {
        let file_name = song.default_file_name();
        self.submit(song, DestinationKind::File { file_name }, listener)
    }

    /// Downloads `song` into memory on the playback pool
    pub fn download_to_memory(
        &self,
        song: Song,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<Arc<DownloadItem>, DownloadError> {
        self.submit(song, DestinationKind::Memory, listener)
    }

    /// Queues `song` for download and returns its item right away.
    ///
    /// Submitting to a location that is already being downloaded restarts it:
    /// the running task is cancelled and its content deleted before the new
    /// one is queued. Completion is observed through `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn submit(
        &self,
        song: Song,
        kind: DestinationKind,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<Arc<DownloadItem>, DownloadError> {
        let playback = kind.is_playback();
        let destination = match kind {
            DestinationKind::File { file_name } => {
                Destination::file(&self.shared.config.download_directory, file_name)
            }
            DestinationKind::Memory => Destination::memory(song.display_name()),
        };
        self.submit_to(song, destination, playback, listener)
    }

    /// Like [`submit`](Self::submit) with a caller-built destination, e.g. one
    /// carrying a tag writer. `playback` selects the single-worker pool.
    #[instrument(skip(self, destination, listener), fields(song_id = song.id, destination = %destination))]
    pub fn submit_to(
        &self,
        song: Song,
        destination: Destination,
        playback: bool,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<Arc<DownloadItem>, DownloadError> {
        let item = Arc::new(DownloadItem::new(song, destination));
        let abort = AbortHandle::new();

        let (delay, superseded) = {
            let mut state = self.shared.state.lock();
            if !state.accepting {
                return Err(DownloadError::ShutDown);
            }

            let (interrupted, superseded) = self.shared.cancel_locked(&mut state, &item, true, false);
            // playback requests are never penalized
            let delay = state
                .pacing
                .schedule(Instant::now(), interrupted && !playback);

            state.active.insert(
                item.id(),
                ActiveDownload {
                    item: Arc::clone(&item),
                    abort: abort.clone(),
                    listener: listener.clone(),
                },
            );

            let pool = if playback {
                Arc::clone(&self.shared.playback)
            } else {
                Arc::clone(&self.shared.downloads)
            };
            self.shared.runtime.spawn(Shared::run_worker(
                Arc::clone(&self.shared),
                Arc::clone(&item),
                abort,
                listener,
                pool,
                delay,
            ));

            (delay, superseded)
        };

        if let Some(superseded) = superseded {
            info!(superseded = %superseded.item, "restarting download at occupied destination");
            superseded.notify();
        }
        info!(item = %item, delay_ms = delay.as_millis() as u64, playback, "queued download");
        Ok(item)
    }

    /// Cancels the task downloading to `item`'s destination, found by location
    /// rather than by item.
    ///
    /// With `safe_delete`, deletion proceeds even if no task is running. An
    /// item without a destination gets one resolved from its stored path.
    /// Returns whether an in-flight network call was interrupted.
    #[instrument(skip(self, item), fields(item = %item))]
    pub fn cancel(
        &self,
        item: &Arc<DownloadItem>,
        delete_destination: bool,
        safe_delete: bool,
    ) -> bool {
        let (interrupted, cancelled) = {
            let mut state = self.shared.state.lock();
            self.shared
                .cancel_locked(&mut state, item, delete_destination, safe_delete)
        };
        if let Some(cancelled) = cancelled {
            info!(interrupted, "cancelled download by request");
            cancelled.notify();
        }
        interrupted
    }

    /// Stops accepting work, interrupts every worker and cancels every active
    /// download, deleting its content. Safe to call more than once.
    pub fn shutdown(&self) {
        let cancelled: Vec<ActiveDownload> = {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            self.shared.downloads.close();
            self.shared.playback.close();

            state
                .active
                .drain()
                .map(|(_, task)| task)
                .filter_map(|task| {
                    task.abort.abort();
                    if task.abort.is_completed() {
                        return None;
                    }
                    if let Some(destination) = task.item.destination() {
                        destination.delete();
                    }
                    task.item
                        .set_status(DownloadStatus::Cancelled)
                        .then_some(task)
                })
                .collect()
        };

        info!(cancelled = cancelled.len(), "download coordinator shut down");
        for task in &cancelled {
            task.notify();
        }
    }

    pub fn has_active_downloads(&self) -> bool {
        !self.shared.state.lock().active.is_empty()
    }

    /// Items currently queued or running
    pub fn active_downloads(&self) -> Vec<Arc<DownloadItem>> {
        self.shared
            .state
            .lock()
            .active
            .values()
            .map(|task| Arc::clone(&task.item))
            .collect()
    }
}

impl Shared {
    /// Returns whether a network call was interrupted, and the task whose
    /// status changed so the caller can notify once the lock is released.
    ///
    /// A running task that already completed is only released from the active
    /// set; its content and status stay as they are.
    fn cancel_locked(
        &self,
        state: &mut CoordinatorState,
        item: &Arc<DownloadItem>,
        delete_destination: bool,
        safe_delete: bool,
    ) -> (bool, Option<ActiveDownload>) {
        let destination = match item.destination() {
            Some(destination) => destination,
            None => match item.stored_path() {
                Some(path) => {
                    let destination = Destination::file(&self.config.download_directory, path);
                    item.set_destination(destination.clone());
                    destination
                }
                None => {
                    warn!(item = %item, "cannot cancel a download without destination");
                    return (false, None);
                }
            },
        };

        let running = state
            .active
            .iter()
            .find(|(_, task)| {
                task.item
                    .destination()
                    .is_some_and(|d| d.same_location(&destination))
            })
            .map(|(id, _)| *id);

        let task = match running {
            Some(id) => state.active.remove(&id),
            None if safe_delete => Some(ActiveDownload {
                item: Arc::clone(item),
                abort: AbortHandle::new(),
                listener: None,
            }),
            None => None,
        };
        let Some(task) = task else {
            return (false, None);
        };

        let interrupted = task.abort.abort();
        if task.abort.is_completed() {
            debug!(item = %task.item, "download already completed");
            return (false, None);
        }
        if delete_destination {
            task.item
                .destination()
                .unwrap_or(destination)
                .delete();
        }

        let changed = task.item.set_status(DownloadStatus::Cancelled);
        (interrupted, changed.then_some(task))
    }

    async fn run_worker(
        self: Arc<Self>,
        item: Arc<DownloadItem>,
        abort: AbortHandle,
        listener: Option<Arc<dyn DownloadListener>>,
        pool: Arc<Semaphore>,
        delay: Duration,
    ) {
        let token = abort.token().clone();
        let executor = TransferExecutor::new(
            Arc::clone(&self.source),
            Arc::clone(&item),
            listener,
            abort.clone(),
        );

        let result: Result<(), DownloadError> = async {
            // pacing delay is served before taking a pool slot
            if !delay.is_zero() {
                debug!(item = %item, delay_ms = delay.as_millis() as u64, "pacing download start");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(DownloadError::Interrupted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Interrupted),
                permit = pool.acquire_owned() => permit.map_err(|_| DownloadError::ShutDown)?,
            };

            executor.run().await
        }
        .await;

        self.finish(&executor, &abort, result);
    }

    /// Settles the outcome of a worker and releases its active-set entry.
    ///
    /// Content is deleted on failure only while this worker still owns the
    /// entry; once a cancel removed it, that cancel owned the cleanup and the
    /// location may already belong to a successor.
    fn finish(
        &self,
        executor: &TransferExecutor,
        abort: &AbortHandle,
        result: Result<(), DownloadError>,
    ) {
        let item = executor.item();
        let status = match &result {
            Ok(()) => DownloadStatus::Finished,
            Err(e) if e.is_interrupted() || abort.is_aborted() => {
                info!(item = %item, "download cancelled");
                DownloadStatus::Cancelled
            }
            Err(DownloadError::ShutDown) => DownloadStatus::Cancelled,
            Err(e) => {
                warn!(item = %item, error = %e, "download failed");
                item.set_last_error(e.to_string());
                DownloadStatus::Error
            }
        };

        let changed = status != DownloadStatus::Finished && item.set_status(status);
        item.mark_stopped();

        {
            let mut state = self.state.lock();
            let owned = state.active.remove(&item.id()).is_some();
            if owned && status != DownloadStatus::Finished {
                if let Some(destination) = item.destination() {
                    destination.delete();
                }
            }
        }

        if changed {
            executor.notify_status();
        }
    }
}
