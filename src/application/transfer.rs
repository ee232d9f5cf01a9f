//! Network side of one download: resolve, stream, finalize.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{self, StreamSource};
use crate::domain::{
    Destination, DownloadError, DownloadItem, DownloadListener, DownloadStatus, TransferTarget,
};

/// Largest piece written to a sink in one go.
pub const CHUNK_SIZE: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Idle,
    InFlight,
    Completed,
}

/// Per-task abort switch, shared by the orchestrator and the task's executor.
///
/// Cancelling is permanent. [`abort`](Self::abort) reports whether a network
/// call was outstanding at that moment; the state lock makes that answer
/// consistent with the executor entering or leaving a call, and with the
/// transfer completing.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
    state: Arc<Mutex<CallState>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(CallState::Idle)),
        }
    }

    /// Cancels the task. Returns true if a network call was interrupted.
    pub fn abort(&self) -> bool {
        let state = self.state.lock();
        self.token.cancel();
        *state == CallState::InFlight
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the transfer completed before any abort. Final once true.
    pub fn is_completed(&self) -> bool {
        *self.state.lock() == CallState::Completed
    }

    /// Marks the transfer complete unless it was aborted first.
    fn complete(&self) -> Result<(), DownloadError> {
        let mut state = self.state.lock();
        if self.token.is_cancelled() {
            return Err(DownloadError::Interrupted);
        }
        *state = CallState::Completed;
        Ok(())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn enter(&self) -> Result<InFlightGuard<'_>, DownloadError> {
        let mut state = self.state.lock();
        if self.token.is_cancelled() {
            return Err(DownloadError::Interrupted);
        }
        *state = CallState::InFlight;
        Ok(InFlightGuard { handle: self })
    }
}

struct InFlightGuard<'a> {
    handle: &'a AbortHandle,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.handle.state.lock() = CallState::Idle;
    }
}

/// Runs the protocol for one [`DownloadItem`] and reports progress to its
/// listener as it goes.
pub struct TransferExecutor {
    source: Arc<dyn StreamSource>,
    item: Arc<DownloadItem>,
    listener: Option<Arc<dyn DownloadListener>>,
    abort: AbortHandle,
}

impl TransferExecutor {
    pub fn new(
        source: Arc<dyn StreamSource>,
        item: Arc<DownloadItem>,
        listener: Option<Arc<dyn DownloadListener>>,
        abort: AbortHandle,
    ) -> Self {
        Self {
            source,
            item,
            listener,
            abort,
        }
    }

    pub fn item(&self) -> &Arc<DownloadItem> {
        &self.item
    }

    /// See [`AbortHandle::abort`]
    pub fn abort(&self) -> bool {
        self.abort.abort()
    }

    /// Resolves, streams and finalizes. Terminal status other than FINISHED is
    /// left to the caller, which owns cleanup.
    #[instrument(skip(self), fields(item_id = self.item.id(), song_id = self.item.song().id))]
    pub async fn run(&self) -> Result<(), DownloadError> {
        let destination = self
            .item
            .destination()
            .ok_or(DownloadError::MissingDestination)?;
        let song_id = self.item.song().id;

        self.advance(DownloadStatus::Initializing)?;
        let resolved = self.guarded(self.source.resolve_stream(song_id)).await?;
        let target = resolved.target;
        self.item.set_target(target.clone());
        self.item.adopt_estimated_duration(resolved.estimated_micros);

        self.item.mark_started();
        self.advance(DownloadStatus::Downloading)?;
        self.stream(&destination, &target).await?;

        if let Err(e) = destination.write_metadata(&self.item.song()) {
            warn!(destination = %destination, error = %e, "failed to write tags");
        }

        self.abort.complete()?;
        self.advance(DownloadStatus::Finished)?;
        info!(destination = %destination, bytes = self.item.downloaded_bytes(), "finished download");

        self.acknowledge(song_id, &target).await;
        Ok(())
    }

    async fn stream(
        &self,
        destination: &Destination,
        target: &TransferTarget,
    ) -> Result<(), DownloadError> {
        let stream = self.guarded(self.source.open_stream(target)).await?;
        self.item.set_total_bytes(stream.content_length);
        let mut body = stream.body;

        // held from before the sink exists, so a cancel either precedes its
        // creation or is seen right after it
        let guard = self.abort.enter()?;
        let mut sink = destination.open_sink().await?;
        if self.abort.is_aborted() {
            drop(sink);
            destination.delete();
            return Err(DownloadError::Interrupted);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.token.cancelled() => return Err(DownloadError::Interrupted),
                next = body.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk.map_err(DownloadError::from)?,
                None => break,
            };

            for piece in chunk.chunks(CHUNK_SIZE) {
                if self.abort.is_aborted() {
                    return Err(DownloadError::Interrupted);
                }
                sink.write_chunk(piece).await?;
                self.item.add_downloaded_bytes(piece.len() as u64);
                self.notify_bytes();
            }
        }
        drop(guard);

        // must be closed before tags can be written
        sink.close().await
    }

    /// Completion acknowledgment; the bytes are already stored, so nothing
    /// here can fail the transfer. Not an in-flight call: aborting a completed
    /// transfer drops it without reporting an interruption.
    async fn acknowledge(&self, song_id: u64, target: &TransferTarget) {
        let result = tokio::select! {
            biased;
            _ = self.abort.token.cancelled() => Err(DownloadError::Interrupted),
            result = self.source.acknowledge_download(song_id, target) => {
                result.map_err(DownloadError::from)
            }
        };
        match result {
            Ok(true) => debug!("download acknowledged"),
            Ok(false) => warn!("download acknowledgment was not affirmed"),
            Err(e) if e.is_interrupted() => debug!("acknowledgment interrupted"),
            Err(e) => warn!(error = %e, "download acknowledgment failed"),
        }
    }

    /// Runs a network call as the task's outstanding operation, abandoning it
    /// as soon as the task is aborted.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = api::Result<T>>,
    ) -> Result<T, DownloadError> {
        let _guard = self.abort.enter()?;
        tokio::select! {
            biased;
            _ = self.abort.token.cancelled() => Err(DownloadError::Interrupted),
            result = call => result.map_err(DownloadError::from),
        }
    }

    fn advance(&self, next: DownloadStatus) -> Result<(), DownloadError> {
        if self.item.set_status(next) {
            self.notify_status();
            Ok(())
        } else {
            // only a cancellation moves the item out from under its worker
            Err(DownloadError::Interrupted)
        }
    }

    pub(crate) fn notify_status(&self) {
        if let Some(listener) = &self.listener {
            listener.status_changed(&self.item);
        }
    }

    fn notify_bytes(&self) {
        if let Some(listener) = &self.listener {
            listener.downloaded_bytes_changed(&self.item);
        }
    }
}
