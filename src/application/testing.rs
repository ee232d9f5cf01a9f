//! In-process stand-ins for the remote service and a UI listener.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;

use super::transfer::CHUNK_SIZE;
use crate::api::{ApiError, AudioStream, ResolvedStream, Result, StreamSource};
use crate::domain::{DownloadItem, DownloadListener, DownloadStatus, TransferTarget};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves a fixed payload for every song
pub struct FakeSource {
    payload: Vec<u8>,
    fault: Option<i64>,
    stream_status: u16,
    acknowledge: bool,
    gate: Option<Arc<Semaphore>>,
    held_songs: Option<Vec<u64>>,
    hold_acknowledgment: bool,
    on_open: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    calls: Mutex<Vec<(&'static str, u64, Instant)>>,
}

impl FakeSource {
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            payload,
            fault: None,
            stream_status: 200,
            acknowledge: true,
            gate: None,
            held_songs: None,
            hold_acknowledgment: false,
            on_open: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fault(mut self, code: i64) -> Self {
        self.fault = Some(code);
        self
    }

    pub fn stream_status(mut self, status: u16) -> Self {
        self.stream_status = status;
        self
    }

    pub fn acknowledge_with(mut self, affirmative: bool) -> Self {
        self.acknowledge = affirmative;
        self
    }

    /// Body yields its first chunk, then waits for permits on [`gate`](Self::gate)
    pub fn hold_after_first_chunk(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Like [`hold_after_first_chunk`](Self::hold_after_first_chunk), for one song only
    pub fn hold_song(mut self, song_id: u64) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self.held_songs.get_or_insert_with(Vec::new).push(song_id);
        self
    }

    /// Acknowledgments never complete
    pub fn hold_acknowledgment(mut self) -> Self {
        self.hold_acknowledgment = true;
        self
    }

    /// Runs `hook` once, as the next stream response arrives
    pub fn on_open(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_open.lock() = Some(Box::new(hook));
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate
            .clone()
            .unwrap_or_else(|| Arc::new(Semaphore::new(0)))
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|(name, _, _)| *name).collect()
    }

    /// (song id, instant) of every resolve call, in call order
    pub fn resolve_log(&self) -> Vec<(u64, Instant)> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _, _)| *name == "resolve")
            .map(|(_, id, at)| (*id, *at))
            .collect()
    }

    fn record(&self, name: &'static str, song_id: u64) {
        self.calls.lock().push((name, song_id, Instant::now()));
    }
}

#[async_trait]
impl StreamSource for FakeSource {
    async fn resolve_stream(&self, song_id: u64) -> Result<ResolvedStream> {
        self.record("resolve", song_id);
        if let Some(code) = self.fault {
            return Err(ApiError::Fault {
                code,
                message: "invalid token".to_string(),
            });
        }
        Ok(ResolvedStream {
            target: TransferTarget {
                url: format!("http://fake-{song_id}/stream.php"),
                stream_key: format!("key-{song_id}"),
                stream_server_id: "1".to_string(),
            },
            estimated_micros: 200_000_000,
        })
    }

    async fn open_stream(&self, target: &TransferTarget) -> Result<AudioStream> {
        let song_id = target
            .stream_key
            .trim_start_matches("key-")
            .parse()
            .unwrap_or(0);
        self.record("stream", song_id);
        if self.stream_status != 200 {
            return Err(ApiError::HttpStatus {
                url: target.url.clone(),
                status: self.stream_status,
                reason: "refused".to_string(),
            });
        }

        let chunks: Vec<Bytes> = self
            .payload
            .chunks(CHUNK_SIZE)
            .map(Bytes::copy_from_slice)
            .collect();
        let held = match &self.held_songs {
            Some(songs) => songs.contains(&song_id),
            None => true,
        };
        let gate = self.gate.clone().filter(|_| held);
        let body = futures::stream::unfold(
            (chunks.into_iter(), gate, true),
            |(mut chunks, gate, first)| async move {
                if !first && chunks.len() > 0 {
                    if let Some(gate) = &gate {
                        let _permit = gate.acquire().await.ok()?;
                    }
                }
                chunks
                    .next()
                    .map(|chunk| (Ok(chunk), (chunks, gate, false)))
            },
        );

        let hook = self.on_open.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        Ok(AudioStream {
            content_length: Some(self.payload.len() as u64),
            body: Box::pin(body),
        })
    }

    async fn acknowledge_download(&self, song_id: u64, _target: &TransferTarget) -> Result<bool> {
        self.record("acknowledge", song_id);
        if self.hold_acknowledgment {
            futures::future::pending::<()>().await;
        }
        Ok(self.acknowledge)
    }
}

/// Records every notification and lets tests await milestones
pub struct RecordingListener {
    statuses: Mutex<Vec<DownloadStatus>>,
    byte_counts: Mutex<Vec<u64>>,
    status_tx: watch::Sender<DownloadStatus>,
    bytes_tx: watch::Sender<u64>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self {
            statuses: Mutex::new(Vec::new()),
            byte_counts: Mutex::new(Vec::new()),
            status_tx: watch::channel(DownloadStatus::Pending).0,
            bytes_tx: watch::channel(0).0,
        }
    }
}

impl RecordingListener {
    pub fn statuses(&self) -> Vec<DownloadStatus> {
        self.statuses.lock().clone()
    }

    pub fn byte_counts(&self) -> Vec<u64> {
        self.byte_counts.lock().clone()
    }

    pub async fn wait_for_bytes(&self, at_least: u64) {
        let mut rx = self.bytes_tx.subscribe();
        let _ = rx.wait_for(|bytes| *bytes >= at_least).await;
    }

    pub async fn wait_for_status(&self, status: DownloadStatus) {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|current| *current == status).await;
    }

    pub async fn wait_for_terminal(&self) -> DownloadStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|current| current.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => DownloadStatus::Pending,
        };
        status
    }
}

impl DownloadListener for RecordingListener {
    fn status_changed(&self, item: &DownloadItem) {
        let status = item.status();
        self.statuses.lock().push(status);
        self.status_tx.send_replace(status);
    }

    fn downloaded_bytes_changed(&self, item: &DownloadItem) {
        let bytes = item.downloaded_bytes();
        self.byte_counts.lock().push(bytes);
        self.bytes_tx.send_replace(bytes);
    }
}
