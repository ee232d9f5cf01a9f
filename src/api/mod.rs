//! Remote side of a transfer: the catalog's RPC service and its stream servers.

pub mod client;
pub mod models;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::domain::TransferTarget;

pub use client::{ApiClient, ApiError, Result};
pub use models::{ApiConfig, ProxyConfig};

/// Outcome of the resolve phase
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub target: TransferTarget,
    /// Duration estimate from the stream server, in microseconds
    pub estimated_micros: u64,
}

/// An open audio body and its announced size
pub struct AudioStream {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// The two-phase protocol a transfer runs against, plus its acknowledgment.
///
/// [`ApiClient`] speaks it over HTTP. Futures returned here are dropped when a
/// transfer is cancelled, which aborts the underlying request.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn resolve_stream(&self, song_id: u64) -> Result<ResolvedStream>;

    async fn open_stream(&self, target: &TransferTarget) -> Result<AudioStream>;

    /// Returns whether the service affirmed the acknowledgment
    async fn acknowledge_download(&self, song_id: u64, target: &TransferTarget) -> Result<bool>;
}
