//! Background download manager for a streaming music catalog.
//!
//! [`DownloadCoordinator`] queues songs for download to files or to memory,
//! keeps one transfer per destination, paces requests to the remote service
//! and reports progress through a [`DownloadListener`].
//!
//! ```no_run
//! use mp3_download_manager::{DownloadConfig, DownloadCoordinator, Song};
//!
//! # async fn run() -> Result<(), mp3_download_manager::DownloadError> {
//! let coordinator = DownloadCoordinator::connect(DownloadConfig::default())?;
//! let item = coordinator.download(Song::new(24_518_291, "Intro", "The xx"), None)?;
//! println!("queued {item}");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod utils;

pub use api::{ApiClient, ApiConfig, ApiError, StreamSource};
pub use application::{DestinationKind, DownloadCoordinator};
pub use config::{ConfigError, DownloadConfig};
pub use domain::{
    Destination, DownloadError, DownloadItem, DownloadListener, DownloadStatus, Song, TagWriter,
};
