pub mod destination;
pub mod error;
pub mod listener;
pub mod model;

pub use destination::{Destination, Location, Sink, TagWriter};
pub use error::DownloadError;
pub use listener::DownloadListener;
pub use model::{DownloadItem, DownloadStatus, Song, TransferTarget};
