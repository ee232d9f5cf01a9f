pub mod download_coordinator;
pub mod pacing;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use download_coordinator::{DestinationKind, DownloadCoordinator};
pub use pacing::PacingClock;
pub use transfer::{AbortHandle, TransferExecutor, CHUNK_SIZE};
