use super::model::DownloadItem;

/// Observer of a single download's progress.
///
/// Callbacks run synchronously on the task that made the change, so an
/// implementation that must not stall the transfer should hand the event off
/// (for example over a channel) and return.
pub trait DownloadListener: Send + Sync {
    fn status_changed(&self, item: &DownloadItem);

    fn downloaded_bytes_changed(&self, item: &DownloadItem);
}
