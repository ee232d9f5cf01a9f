use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("download interrupted")]
    Interrupted,

    #[error("I/O error on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("download service is shut down")]
    ShutDown,

    #[error("download has no destination and no stored path")]
    MissingDestination,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no tokio runtime to run downloads on")]
    NoRuntime,
}

impl DownloadError {
    pub fn io(location: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            location: location.into(),
            source,
        }
    }

    /// Cancellation, as opposed to a failure of the transfer itself
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Api(ApiError::Fault { .. }))
    }
}
