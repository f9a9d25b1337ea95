/// Reasons a download from remote storage can fail.
///
/// Cloneable so that a single in-flight download can report its outcome to
/// every waiter.
#[derive(Debug, Clone)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(std::sync::Arc<anyhow::Error>),
    /// The file was not found in the remote storage.
    NotFound,
    /// A cancellation token aborted the download, typically during
    /// tenant detach or process shutdown.
    Cancelled,
    /// A timeout happened while executing the request.
    Timeout,
    /// The file was found in the remote storage, but the download failed.
    Other(std::sync::Arc<anyhow::Error>),
}

impl DownloadError {
    pub fn other(e: impl Into<anyhow::Error>) -> Self {
        DownloadError::Other(std::sync::Arc::new(e.into()))
    }

    pub fn bad_input(e: impl Into<anyhow::Error>) -> Self {
        DownloadError::BadInput(std::sync::Arc::new(e.into()))
    }

    /// Returns true if the error should not be retried with backoff
    pub fn is_permanent(&self) -> bool {
        use DownloadError::*;
        match self {
            BadInput(_) => true,
            NotFound => true,
            Cancelled => true,
            Timeout => false,
            Other(_) => false,
        }
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => {
                write!(f, "Failed to download a remote file due to user input: {e}")
            }
            DownloadError::NotFound => write!(f, "No file found for the remote object id given"),
            DownloadError::Cancelled => write!(f, "Cancelled, shutting down"),
            DownloadError::Timeout => write!(f, "timeout"),
            DownloadError::Other(e) => write!(f, "Failed to download a remote file: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Root cause for timeouts and cancellations of the `anyhow` returning
/// [`crate::RemoteStorage`] methods.
#[derive(Debug)]
pub enum TimeoutOrCancel {
    Timeout,
    Cancel,
}

impl std::fmt::Display for TimeoutOrCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use TimeoutOrCancel::*;
        match self {
            Timeout => write!(f, "timeout"),
            Cancel => write!(f, "cancel"),
        }
    }
}

impl std::error::Error for TimeoutOrCancel {}

impl TimeoutOrCancel {
    pub fn caused(error: &anyhow::Error) -> Option<&Self> {
        error.root_cause().downcast_ref()
    }

    /// Returns true if the error was caused by [`TimeoutOrCancel::Cancel`].
    pub fn caused_by_cancel(error: &anyhow::Error) -> bool {
        Self::caused(error).is_some_and(Self::is_cancel)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, TimeoutOrCancel::Cancel)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutOrCancel::Timeout)
    }
}

impl From<TimeoutOrCancel> for DownloadError {
    fn from(value: TimeoutOrCancel) -> Self {
        use TimeoutOrCancel::*;

        match value {
            Timeout => DownloadError::Timeout,
            Cancel => DownloadError::Cancelled,
        }
    }
}
