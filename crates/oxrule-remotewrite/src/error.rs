/// Errors produced by remote-write clients.
///
/// # Examples
///
/// ```rust
/// use oxrule_remotewrite::error::RemoteWriteError;
///
/// assert_eq!(RemoteWriteError::QueueFull.to_string(), "RemoteWrite: queue is full");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RemoteWriteError {
    /// The in-memory queue reached its configured capacity.
    #[error("RemoteWrite: queue is full")]
    QueueFull,

    /// `push` was called after `close`.
    #[error("RemoteWrite: client is closed")]
    Closed,

    #[error("RemoteWrite: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote storage rejected the request.
    #[error("RemoteWrite: unexpected response code {status}: {body}")]
    Status { status: u16, body: String },

    /// Compressing the request body failed.
    #[error("RemoteWrite: compression failed: {0}")]
    Compression(#[from] snap::Error),

    #[error("RemoteWrite: invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic error used by test doubles.
    #[error("RemoteWrite: {0}")]
    Other(String),
}

impl RemoteWriteError {
    /// Whether retrying the same request may succeed.
    ///
    /// Client errors other than 429 are permanent.
    pub fn is_retriable(&self) -> bool {
        match self {
            RemoteWriteError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 429
            }
            RemoteWriteError::Http(_) => true,
            _ => false,
        }
    }
}

/// Convenience `Result` alias for remote-write operations.
pub type Result<T> = std::result::Result<T, RemoteWriteError>;
