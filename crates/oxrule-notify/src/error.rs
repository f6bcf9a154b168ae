/// Errors that can occur while rendering or delivering alerts.
///
/// # Examples
///
/// ```rust
/// use oxrule_notify::error::NotifyError;
///
/// let err = NotifyError::TemplateError("unexpected \"}}\"".to_string());
/// assert!(err.to_string().contains("template"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Notifier configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid configuration: {0}")]
    InvalidConfig(String),

    /// An HTTP request to the alert receiver failed.
    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON serialization failed.
    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The receiver returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    ApiError {
        service: String,
        status: u16,
        body: String,
    },

    /// Rendering a label or annotation template failed.
    #[error("Notify: template rendering error: {0}")]
    TemplateError(String),

    /// A template `query` call was cancelled along with its evaluation.
    #[error("Notify: template query cancelled")]
    Cancelled,

    /// Generic notification error for cases not covered by other variants.
    #[error("Notify: {0}")]
    Other(String),
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
