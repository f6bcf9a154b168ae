/// Errors returned by [`crate::Querier`] implementations.
///
/// # Examples
///
/// ```rust
/// use oxrule_datasource::error::DatasourceError;
///
/// let err = DatasourceError::BadResponse("unknown result type \"string\"".to_string());
/// assert!(err.to_string().contains("unknown result type"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    /// Transport-level failure talking to the datasource.
    #[error("Datasource: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The datasource answered with a non-success HTTP status.
    #[error("Datasource: unexpected response code {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The response was valid HTTP but the payload reported an error.
    #[error("Datasource: query failed: {error_type}: {error}")]
    Query { error_type: String, error: String },

    /// The payload could not be decoded.
    #[error("Datasource: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload decoded but had an unexpected shape.
    #[error("Datasource: bad response: {0}")]
    BadResponse(String),

    /// Generic error used by test doubles and wrappers.
    #[error("Datasource: {0}")]
    Other(String),
}

/// Convenience `Result` alias for datasource operations.
pub type Result<T> = std::result::Result<T, DatasourceError>;
