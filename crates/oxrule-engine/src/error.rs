use oxrule_datasource::DatasourceError;
use oxrule_remotewrite::RemoteWriteError;

/// Wording shared by alerting and recording rules when two result rows end
/// up with the same label set.
pub const DUPLICATE_MSG: &str = "result contains metrics with the same labelset during evaluation";

/// Errors produced while evaluating rules.
///
/// # Examples
///
/// ```rust
/// use oxrule_engine::error::RuleError;
///
/// let err = RuleError::LimitExceeded { limit: 2, count: 3, kind: "alerts" };
/// assert_eq!(err.to_string(), "exec exceeded limit of 2 with 3 alerts");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The evaluation context was cancelled (shutdown or group update).
    #[error("evaluation cancelled")]
    Cancelled,

    #[error("failed to execute query {expr:?}: {source}")]
    Query {
        expr: String,
        #[source]
        source: DatasourceError,
    },

    #[error("failed to execute restore query {expr:?}: {source}")]
    Restore {
        expr: String,
        #[source]
        source: DatasourceError,
    },

    #[error("failed to expand templates: {0}")]
    Template(String),

    /// Two result rows collapsed into one identity; the payload describes it.
    #[error("{0}: {DUPLICATE_MSG}")]
    Duplicate(String),

    #[error("exec exceeded limit of {limit} with {count} {kind}")]
    LimitExceeded {
        limit: usize,
        count: usize,
        kind: &'static str,
    },

    #[error("rule {rule:?}: failed to execute: {source}")]
    Exec {
        rule: String,
        #[source]
        source: Box<RuleError>,
    },

    #[error("rule {rule:?}: remote write failure: {source}")]
    RemoteWrite {
        rule: String,
        #[source]
        source: RemoteWriteError,
    },

    /// Delivery errors of every notifier that failed, joined.
    #[error("{}", .0.join("; "))]
    Notify(Vec<String>),

    #[error("BUG: attempt to update {0}")]
    UpdateMismatch(String),

    #[error("error while restoring rule {rule:?}: {source}")]
    RestoreRule {
        rule: String,
        #[source]
        source: Box<RuleError>,
    },
}

impl RuleError {
    /// Whether the error only reflects a cancelled evaluation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            RuleError::Cancelled => true,
            RuleError::Exec { source, .. } | RuleError::RestoreRule { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}

/// Errors raised while loading and validating rule files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid rule file pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("invalid group {group:?} in {file:?}: {reason}")]
    Group {
        file: String,
        group: String,
        reason: String,
    },

    #[error("invalid rule {rule:?} in group {group:?}: {reason}")]
    Rule {
        group: String,
        rule: String,
        reason: String,
    },
}

/// Convenience `Result` alias for rule evaluation.
pub type Result<T> = std::result::Result<T, RuleError>;
