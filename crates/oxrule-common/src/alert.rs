use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of an alert instance.
///
/// # Examples
///
/// ```
/// use oxrule_common::AlertState;
///
/// assert_eq!(AlertState::Firing.to_string(), "firing");
/// assert_eq!("pending".parse::<AlertState>().unwrap(), AlertState::Pending);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Expression matches but `for` has not elapsed yet.
    Pending,
    Firing,
    /// Resolved; kept for a while so the resolution can be re-sent.
    Inactive,
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertState::Pending => write!(f, "pending"),
            AlertState::Firing => write!(f, "firing"),
            AlertState::Inactive => write!(f, "inactive"),
        }
    }
}

impl std::str::FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertState::Pending),
            "firing" => Ok(AlertState::Firing),
            "inactive" => Ok(AlertState::Inactive),
            other => Err(format!("unknown alert state: {other}")),
        }
    }
}

/// One instance of an alerting rule for a specific label set.
///
/// Optional timestamps are `None` until the corresponding event happened.
/// `None` orders before any `Some`, which the send-selection logic relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    /// Hash of the processed labels.
    pub id: u64,
    pub group_id: u64,
    pub name: String,
    pub expr: String,
    pub state: AlertState,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub value: f64,
    pub active_at: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
    pub keep_firing_since: Option<DateTime<Utc>>,
    /// Set when `active_at` was recovered from previously written state.
    pub restored: bool,
    pub for_duration: Duration,
}

impl Alert {
    pub fn new(name: &str, active_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            group_id: 0,
            name: name.to_string(),
            expr: String::new(),
            state: AlertState::Pending,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            value: 0.0,
            active_at,
            start: None,
            end: None,
            resolved_at: None,
            last_sent: None,
            keep_firing_since: None,
            restored: false,
            for_duration: Duration::zero(),
        }
    }

    /// Labels rendered as `k=v` pairs in name order, for log lines.
    pub fn labels_display(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
