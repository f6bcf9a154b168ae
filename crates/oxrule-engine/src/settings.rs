use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Evaluation knobs shared by every group and rule of one engine instance.
///
/// Built once from the server configuration and handed to group
/// constructors behind an `Arc`, so two engines in one process (or two
/// tests) never see each other's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-rule number of state entries kept for the status API.
    #[serde(default = "default_update_entries_limit")]
    pub update_entries_limit: usize,

    /// Minimum time between two notifications about the same firing alert.
    #[serde(default, with = "humantime_serde")]
    pub resend_delay: Duration,

    /// Upper bound of the `endsAt` horizon sent to notifiers; 0 disables it.
    #[serde(default, with = "humantime_serde")]
    pub max_resolve_duration: Duration,

    /// Shift of the query timestamp compensating datasource ingestion lag.
    #[serde(default = "default_eval_delay", with = "humantime_serde")]
    pub eval_delay: Duration,

    #[serde(default)]
    pub disable_alert_group_label: bool,

    /// How far back restore queries look for `ALERTS_FOR_STATE` series.
    #[serde(default = "default_remote_read_lookback", with = "humantime_serde")]
    pub remote_read_lookback: Duration,

    /// Interval of groups that do not set one.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub default_interval: Duration,

    /// Start groups immediately instead of spreading them over the interval.
    #[serde(default)]
    pub skip_rand_sleep_on_group_start: bool,

    /// Labels attached to every rule, lowest precedence.
    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            update_entries_limit: default_update_entries_limit(),
            resend_delay: Duration::ZERO,
            max_resolve_duration: Duration::ZERO,
            eval_delay: default_eval_delay(),
            disable_alert_group_label: false,
            remote_read_lookback: default_remote_read_lookback(),
            default_interval: default_interval(),
            skip_rand_sleep_on_group_start: false,
            external_labels: BTreeMap::new(),
        }
    }
}

fn default_update_entries_limit() -> usize {
    20
}

fn default_eval_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_remote_read_lookback() -> Duration {
    Duration::from_secs(3600)
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

/// Converts a configuration duration into the engine's time arithmetic type.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
