use oxrule_engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Glob patterns of rule files.
    #[serde(default)]
    pub rule_files: Vec<String>,
    /// How often rule files are re-read; 0 disables reloading.
    #[serde(default)]
    pub reload_interval_secs: u64,
    /// Public address of this server, used for alert `generatorURL` links.
    #[serde(default)]
    pub external_url: String,

    pub datasource: DatasourceConfig,
    #[serde(default)]
    pub remote_write: Option<RemoteWriteConfig>,
    /// Datasource holding previously written `ALERTS_FOR_STATE` series.
    #[serde(default)]
    pub remote_read: Option<DatasourceConfig>,
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,

    #[serde(default)]
    pub evaluation: EngineSettings,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub url: String,
    #[serde(default)]
    pub basic_auth_username: Option<String>,
    #[serde(default)]
    pub basic_auth_password: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWriteConfig {
    pub url: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Alertmanager base URL.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Points per range query; bounds the window of one request.
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    /// Pause between rules so chained rules see freshly written data.
    #[serde(default = "default_rule_delay", with = "humantime_serde")]
    pub rule_delay: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_data_points: default_max_data_points(),
            retry_attempts: default_retry_attempts(),
            rule_delay: default_rule_delay(),
        }
    }
}

fn default_http_port() -> u16 {
    8880
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_queue_size() -> usize {
    100_000
}

fn default_concurrency() -> usize {
    4
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_data_points() -> usize {
    1000
}

fn default_retry_attempts() -> usize {
    5
}

fn default_rule_delay() -> Duration {
    Duration::from_secs(10)
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{path}': {e}"))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            rule_files = ["rules/*.yml"]

            [datasource]
            url = "http://localhost:8428"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http_port, 8880);
        assert_eq!(cfg.reload_interval_secs, 0);
        assert_eq!(cfg.datasource.timeout_secs, 30);
        assert!(cfg.remote_write.is_none());
        assert_eq!(cfg.evaluation.update_entries_limit, 20);
        assert_eq!(cfg.evaluation.eval_delay, Duration::from_secs(30));
        assert_eq!(cfg.replay.max_data_points, 1000);
    }

    #[test]
    fn full_config_parses() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            http_port = 9000
            rule_files = ["a.yml", "b/*.yml"]
            reload_interval_secs = 30
            external_url = "http://oxrule:9000"

            [datasource]
            url = "http://prom:9090"
            bearer_token = "secret"

            [remote_write]
            url = "http://vm:8428"
            flush_interval = "2s"
            headers = { "X-Scope" = "1" }

            [remote_read]
            url = "http://vm:8428"

            [[notifiers]]
            url = "http://am:9093"

            [[notifiers]]
            url = "http://am2:9093"

            [evaluation]
            resend_delay = "1m"
            external_labels = { dc = "eu" }

            [replay]
            rule_delay = "0s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.notifiers.len(), 2);
        let rw = cfg.remote_write.unwrap();
        assert_eq!(rw.flush_interval, Duration::from_secs(2));
        assert_eq!(rw.max_batch_size, 1000);
        assert_eq!(rw.headers["X-Scope"], "1");
        assert_eq!(cfg.remote_read.unwrap().url, "http://vm:8428");
        assert_eq!(cfg.evaluation.resend_delay, Duration::from_secs(60));
        assert_eq!(cfg.evaluation.external_labels["dc"], "eu");
        assert_eq!(cfg.replay.rule_delay, Duration::ZERO);
    }

    #[test]
    fn datasource_is_required() {
        assert!(toml::from_str::<ServerConfig>("rule_files = []").is_err());
    }
}
