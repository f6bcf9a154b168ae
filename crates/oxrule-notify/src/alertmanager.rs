use crate::{Notifier, NotifyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use oxrule_common::Alert;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

/// Posts alerts to an Alertmanager `/api/v2/alerts` endpoint.
pub struct AlertManager {
    addr: String,
    alerts_url: String,
    client: reqwest::Client,
    /// Base URL used to build `generatorURL` links; empty disables them.
    external_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AmAlert<'a> {
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
    starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ends_at: Option<String>,
    #[serde(rename = "generatorURL", skip_serializing_if = "String::is_empty")]
    generator_url: String,
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl AlertManager {
    pub fn new(addr: &str, client: reqwest::Client, external_url: &str) -> Self {
        let addr = addr.trim_end_matches('/').to_string();
        Self {
            alerts_url: format!("{addr}/api/v2/alerts"),
            addr,
            client,
            external_url: external_url.trim_end_matches('/').to_string(),
        }
    }

    fn render_body(&self, alerts: &[Alert]) -> Result<String> {
        let payload: Vec<AmAlert<'_>> = alerts
            .iter()
            .map(|a| AmAlert {
                labels: &a.labels,
                annotations: &a.annotations,
                starts_at: rfc3339(a.active_at),
                ends_at: a.end.map(rfc3339),
                generator_url: if self.external_url.is_empty() {
                    String::new()
                } else {
                    format!(
                        "{}/v1/groups/{}/alerts/{}",
                        self.external_url, a.group_id, a.id
                    )
                },
            })
            .collect();
        Ok(serde_json::to_string(&payload)?)
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn send(&self, alerts: &[Alert], headers: &BTreeMap<String, String>) -> Result<()> {
        let body = self.render_body(alerts)?;
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            let mut req = self
                .client
                .post(self.alerts_url.as_str())
                .header("Content-Type", "application/json")
                .body(body.clone());
            for (k, v) in headers {
                req = req.header(k.as_str(), v.as_str());
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        metrics::counter!("oxrule_alerts_sent_total", "addr" => self.addr.clone())
                            .increment(alerts.len() as u64);
                        return Ok(());
                    }
                    let resp_body = resp
                        .text()
                        .await
                        .unwrap_or_else(|e| format!("[Failed to read response body: {e}]"));
                    tracing::warn!(
                        addr = %self.addr,
                        attempt = attempt + 1,
                        status = %status,
                        "Alertmanager returned non-success status, retrying"
                    );
                    last_err = Some(NotifyError::ApiError {
                        service: self.addr.clone(),
                        status: status.as_u16(),
                        body: resp_body,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        addr = %self.addr,
                        attempt = attempt + 1,
                        error = %e,
                        "Alertmanager send failed, retrying"
                    );
                    last_err = Some(e.into());
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
        }

        metrics::counter!("oxrule_alerts_send_errors_total", "addr" => self.addr.clone())
            .increment(alerts.len() as u64);
        Err(last_err.unwrap_or_else(|| NotifyError::Other("no attempts made".to_string())))
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use oxrule_common::AlertState;

    #[test]
    fn body_contains_alertmanager_fields() {
        let am = AlertManager::new("http://am:9093/", reqwest::Client::new(), "http://rules:8880");
        assert_eq!(am.addr(), "http://am:9093");

        let active_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut alert = Alert::new("HighLoad", active_at);
        alert.id = 7;
        alert.group_id = 3;
        alert.state = AlertState::Firing;
        alert.labels.insert("alertname".into(), "HighLoad".into());
        alert.annotations.insert("summary".into(), "load is high".into());
        alert.end = Some(active_at + chrono::Duration::minutes(4));

        let body: serde_json::Value = serde_json::from_str(&am.render_body(&[alert]).unwrap()).unwrap();
        let a = &body[0];
        assert_eq!(a["labels"]["alertname"], "HighLoad");
        assert_eq!(a["annotations"]["summary"], "load is high");
        assert_eq!(a["startsAt"], "2024-01-02T03:04:05Z");
        assert_eq!(a["endsAt"], "2024-01-02T03:08:05Z");
        assert_eq!(a["generatorURL"], "http://rules:8880/v1/groups/3/alerts/7");
    }
}
