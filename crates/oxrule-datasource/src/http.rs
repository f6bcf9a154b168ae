use crate::{DatasourceError, Querier, QuerierBuilder, QuerierParams, RequestInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxrule_common::{Label, Metric, QueryResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Credentials attached to every datasource request.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Builds [`HttpQuerier`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpQuerierBuilder {
    client: reqwest::Client,
    base_url: String,
    auth: Option<Auth>,
}

impl HttpQuerierBuilder {
    pub fn new(client: reqwest::Client, base_url: &str, auth: Option<Auth>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }
}

impl QuerierBuilder for HttpQuerierBuilder {
    fn build_with_params(&self, params: QuerierParams) -> Arc<dyn Querier> {
        Arc::new(HttpQuerier {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            auth: self.auth.clone(),
            params,
        })
    }
}

/// Querier speaking the Prometheus HTTP query API.
pub struct HttpQuerier {
    client: reqwest::Client,
    base_url: String,
    auth: Option<Auth>,
    params: QuerierParams,
}

impl HttpQuerier {
    fn step(&self) -> Option<String> {
        let secs = self.params.evaluation_interval.as_secs();
        (secs > 0).then(|| format!("{secs}s"))
    }

    async fn get(&self, path: &str, mut query: Vec<(String, String)>) -> Result<(Value, RequestInfo)> {
        for (k, vs) in &self.params.query_params {
            for v in vs {
                query.push((k.clone(), v.clone()));
            }
        }
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url).query(&query);
        let mut headers: Vec<(String, String)> = self
            .params
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.params.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match &self.auth {
            Some(Auth::Basic { username, password }) => {
                req = req.basic_auth(username, Some(password));
                headers.push(("Authorization".to_string(), "Basic".to_string()));
            }
            Some(Auth::Bearer(token)) => {
                req = req.bearer_auth(token);
                headers.push(("Authorization".to_string(), "Bearer".to_string()));
            }
            None => {}
        }

        let request = req.build()?;
        let info = RequestInfo {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers,
        };
        if self.params.debug {
            tracing::info!(curl = %info.to_curl(), "Datasource request");
        }

        let resp = self.client.execute(request).await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() && status.as_u16() != 422 && status.as_u16() != 400 {
            return Err(DatasourceError::Status {
                status: status.as_u16(),
                url: info.url.clone(),
                body,
            });
        }
        let value: Value = serde_json::from_str(&body)?;
        Ok((value, info))
    }
}

#[async_trait]
impl Querier for HttpQuerier {
    async fn query(
        &self,
        expr: &str,
        ts: DateTime<Utc>,
    ) -> Result<(QueryResult, Option<RequestInfo>)> {
        let mut query = vec![
            ("query".to_string(), expr.to_string()),
            ("time".to_string(), ts.timestamp().to_string()),
        ];
        if let Some(step) = self.step() {
            query.push(("step".to_string(), step));
        }
        let (body, info) = self.get("/api/v1/query", query).await?;
        let res = parse_response(body)?;
        Ok((res, Some(info)))
    }

    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<QueryResult> {
        let mut query = vec![
            ("query".to_string(), expr.to_string()),
            ("start".to_string(), start.timestamp().to_string()),
            ("end".to_string(), end.timestamp().to_string()),
        ];
        if let Some(step) = self.step() {
            query.push(("step".to_string(), step));
        }
        let (body, _) = self.get("/api/v1/query_range", query).await?;
        parse_response(body)
    }
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stats: Option<PromStats>,
    #[serde(default, rename = "isPartial")]
    is_partial: Option<bool>,
}

#[derive(Deserialize)]
struct PromData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct PromStats {
    #[serde(default, rename = "seriesFetched")]
    series_fetched: Option<Value>,
}

#[derive(Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    value: Option<(Value, String)>,
    #[serde(default)]
    values: Vec<(Value, String)>,
}

/// Decodes a Prometheus query API response body.
pub(crate) fn parse_response(body: Value) -> Result<QueryResult> {
    let resp: PromResponse = serde_json::from_value(body)?;
    if resp.status != "success" {
        return Err(DatasourceError::Query {
            error_type: resp.error_type.unwrap_or_else(|| "error".to_string()),
            error: resp.error.unwrap_or_default(),
        });
    }
    let data = resp
        .data
        .ok_or_else(|| DatasourceError::BadResponse("missing data field".to_string()))?;

    let metrics = match data.result_type.as_str() {
        "vector" | "matrix" => {
            let series: Vec<PromSeries> = serde_json::from_value(data.result)?;
            series
                .into_iter()
                .map(series_to_metric)
                .collect::<Result<Vec<_>>>()?
        }
        "scalar" => {
            let (ts, v): (Value, String) = serde_json::from_value(data.result)?;
            let (ts, v) = parse_point(&ts, &v)?;
            vec![Metric {
                labels: Vec::new(),
                timestamps: vec![ts],
                values: vec![v],
            }]
        }
        other => {
            return Err(DatasourceError::BadResponse(format!(
                "unknown result type {other:?}"
            )))
        }
    };

    let series_fetched = resp
        .stats
        .and_then(|s| s.series_fetched)
        .and_then(|v| match v {
            Value::String(s) => s.parse::<usize>().ok(),
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        });

    Ok(QueryResult {
        data: metrics,
        series_fetched,
        is_partial: resp.is_partial,
    })
}

fn series_to_metric(s: PromSeries) -> Result<Metric> {
    let labels = s
        .metric
        .into_iter()
        .map(|(k, v)| Label::new(k, v))
        .collect();
    let mut m = Metric {
        labels,
        ..Default::default()
    };
    let points = s.value.into_iter().chain(s.values);
    for (ts, v) in points {
        let (ts, v) = parse_point(&ts, &v)?;
        m.timestamps.push(ts);
        m.values.push(v);
    }
    Ok(m)
}

fn parse_point(ts: &Value, v: &str) -> Result<(i64, f64)> {
    let ts = ts
        .as_f64()
        .ok_or_else(|| DatasourceError::BadResponse(format!("bad timestamp {ts}")))?;
    let v = match v {
        "NaN" => f64::NAN,
        "+Inf" | "Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        other => other
            .parse::<f64>()
            .map_err(|_| DatasourceError::BadResponse(format!("bad sample value {other:?}")))?,
    };
    Ok((ts as i64, v))
}
