//! Query capabilities consumed by the rule engine.
//!
//! The engine only sees the [`Querier`] and [`QuerierBuilder`] traits. A
//! Prometheus-compatible HTTP implementation lives in [`http`], and
//! [`fake::FakeQuerier`] serves canned results for tests.

pub mod error;
pub mod fake;
pub mod http;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxrule_common::QueryResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use error::{DatasourceError, Result};

/// Per-rule request parameters bound into a querier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerierParams {
    /// Datasource flavour, e.g. `"prometheus"`.
    pub datasource_type: String,
    /// Evaluation interval of the owning group; sent as the query `step`.
    pub evaluation_interval: Duration,
    /// Extra URL query parameters.
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
    pub debug: bool,
}

/// Description of the request that produced a query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// Renders the request as a reproducible `curl` command line.
    ///
    /// Credentials in `Authorization` headers are masked.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxrule_datasource::RequestInfo;
    ///
    /// let req = RequestInfo {
    ///     method: "GET".to_string(),
    ///     url: "http://vm:8428/api/v1/query?query=up".to_string(),
    ///     headers: vec![("Authorization".to_string(), "Bearer secret".to_string())],
    /// };
    /// let curl = req.to_curl();
    /// assert!(curl.starts_with("curl -X GET"));
    /// assert!(!curl.contains("secret"));
    /// ```
    pub fn to_curl(&self) -> String {
        let mut parts = vec!["curl".to_string(), "-X".to_string(), self.method.clone()];
        for (name, value) in &self.headers {
            let value = if name.eq_ignore_ascii_case("authorization") {
                "<secret>"
            } else {
                value.as_str()
            };
            parts.push("-H".to_string());
            parts.push(format!("'{name}: {value}'"));
        }
        parts.push(format!("'{}'", self.url));
        parts.join(" ")
    }
}

/// Executes expressions against a metrics datasource.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Instant query evaluated at `ts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    async fn query(
        &self,
        expr: &str,
        ts: DateTime<Utc>,
    ) -> Result<(QueryResult, Option<RequestInfo>)>;

    /// Range query over `[start, end]`, used for replay only.
    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<QueryResult>;
}

/// Produces queriers scoped to a rule's parameters.
pub trait QuerierBuilder: Send + Sync {
    fn build_with_params(&self, params: QuerierParams) -> Arc<dyn Querier>;
}
