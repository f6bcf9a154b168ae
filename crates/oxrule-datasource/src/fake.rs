use crate::{DatasourceError, Querier, QuerierBuilder, QuerierParams, RequestInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxrule_common::{Metric, QueryResult};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    metrics: Vec<Metric>,
    err: Option<String>,
    delay: Option<Duration>,
    series_fetched: Option<usize>,
    queries: Vec<String>,
}

/// In-memory querier returning whatever metrics were last configured.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another one built through [`QuerierBuilder`].
#[derive(Clone, Default)]
pub struct FakeQuerier {
    state: Arc<Mutex<FakeState>>,
}

impl FakeQuerier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, metric: Metric) {
        self.lock().metrics.push(metric);
    }

    pub fn set(&self, metrics: Vec<Metric>) {
        self.lock().metrics = metrics;
    }

    /// Drops configured metrics and error.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.metrics.clear();
        state.err = None;
    }

    pub fn set_err(&self, msg: &str) {
        self.lock().err = Some(msg.to_string());
    }

    /// Makes every query sleep before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn set_series_fetched(&self, n: usize) {
        self.lock().series_fetched = Some(n);
    }

    /// Expressions received so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    fn answer(&self, expr: &str) -> (Option<Duration>, Result<QueryResult>) {
        let mut state = self.lock();
        state.queries.push(expr.to_string());
        let result = match &state.err {
            Some(msg) => Err(DatasourceError::Other(msg.clone())),
            None => Ok(QueryResult {
                data: state.metrics.clone(),
                series_fetched: state.series_fetched,
                is_partial: None,
            }),
        };
        (state.delay, result)
    }
}

#[async_trait]
impl Querier for FakeQuerier {
    async fn query(
        &self,
        expr: &str,
        _ts: DateTime<Utc>,
    ) -> Result<(QueryResult, Option<RequestInfo>)> {
        let (delay, result) = self.answer(expr);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let req = RequestInfo {
            method: "GET".to_string(),
            url: format!("fake://query?query={expr}"),
            headers: Vec::new(),
        };
        result.map(|res| (res, Some(req)))
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<QueryResult> {
        let (delay, result) = self.answer(expr);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        result
    }
}

impl QuerierBuilder for FakeQuerier {
    fn build_with_params(&self, _params: QuerierParams) -> Arc<dyn Querier> {
        Arc::new(self.clone())
    }
}
