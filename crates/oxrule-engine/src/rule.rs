use crate::alerting::AlertingRule;
use crate::error::{Result, RuleError};
use crate::recording::RecordingRule;
use crate::settings::EngineSettings;
use crate::state::StateEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxrule_common::{Metric, QueryResult, TimeSeries};
use oxrule_datasource::{Querier, QuerierBuilder, QuerierParams, RequestInfo};
use oxrule_notify::template::{QueryError, TemplateQuery};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Group-level context a rule is built with.
#[derive(Clone)]
pub struct RuleOwner {
    pub group_id: u64,
    pub group_name: String,
    pub file: String,
    pub datasource_type: String,
    pub interval: Duration,
    pub params: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    pub settings: Arc<EngineSettings>,
}

impl RuleOwner {
    pub(crate) fn querier(&self, qb: &dyn QuerierBuilder, debug: bool) -> Arc<dyn Querier> {
        qb.build_with_params(QuerierParams {
            datasource_type: self.datasource_type.clone(),
            evaluation_interval: self.interval,
            query_params: self.params.clone(),
            headers: self.headers.clone(),
            debug,
        })
    }
}

/// A rule of either kind, as scheduled by a group.
pub enum Rule {
    Alerting(AlertingRule),
    Recording(RecordingRule),
}

impl Rule {
    pub fn id(&self) -> u64 {
        match self {
            Rule::Alerting(r) => r.id(),
            Rule::Recording(r) => r.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Rule::Alerting(r) => r.name(),
            Rule::Recording(r) => r.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Alerting(_) => "alerting",
            Rule::Recording(_) => "recording",
        }
    }

    pub fn as_alerting(&self) -> Option<&AlertingRule> {
        match self {
            Rule::Alerting(r) => Some(r),
            Rule::Recording(_) => None,
        }
    }

    pub fn as_recording(&self) -> Option<&RecordingRule> {
        match self {
            Rule::Recording(r) => Some(r),
            Rule::Alerting(_) => None,
        }
    }

    /// Evaluates the rule at `ts` and returns the series to write.
    pub async fn exec(
        &self,
        ctx: &CancellationToken,
        ts: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        match self {
            Rule::Alerting(r) => r.exec(ctx, ts, limit).await,
            Rule::Recording(r) => r.exec(ctx, ts, limit).await,
        }
    }

    /// Evaluates the rule over `[start, end]` for replay.
    pub async fn exec_range(
        &self,
        ctx: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        match self {
            Rule::Alerting(r) => r.exec_range(ctx, start, end).await,
            Rule::Recording(r) => r.exec_range(ctx, start, end).await,
        }
    }

    /// Copies configuration from `other`, keeping live state.
    pub fn update_with(&self, other: &Rule) -> Result<()> {
        match (self, other) {
            (Rule::Alerting(r), Rule::Alerting(nr)) => {
                r.update_with(nr);
                Ok(())
            }
            (Rule::Recording(r), Rule::Recording(nr)) => {
                r.update_with(nr);
                Ok(())
            }
            _ => Err(RuleError::UpdateMismatch(format!(
                "{} rule {:?} with a {} rule",
                self.kind(),
                self.name(),
                other.kind()
            ))),
        }
    }

    /// Releases the rule's metrics.
    pub fn close(&self) {
        match self {
            Rule::Alerting(r) => r.close(),
            Rule::Recording(r) => r.close(),
        }
    }

    /// Evaluation history, newest first.
    pub fn state_entries(&self) -> Vec<StateEntry> {
        match self {
            Rule::Alerting(r) => r.state().get_all(),
            Rule::Recording(r) => r.state().get_all(),
        }
    }

    pub fn last_state(&self) -> StateEntry {
        match self {
            Rule::Alerting(r) => r.state().get_last(),
            Rule::Recording(r) => r.state().get_last(),
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs an instant query, giving up as soon as `ctx` is cancelled.
pub(crate) async fn instant_query(
    ctx: &CancellationToken,
    q: &dyn Querier,
    expr: &str,
    ts: DateTime<Utc>,
) -> Result<(QueryResult, Option<RequestInfo>)> {
    tokio::select! {
        _ = ctx.cancelled() => Err(RuleError::Cancelled),
        res = q.query(expr, ts) => res.map_err(|e| RuleError::Query {
            expr: expr.to_string(),
            source: e,
        }),
    }
}

pub(crate) async fn range_query(
    ctx: &CancellationToken,
    q: &dyn Querier,
    expr: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<QueryResult> {
    tokio::select! {
        _ = ctx.cancelled() => Err(RuleError::Cancelled),
        res = q.query_range(expr, start, end) => res.map_err(|e| RuleError::Query {
            expr: expr.to_string(),
            source: e,
        }),
    }
}

/// Lets templates call back into the datasource at the evaluation timestamp.
pub(crate) struct DatasourceQuery<'a> {
    pub querier: &'a dyn Querier,
    pub ts: DateTime<Utc>,
    pub ctx: &'a CancellationToken,
}

#[async_trait]
impl TemplateQuery for DatasourceQuery<'_> {
    async fn query(&self, expr: &str) -> std::result::Result<Vec<Metric>, QueryError> {
        instant_query(self.ctx, self.querier, expr, self.ts)
            .await
            .map(|(res, _)| res.data)
            .map_err(|e| {
                if e.is_cancelled() {
                    QueryError::Cancelled
                } else {
                    QueryError::Failed(e.to_string())
                }
            })
    }
}

/// Builds a state entry from a query outcome.
pub(crate) fn state_entry(
    started: DateTime<Utc>,
    at: DateTime<Utc>,
    elapsed: Duration,
    res: &Result<(QueryResult, Option<RequestInfo>)>,
) -> StateEntry {
    let mut entry = StateEntry {
        time: Some(started),
        at: Some(at),
        duration: elapsed,
        ..Default::default()
    };
    match res {
        Ok((qr, req)) => {
            entry.samples = qr.data.len();
            entry.series_fetched = qr.series_fetched;
            entry.curl = req.as_ref().map(RequestInfo::to_curl).unwrap_or_default();
        }
        Err(e) => entry.err = Some(e.to_string()),
    }
    entry
}
