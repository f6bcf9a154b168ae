use crate::config::RuleConfig;
use crate::error::{Result, RuleError};
use crate::labels::fmt_labels;
use crate::rule::{instant_query, range_query, state_entry, RuleOwner};
use crate::state::RuleState;
use chrono::{DateTime, Utc};
use oxrule_common::types::{stale_nan, METRIC_NAME_LABEL};
use oxrule_common::{Label, Metric, Sample, TimeSeries};
use oxrule_datasource::{Querier, QuerierBuilder};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reloadable part of a recording rule.
#[derive(Clone)]
pub struct RecordingSpec {
    pub expr: String,
    pub labels: BTreeMap<String, String>,
    pub debug: bool,
    pub(crate) querier: Arc<dyn Querier>,
}

/// Stores the result of an expression under a new metric name.
pub struct RecordingRule {
    id: u64,
    name: String,
    group_name: String,
    file: String,
    spec: RwLock<RecordingSpec>,
    /// Series written by the previous evaluation, keyed by label string.
    last_evaluation: Mutex<HashMap<String, Vec<Label>>>,
    state: RuleState,
}

impl RecordingRule {
    pub fn new(
        qb: &dyn QuerierBuilder,
        owner: &RuleOwner,
        cfg: &RuleConfig,
        labels: BTreeMap<String, String>,
    ) -> Self {
        let entries = cfg
            .update_entries_limit
            .unwrap_or(owner.settings.update_entries_limit);
        Self {
            id: cfg.id(),
            name: cfg.record.clone(),
            group_name: owner.group_name.clone(),
            file: owner.file.clone(),
            spec: RwLock::new(RecordingSpec {
                expr: cfg.expr.clone(),
                labels,
                debug: cfg.debug,
                querier: owner.querier(qb, cfg.debug),
            }),
            last_evaluation: Mutex::new(HashMap::new()),
            state: RuleState::new(entries),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &RuleState {
        &self.state
    }

    pub fn spec(&self) -> RecordingSpec {
        self.spec
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update_with(&self, other: &RecordingRule) {
        let spec = other.spec();
        *self
            .spec
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = spec;
    }

    pub fn close(&self) {
        metrics::gauge!(
            "oxrule_recording_rules_last_evaluation_samples",
            self.metric_labels()
        )
        .set(0.0);
    }

    fn metric_labels(&self) -> Vec<metrics::Label> {
        vec![
            metrics::Label::new("recording", self.name.clone()),
            metrics::Label::new("group", self.group_name.clone()),
            metrics::Label::new("file", self.file.clone()),
            metrics::Label::new("id", self.id.to_string()),
        ]
    }

    /// Evaluates the expression at `ts`.
    ///
    /// Series that were produced by the previous evaluation but are missing
    /// now are returned with a staleness marker so the datasource stops
    /// extrapolating them.
    pub async fn exec(
        &self,
        ctx: &CancellationToken,
        ts: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let started = Utc::now();
        let timer = Instant::now();
        let res = instant_query(ctx, spec.querier.as_ref(), &spec.expr, ts).await;
        let mut entry = state_entry(started, ts, timer.elapsed(), &res);

        let out = res.and_then(|(qr, _)| {
            if spec.debug {
                tracing::info!(
                    group = %self.group_name,
                    rule = %self.name,
                    at = %ts.to_rfc3339(),
                    samples = entry.samples,
                    "query returned"
                );
            }
            self.apply(&spec, qr.data, ts, limit)
        });

        if let Err(e) = &out {
            entry.err = Some(e.to_string());
            metrics::counter!("oxrule_recording_rules_errors_total", self.metric_labels())
                .increment(1);
        }
        metrics::gauge!(
            "oxrule_recording_rules_last_evaluation_samples",
            self.metric_labels()
        )
        .set(entry.samples as f64);
        self.state.add(entry);
        out
    }

    fn apply(
        &self,
        spec: &RecordingSpec,
        data: Vec<Metric>,
        ts: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        let num = data.len();
        if limit > 0 && num > limit {
            return Err(RuleError::LimitExceeded {
                limit,
                count: num,
                kind: "series",
            });
        }

        let mut current: HashMap<String, Vec<Label>> = HashMap::with_capacity(num);
        let mut out = Vec::with_capacity(num);
        for m in data {
            let series = self.to_time_series(spec, m.clone());
            let key = series.labels_string();
            if current.contains_key(&key) {
                return Err(RuleError::Duplicate(format!(
                    "original metric {}; resulting labels {key:?}",
                    fmt_labels(&m.label_map())
                )));
            }
            current.insert(key, series.labels.clone());
            out.push(series);
        }

        let mut last = self
            .last_evaluation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, labels) in last.iter() {
            if !current.contains_key(key) {
                out.push(TimeSeries::from_labels(
                    labels.clone(),
                    vec![Sample {
                        value: stale_nan(),
                        timestamp: ts.timestamp() * 1000,
                    }],
                ));
            }
        }
        *last = current;
        Ok(out)
    }

    /// Evaluates the expression over `[start, end]` for replay.
    pub async fn exec_range(
        &self,
        ctx: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let res = range_query(ctx, spec.querier.as_ref(), &spec.expr, start, end).await?;

        let mut seen = HashSet::with_capacity(res.data.len());
        let mut out = Vec::with_capacity(res.data.len());
        for m in res.data {
            let series = self.to_time_series(&spec, m.clone());
            let key = series.labels_string();
            if !seen.insert(key.clone()) {
                return Err(RuleError::Duplicate(format!(
                    "original metric {}; resulting labels {key:?}",
                    fmt_labels(&m.label_map())
                )));
            }
            out.push(series);
        }
        Ok(out)
    }

    /// Renames the metric and attaches the rule labels. A rule label that
    /// overrides a different original value keeps the latter as
    /// `exported_<name>`.
    fn to_time_series(&self, spec: &RecordingSpec, mut m: Metric) -> TimeSeries {
        m.set_label(METRIC_NAME_LABEL, &self.name);
        for (k, v) in &spec.labels {
            if let Some(prev) = m.label(k).map(str::to_string) {
                if &prev != v {
                    m.set_label(&format!("exported_{k}"), &prev);
                }
            }
            m.set_label(k, v);
        }
        let samples = m
            .values
            .iter()
            .zip(&m.timestamps)
            .map(|(v, t)| Sample {
                value: *v,
                timestamp: t * 1000,
            })
            .collect();
        TimeSeries::from_labels(m.labels, samples)
    }
}
