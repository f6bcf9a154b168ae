use crate::config::RuleConfig;
use crate::error::{Result, RuleError};
use crate::labels::{fmt_labels, LabelSet};
use crate::rule::{instant_query, range_query, state_entry, DatasourceQuery, RuleOwner};
use crate::settings::to_chrono;
use crate::state::RuleState;
use chrono::{DateTime, Duration, Utc};
use oxrule_common::types::METRIC_NAME_LABEL;
use oxrule_common::{hash_labels, Alert, AlertState, Metric, TimeSeries};
use oxrule_datasource::{Querier, QuerierBuilder};
use oxrule_notify::template::{render_map, AlertTplData, NoQuery, TemplateQuery};
use oxrule_notify::NotifyError;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Metric name of series reflecting alert state.
pub const ALERT_METRIC_NAME: &str = "ALERTS";
/// Metric name of series holding the moment an alert became active.
pub const ALERT_FOR_STATE_METRIC_NAME: &str = "ALERTS_FOR_STATE";
pub const ALERT_NAME_LABEL: &str = "alertname";
pub const ALERT_STATE_LABEL: &str = "alertstate";
pub const ALERT_GROUP_NAME_LABEL: &str = "alertgroup";

/// How long a resolved alert stays in memory (and keeps being re-sent).
pub const RESOLVED_RETENTION_MINUTES: i64 = 15;

const REPLAY_QUERY_MSG: &str = "`query` template isn't supported in replay mode";

/// Reloadable part of an alerting rule.
#[derive(Clone)]
pub struct AlertingSpec {
    pub expr: String,
    pub for_duration: Duration,
    pub keep_firing_for: Duration,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub eval_interval: Duration,
    pub debug: bool,
    pub(crate) querier: Arc<dyn Querier>,
}

pub struct AlertingRule {
    id: u64,
    name: String,
    owner: RuleOwner,
    spec: RwLock<AlertingSpec>,
    alerts: RwLock<BTreeMap<u64, Alert>>,
    state: RuleState,
}

impl AlertingRule {
    /// Builds the rule; `labels` are the rule labels already merged with
    /// group and external ones.
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
            name: cfg.alert.clone(),
            owner: owner.clone(),
            spec: RwLock::new(AlertingSpec {
                expr: cfg.expr.clone(),
                for_duration: to_chrono(cfg.for_duration.unwrap_or_default()),
                keep_firing_for: to_chrono(cfg.keep_firing_for.unwrap_or_default()),
                labels,
                annotations: cfg.annotations.clone(),
                eval_interval: to_chrono(owner.interval),
                debug: cfg.debug,
                querier: owner.querier(qb, cfg.debug),
            }),
            alerts: RwLock::new(BTreeMap::new()),
            state: RuleState::new(entries),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> u64 {
        self.owner.group_id
    }

    pub fn group_name(&self) -> &str {
        &self.owner.group_name
    }

    pub fn state(&self) -> &RuleState {
        &self.state
    }

    /// Snapshot of the reloadable configuration.
    pub fn spec(&self) -> AlertingSpec {
        self.spec
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_alerts(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Alert>> {
        self.alerts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_alerts(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Alert>> {
        self.alerts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current alerts ordered by ID.
    pub fn alerts(&self) -> Vec<Alert> {
        self.read_alerts().values().cloned().collect()
    }

    pub fn alert(&self, id: u64) -> Option<Alert> {
        self.read_alerts().get(&id).cloned()
    }

    /// Replaces the configuration with the one of `other`; alerts and
    /// evaluation history are kept.
    pub fn update_with(&self, other: &AlertingRule) {
        let spec = other.spec();
        *self
            .spec
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = spec;
    }

    pub fn close(&self) {
        let labels = self.metric_labels();
        metrics::gauge!("oxrule_alerts_pending", labels.clone()).set(0.0);
        metrics::gauge!("oxrule_alerts_firing", labels.clone()).set(0.0);
        metrics::gauge!("oxrule_alerting_rules_last_evaluation_samples", labels.clone()).set(0.0);
        metrics::gauge!("oxrule_alerting_rules_last_evaluation_series_fetched", labels).set(0.0);
    }

    fn metric_labels(&self) -> Vec<metrics::Label> {
        vec![
            metrics::Label::new("alertname", self.name.clone()),
            metrics::Label::new("group", self.owner.group_name.clone()),
            metrics::Label::new("file", self.owner.file.clone()),
            metrics::Label::new("id", self.id.to_string()),
        ]
    }

    fn update_gauges(&self) {
        let (mut pending, mut firing) = (0usize, 0usize);
        for a in self.read_alerts().values() {
            match a.state {
                AlertState::Pending => pending += 1,
                AlertState::Firing => firing += 1,
                AlertState::Inactive => {}
            }
        }
        let last = self.state.get_last();
        // Constant expressions fetch no series but still return one.
        let series_fetched = match last.series_fetched {
            None => -1.0,
            Some(0) if last.samples > 0 => last.samples as f64,
            Some(n) => n as f64,
        };
        let labels = self.metric_labels();
        metrics::gauge!("oxrule_alerts_pending", labels.clone()).set(pending as f64);
        metrics::gauge!("oxrule_alerts_firing", labels.clone()).set(firing as f64);
        metrics::gauge!("oxrule_alerting_rules_last_evaluation_samples", labels.clone())
            .set(last.samples as f64);
        metrics::gauge!("oxrule_alerting_rules_last_evaluation_series_fetched", labels)
            .set(series_fetched);
    }

    fn log_debug(&self, debug: bool, at: DateTime<Utc>, alert: Option<&Alert>, msg: &str) {
        if !debug {
            return;
        }
        match alert {
            Some(a) => tracing::info!(
                group = %self.owner.group_name,
                rule = %self.name,
                rule_id = self.id,
                at = %at.to_rfc3339(),
                alert_id = a.id,
                labels = %a.labels_display(),
                "{msg}"
            ),
            None => tracing::info!(
                group = %self.owner.group_name,
                rule = %self.name,
                rule_id = self.id,
                at = %at.to_rfc3339(),
                "{msg}"
            ),
        }
    }

    async fn to_labels(
        &self,
        spec: &AlertingSpec,
        m: &Metric,
        query: &dyn TemplateQuery,
    ) -> Result<LabelSet> {
        let mut ls = LabelSet::from_metric(m);
        let data = AlertTplData {
            labels: ls.origin.clone(),
            value: m.first_value(),
            expr: spec.expr.clone(),
            external_labels: self.owner.settings.external_labels.clone(),
            ..Default::default()
        };
        let extra = render_map(&spec.labels, &data, query)
            .await
            .map_err(|e| template_error("failed to expand labels", e))?;
        for (k, v) in &extra {
            ls.add(k, v);
        }
        if !self.name.is_empty() {
            ls.add(ALERT_NAME_LABEL, &self.name);
        }
        if !self.owner.settings.disable_alert_group_label && !self.owner.group_name.is_empty() {
            ls.add(ALERT_GROUP_NAME_LABEL, &self.owner.group_name);
        }
        Ok(ls)
    }

    async fn expand_templates(
        &self,
        spec: &AlertingSpec,
        m: &Metric,
        query: &dyn TemplateQuery,
        ts: DateTime<Utc>,
    ) -> Result<(LabelSet, BTreeMap<String, String>)> {
        let ls = self.to_labels(spec, m, query).await?;
        let data = AlertTplData {
            labels: ls.origin.clone(),
            value: m.first_value(),
            expr: spec.expr.clone(),
            alert_id: hash_labels(&ls.processed),
            group_id: self.owner.group_id,
            active_at: ts,
            for_duration: spec.for_duration,
            external_labels: self.owner.settings.external_labels.clone(),
        };
        let annotations = render_map(&spec.annotations, &data, query)
            .await
            .map_err(|e| template_error("failed to template annotations", e))?;
        Ok((ls, annotations))
    }

    fn new_alert(
        &self,
        spec: &AlertingSpec,
        m: &Metric,
        active_at: DateTime<Utc>,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Alert {
        let mut a = Alert::new(&self.name, active_at);
        a.group_id = self.owner.group_id;
        a.expr = spec.expr.clone();
        a.for_duration = spec.for_duration;
        a.value = m.first_value();
        a.labels = labels;
        a.annotations = annotations;
        a
    }

    /// Evaluates the rule at `ts`, advancing the state of every alert.
    ///
    /// Returns `ALERTS` series for pending and firing alerts, plus
    /// `ALERTS_FOR_STATE` series when the rule has a `for` duration.
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

        let out = match res {
            Ok((qr, _)) => {
                self.log_debug(
                    spec.debug,
                    ts,
                    None,
                    &format!(
                        "query returned {} samples (elapsed: {:?})",
                        entry.samples, entry.duration
                    ),
                );
                self.apply(ctx, &spec, qr.data, ts, limit).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &out {
            entry.err = Some(e.to_string());
            metrics::counter!("oxrule_alerting_rules_errors_total", self.metric_labels())
                .increment(1);
        }
        self.state.add(entry);
        self.update_gauges();
        out
    }

    async fn apply(
        &self,
        ctx: &CancellationToken,
        spec: &AlertingSpec,
        data: Vec<Metric>,
        ts: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimeSeries>> {
        // Templates may run queries; render them before taking the lock.
        let query = DatasourceQuery {
            querier: spec.querier.as_ref(),
            ts,
            ctx,
        };
        let mut expanded = Vec::with_capacity(data.len());
        for m in &data {
            let e = self.expand_templates(spec, m, &query, ts).await?;
            expanded.push(e);
        }

        let mut alerts = self.write_alerts();
        let retention = Duration::minutes(RESOLVED_RETENTION_MINUTES);
        alerts.retain(|_, a| {
            let expired = a.state == AlertState::Inactive
                && a.resolved_at.is_some_and(|r| ts - r > retention);
            if expired {
                self.log_debug(spec.debug, ts, Some(a), "deleted as inactive");
            }
            !expired
        });

        let mut updated = HashSet::with_capacity(data.len());
        for (m, (ls, annotations)) in data.iter().zip(expanded) {
            let id = hash_labels(&ls.processed);
            if !updated.insert(id) {
                // usually caused by dropping __name__
                return Err(RuleError::Duplicate(format!(
                    "labels {}",
                    fmt_labels(&ls.processed)
                )));
            }
            if let Some(a) = alerts.get_mut(&id) {
                if a.state == AlertState::Inactive {
                    a.state = AlertState::Pending;
                    a.active_at = ts;
                    self.log_debug(spec.debug, ts, Some(a), "INACTIVE => PENDING");
                }
                a.value = m.first_value();
                a.annotations = annotations;
                a.keep_firing_since = None;
                continue;
            }
            let mut a = self.new_alert(spec, m, ts, ls.processed, annotations);
            a.id = id;
            a.state = AlertState::Pending;
            self.log_debug(spec.debug, ts, Some(&a), "created in state PENDING");
            alerts.insert(id, a);
        }

        let mut num_active_pending = 0usize;
        alerts.retain(|id, a| {
            if !updated.contains(id) {
                match a.state {
                    AlertState::Pending => {
                        self.log_debug(
                            spec.debug,
                            ts,
                            Some(a),
                            "PENDING => DELETED: is absent in current evaluation round",
                        );
                        return false;
                    }
                    AlertState::Firing => {
                        if spec.keep_firing_for > Duration::zero() && a.keep_firing_since.is_none() {
                            a.keep_firing_since = Some(ts);
                        }
                        let grace_over = a
                            .keep_firing_since
                            .map_or(true, |since| ts - since >= spec.keep_firing_for);
                        if grace_over {
                            a.state = AlertState::Inactive;
                            a.resolved_at = Some(ts);
                            self.log_debug(
                                spec.debug,
                                ts,
                                Some(a),
                                "FIRING => INACTIVE: is absent in current evaluation round",
                            );
                            return true;
                        }
                        self.log_debug(
                            spec.debug,
                            ts,
                            Some(a),
                            &format!(
                                "KEEP_FIRING: will keep firing for {}s since {:?}",
                                spec.keep_firing_for.num_seconds(),
                                a.keep_firing_since
                            ),
                        );
                    }
                    AlertState::Inactive => {}
                }
            }
            num_active_pending += 1;
            if a.state == AlertState::Pending && ts - a.active_at >= spec.for_duration {
                a.state = AlertState::Firing;
                a.start = Some(ts);
                metrics::counter!("oxrule_alerts_fired_total").increment(1);
                self.log_debug(
                    spec.debug,
                    ts,
                    Some(a),
                    &format!(
                        "PENDING => FIRING: {}s since becoming active at {}",
                        (ts - a.active_at).num_seconds(),
                        a.active_at.to_rfc3339()
                    ),
                );
            }
            true
        });

        if limit > 0 && num_active_pending > limit {
            alerts.clear();
            return Err(RuleError::LimitExceeded {
                limit,
                count: num_active_pending,
                kind: "alerts",
            });
        }

        let with_for_state = spec.for_duration > Duration::zero();
        Ok(alerts
            .values()
            .filter(|a| a.state != AlertState::Inactive)
            .flat_map(|a| alert_series(a, ts.timestamp(), with_for_state))
            .collect())
    }

    /// Replays the rule over `[start, end]` from a range query.
    ///
    /// State transitions follow gaps between consecutive points instead of
    /// wall-clock ticks. Alerts present at `end` are kept so the next call
    /// starting at that point continues from them.
    pub async fn exec_range(
        &self,
        ctx: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let spec = self.spec();
        let res = range_query(ctx, spec.querier.as_ref(), &spec.expr, start, end).await?;
        let query = NoQuery(REPLAY_QUERY_MSG);
        let previous = self.read_alerts().clone();
        let zero = DateTime::<Utc>::UNIX_EPOCH;
        let with_for_state = spec.for_duration > Duration::zero();

        let mut result = Vec::new();
        let mut hold = BTreeMap::new();
        for s in &res.data {
            let (ls, annotations) = self.expand_templates(&spec, s, &query, zero).await?;
            let id = hash_labels(&ls.processed);
            let mut a = self.new_alert(&spec, s, zero, ls.processed, annotations);
            a.id = id;

            let mut prev_t: Option<DateTime<Utc>> = None;
            for (i, &t) in s.timestamps.iter().enumerate() {
                let at = DateTime::from_timestamp(t, 0).unwrap_or(zero);
                if at == start {
                    if let Some(p) = previous.get(&id) {
                        a = p.clone();
                        prev_t = Some(at);
                    }
                }
                if prev_t.map_or(true, |p| at - p > spec.eval_interval) {
                    // a gap resets the alert to pending
                    a.state = AlertState::Pending;
                    a.active_at = at;
                    a.annotations = self
                        .expand_templates(&spec, s, &query, at)
                        .await
                        .map(|(_, an)| an)
                        .unwrap_or_default();
                    a.start = None;
                } else if at - a.active_at >= spec.for_duration && a.state != AlertState::Firing {
                    a.state = AlertState::Firing;
                    a.start = Some(at);
                }
                prev_t = Some(at);
                if spec.for_duration.is_zero() {
                    a.state = AlertState::Firing;
                }
                if let Some(&v) = s.values.get(i) {
                    a.value = v;
                }
                result.extend(alert_series(&a, t, with_for_state));
                if at == end {
                    hold.insert(id, a.clone());
                }
            }
        }
        *self.write_alerts() = hold;
        Ok(result)
    }

    /// Recovers `active_at` of pending alerts from `ALERTS_FOR_STATE`
    /// series written before a restart.
    pub async fn restore(
        &self,
        ctx: &CancellationToken,
        q: &dyn Querier,
        ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<()> {
        let spec = self.spec();
        if spec.for_duration <= Duration::zero() {
            return Ok(());
        }
        if self.read_alerts().is_empty() {
            return Ok(());
        }

        let expr = self.restore_expr(&spec, lookback);
        let (res, _) = instant_query(ctx, q, &expr, ts)
            .await
            .map_err(|e| match e {
                RuleError::Query { expr, source } => RuleError::Restore { expr, source },
                other => other,
            })?;
        if res.data.is_empty() {
            self.log_debug(spec.debug, ts, None, "no response was received from restore query");
            return Ok(());
        }

        let mut alerts = self.write_alerts();
        for mut series in res.data {
            series.del_label(METRIC_NAME_LABEL);
            let id = hash_labels(&series.label_map());
            let Some(a) = alerts.get_mut(&id) else {
                continue;
            };
            if a.restored || a.state != AlertState::Pending {
                continue;
            }
            a.active_at = DateTime::from_timestamp(series.first_value() as i64, 0)
                .unwrap_or(a.active_at);
            a.restored = true;
            tracing::info!(
                alert = %a.name,
                alert_id = a.id,
                active_at = %a.active_at.to_rfc3339(),
                "Alert restored"
            );
        }
        Ok(())
    }

    pub(crate) fn restore_expr(&self, spec: &AlertingSpec, lookback: Duration) -> String {
        let mut filter = if self.owner.settings.disable_alert_group_label {
            format!("{ALERT_NAME_LABEL}={:?}", self.name)
        } else {
            format!(
                "{ALERT_GROUP_NAME_LABEL}={:?},{ALERT_NAME_LABEL}={:?}",
                self.owner.group_name, self.name
            )
        };
        for (k, v) in &spec.labels {
            filter.push_str(&format!(",{k}={v:?}"));
        }
        format!(
            "last_over_time({ALERT_FOR_STATE_METRIC_NAME}{{{filter}}}[{}s])",
            lookback.num_seconds()
        )
    }

    /// Picks the alerts due for notification and stamps them as sent.
    ///
    /// Pending alerts are never sent. Alerts resolved or re-fired since the
    /// last notification go out immediately, the rest once `resend_delay`
    /// passed.
    pub fn alerts_to_send(
        &self,
        ts: DateTime<Utc>,
        resolve_duration: Duration,
        resend_delay: Duration,
    ) -> Vec<Alert> {
        let needs_sending = |a: &Alert| match a.state {
            AlertState::Pending => false,
            AlertState::Firing if a.end < a.last_sent => true,
            AlertState::Inactive if a.resolved_at > a.last_sent => true,
            _ => a.last_sent.map_or(true, |sent| sent + resend_delay <= ts),
        };

        let mut out = Vec::new();
        for a in self.write_alerts().values_mut() {
            if !needs_sending(a) {
                continue;
            }
            a.end = if a.state == AlertState::Inactive {
                a.resolved_at
            } else {
                Some(ts + resolve_duration)
            };
            a.last_sent = Some(ts);
            out.push(a.clone());
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn set_alerts(&self, alerts: Vec<Alert>) {
        *self.write_alerts() = alerts.into_iter().map(|a| (a.id, a)).collect();
    }
}

fn template_error(what: &str, e: NotifyError) -> RuleError {
    match e {
        NotifyError::Cancelled => RuleError::Cancelled,
        e => RuleError::Template(format!("{what}: {e}")),
    }
}

fn alert_series(a: &Alert, timestamp: i64, with_for_state: bool) -> Vec<TimeSeries> {
    let mut labels = a.labels.clone();
    labels.insert(METRIC_NAME_LABEL.to_string(), ALERT_METRIC_NAME.to_string());
    labels.insert(ALERT_STATE_LABEL.to_string(), a.state.to_string());
    let mut out = vec![TimeSeries::new(&[1.0], &[timestamp], &labels)];
    if with_for_state {
        let mut labels = a.labels.clone();
        labels.insert(
            METRIC_NAME_LABEL.to_string(),
            ALERT_FOR_STATE_METRIC_NAME.to_string(),
        );
        out.push(TimeSeries::new(
            &[a.active_at.timestamp() as f64],
            &[timestamp],
            &labels,
        ));
    }
    out
}
