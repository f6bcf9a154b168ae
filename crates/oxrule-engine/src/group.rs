use crate::alerting::AlertingRule;
use crate::config::{GroupConfig, RuleConfig};
use crate::error::{Result, RuleError};
use crate::executor::{Executor, NotifierProvider};
use crate::recording::RecordingRule;
use crate::rule::{Rule, RuleOwner};
use crate::settings::{to_chrono, EngineSettings};
use chrono::{DateTime, DurationRound, Utc};
use fnv::FnvHasher;
use oxrule_datasource::QuerierBuilder;
use oxrule_remotewrite::RwClient;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Part of a group that a hot update replaces.
#[derive(Clone)]
pub struct GroupSpec {
    pub rules: Vec<Arc<Rule>>,
    pub datasource_type: String,
    pub limit: usize,
    pub concurrency: usize,
    pub params: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    pub notifier_headers: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub checksum: String,
}

/// A set of rules evaluated together on a fixed interval.
///
/// Every rule of a group sees the same evaluation timestamp per tick. The
/// group runs in its own task once [`Group::start`] is called and accepts
/// configuration updates through [`Group::request_update`] without losing
/// alert state.
pub struct Group {
    id: u64,
    name: String,
    file: String,
    interval: Duration,
    eval_offset: Option<Duration>,
    eval_delay: Option<Duration>,
    eval_alignment: Option<bool>,
    settings: Arc<EngineSettings>,

    spec: RwLock<GroupSpec>,
    last_evaluation: Mutex<Option<DateTime<Utc>>>,

    eval_cancel: Mutex<CancellationToken>,
    done: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    update_tx: mpsc::Sender<Arc<Group>>,
    update_rx: Mutex<Option<mpsc::Receiver<Arc<Group>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Merges two label sets, `overrides` winning on conflicts.
fn merge_labels(
    group: &str,
    rule: &str,
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base.clone();
    for (k, v) in overrides {
        if let Some(prev) = out.insert(k.clone(), v.clone()) {
            if &prev != v {
                tracing::info!(
                    group = %group,
                    rule = %rule,
                    label = %k,
                    from = %prev,
                    to = %v,
                    "label overwritten"
                );
            }
        }
    }
    out
}

impl Group {
    pub fn new(cfg: &GroupConfig, qb: &dyn QuerierBuilder, settings: Arc<EngineSettings>) -> Self {
        let interval = cfg
            .interval
            .filter(|d| !d.is_zero())
            .unwrap_or(settings.default_interval);
        let datasource_type = cfg.datasource_type().to_string();
        let id = group_id(&cfg.file, &cfg.name, &datasource_type, interval, cfg.eval_offset);

        let headers = cfg.header_map();
        let owner = RuleOwner {
            group_id: id,
            group_name: cfg.name.clone(),
            file: cfg.file.clone(),
            datasource_type: datasource_type.clone(),
            interval,
            params: cfg.params.clone(),
            headers: headers.clone(),
            settings: Arc::clone(&settings),
        };
        let rules = cfg
            .rules
            .iter()
            .map(|r| Arc::new(new_rule(qb, &owner, &cfg.labels, r)))
            .collect();

        let (update_tx, update_rx) = mpsc::channel(1);
        Self {
            id,
            name: cfg.name.clone(),
            file: cfg.file.clone(),
            interval,
            eval_offset: cfg.eval_offset,
            eval_delay: cfg.eval_delay,
            eval_alignment: cfg.eval_alignment,
            settings,
            spec: RwLock::new(GroupSpec {
                rules,
                datasource_type,
                limit: usize::try_from(cfg.limit).unwrap_or(0),
                concurrency: usize::try_from(cfg.concurrency).unwrap_or(0).max(1),
                params: cfg.params.clone(),
                headers,
                notifier_headers: cfg.notifier_header_map(),
                labels: cfg.labels.clone(),
                checksum: cfg.checksum.clone(),
            }),
            last_evaluation: Mutex::new(None),
            eval_cancel: Mutex::new(CancellationToken::new()),
            done: CancellationToken::new(),
            handle: Mutex::new(None),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn eval_offset(&self) -> Option<Duration> {
        self.eval_offset
    }

    pub fn eval_delay(&self) -> Option<Duration> {
        self.eval_delay
    }

    pub fn spec(&self) -> GroupSpec {
        self.spec
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.spec().rules
    }

    pub fn checksum(&self) -> String {
        self.spec().checksum
    }

    /// Wall-clock start of the latest evaluation.
    pub fn last_evaluation(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_evaluation)
    }

    fn owner(&self, spec: &GroupSpec) -> RuleOwner {
        RuleOwner {
            group_id: self.id,
            group_name: self.name.clone(),
            file: self.file.clone(),
            datasource_type: spec.datasource_type.clone(),
            interval: self.interval,
            params: spec.params.clone(),
            headers: spec.headers.clone(),
            settings: Arc::clone(&self.settings),
        }
    }

    fn metric_labels(&self) -> Vec<metrics::Label> {
        vec![
            metrics::Label::new("group", self.name.clone()),
            metrics::Label::new("file", self.file.clone()),
        ]
    }

    fn log_info(&self, msg: &str) {
        tracing::info!(
            group = %self.name,
            interval = %humantime::format_duration(self.interval),
            eval_offset = ?self.eval_offset.map(humantime::format_duration),
            concurrency = self.spec().concurrency,
            "{msg}"
        );
    }

    /// Spawns the evaluation loop. Stopped by [`Group::close`] or by
    /// cancelling `ctx`.
    pub fn start(
        self: &Arc<Self>,
        ctx: CancellationToken,
        notifiers: NotifierProvider,
        rw: Option<Arc<dyn RwClient>>,
        rr: Option<Arc<dyn QuerierBuilder>>,
    ) {
        let group = Arc::clone(self);
        let handle = tokio::spawn(async move { group.run(ctx, notifiers, rw, rr).await });
        *lock(&self.handle) = Some(handle);
    }

    async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        notifiers: NotifierProvider,
        rw: Option<Arc<dyn RwClient>>,
        rr: Option<Arc<dyn QuerierBuilder>>,
    ) {
        let updates = lock(&self.update_rx).take();
        let Some(mut updates) = updates else {
            tracing::warn!(group = %self.name, "group is already running");
            return;
        };

        let mut eval_ts = Utc::now();
        if !self.settings.skip_rand_sleep_on_group_start {
            let delay = delay_before_start(eval_ts, self.id, self.interval, self.eval_offset);
            self.log_info(&format!("will start in {}", humantime::format_duration(delay)));
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            eval_ts += to_chrono(delay);
        }

        let executor = Executor::new(
            notifiers,
            rw,
            self.spec().notifier_headers,
            Arc::clone(&self.settings),
        );
        self.log_info("started");

        let mut eval_ctx = ctx.child_token();
        *lock(&self.eval_cancel) = eval_ctx.clone();

        self.eval(&eval_ctx, &executor, eval_ts).await;

        // only alerts that are active after the first evaluation get restored
        if let Some(rr) = &rr {
            let lookback = to_chrono(self.settings.remote_read_lookback);
            if let Err(e) = self.restore(&ctx, rr.as_ref(), eval_ts, lookback).await {
                tracing::error!(group = %self.name, error = %e, "failed to restore rules state");
            }
        }

        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::info!(group = %self.name, "context cancelled");
                    return;
                }
                _ = self.done.cancelled() => {
                    tracing::info!(group = %self.name, "received stop signal");
                    return;
                }
                Some(ng) = updates.recv() => {
                    // the previous token was cancelled by whoever sent the update
                    eval_ctx = ctx.child_token();
                    *lock(&self.eval_cancel) = eval_ctx.clone();

                    if let Err(e) = self.update_with(&ng) {
                        tracing::error!(group = %self.name, error = %e, "failed to update");
                        continue;
                    }
                    let spec = self.spec();
                    executor.purge_stale_series(&spec.rules);
                    executor.set_notifier_headers(spec.notifier_headers);
                    self.log_info("re-started");
                }
                _ = ticker.tick() => {
                    let (next, missed) = next_eval_ts(eval_ts, Utc::now(), period);
                    eval_ts = next;
                    if missed > 0 {
                        metrics::counter!("oxrule_iteration_missed_total", self.metric_labels())
                            .increment(missed);
                    }
                    self.eval(&eval_ctx, &executor, eval_ts).await;
                }
            }
        }
    }

    async fn eval(&self, ctx: &CancellationToken, executor: &Executor, ts: DateTime<Utc>) {
        metrics::counter!("oxrule_iteration_total", self.metric_labels()).increment(1);
        let started = Utc::now();
        let timer = Instant::now();

        let spec = self.spec();
        if !spec.rules.is_empty() {
            let resolve = get_resolve_duration(
                self.interval,
                self.settings.resend_delay,
                self.settings.max_resolve_duration,
            );
            let ts = self.adjust_req_timestamp(ts);
            let results = executor
                .exec_concurrently(
                    ctx,
                    &spec.rules,
                    ts,
                    spec.concurrency,
                    to_chrono(resolve),
                    spec.limit,
                )
                .await;
            for err in results.into_iter().filter_map(|r| r.err()) {
                tracing::error!(group = %self.name, error = %err, "rule evaluation failed");
            }
        }

        metrics::histogram!("oxrule_iteration_duration_seconds", self.metric_labels())
            .record(timer.elapsed().as_secs_f64());
        metrics::gauge!("oxrule_iteration_interval_seconds", self.metric_labels())
            .set(self.interval.as_secs_f64());
        *lock(&self.last_evaluation) = Some(started);
    }

    /// Evaluates every rule once at `ts`, without timestamp adjustment.
    pub async fn exec_once(
        &self,
        ctx: &CancellationToken,
        notifiers: NotifierProvider,
        rw: Option<Arc<dyn RwClient>>,
        ts: DateTime<Utc>,
    ) -> Vec<RuleError> {
        let spec = self.spec();
        if spec.rules.is_empty() {
            return Vec::new();
        }
        let executor = Executor::new(
            notifiers,
            rw,
            spec.notifier_headers.clone(),
            Arc::clone(&self.settings),
        );
        let resolve = get_resolve_duration(
            self.interval,
            self.settings.resend_delay,
            self.settings.max_resolve_duration,
        );
        executor
            .exec_concurrently(ctx, &spec.rules, ts, spec.concurrency, to_chrono(resolve), spec.limit)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect()
    }

    /// Restores `active_at` of pending alerts for rules with a `for`
    /// duration, querying through `rr`.
    pub async fn restore(
        &self,
        ctx: &CancellationToken,
        rr: &dyn QuerierBuilder,
        ts: DateTime<Utc>,
        lookback: chrono::Duration,
    ) -> Result<()> {
        let spec = self.spec();
        let owner = self.owner(&spec);
        for rule in &spec.rules {
            let Some(ar) = rule.as_alerting() else {
                continue;
            };
            let rs = ar.spec();
            if rs.for_duration <= chrono::Duration::zero() {
                continue;
            }
            let q = owner.querier(rr, rs.debug);
            ar.restore(ctx, q.as_ref(), ts, lookback)
                .await
                .map_err(|e| RuleError::RestoreRule {
                    rule: ar.name().to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Evaluates every rule over `[start, end)` in chunks of
    /// `max_data_points` intervals and pushes the results to `rw`.
    ///
    /// Returns the number of pushed samples.
    #[allow(clippy::too_many_arguments)]
    pub async fn replay(
        &self,
        ctx: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        rw: &dyn RwClient,
        max_data_points: usize,
        retry_attempts: usize,
        replay_delay: Duration,
    ) -> Result<usize> {
        let spec = self.spec();
        let step = to_chrono(self.interval) * i32::try_from(max_data_points.max(1)).unwrap_or(i32::MAX);
        let requests = RangeIterator::new(start, end, step).count();
        tracing::info!(
            group = %self.name,
            interval = %humantime::format_duration(self.interval),
            requests,
            max_range = %step,
            "replaying group"
        );
        if spec.limit > 0 {
            tracing::info!(group = %self.name, limit = spec.limit, "`limit` has no effect during replay");
        }

        let mut total = 0;
        for rule in &spec.rules {
            tracing::info!(group = %self.name, rule = %rule, rule_id = rule.id(), "replaying rule");
            for (s, e) in RangeIterator::new(start, end, step) {
                total += replay_rule(ctx, rule, s, e, rw, retry_attempts).await?;
            }
            // let the storage flush so chained rules see the data
            tokio::time::sleep(replay_delay).await;
        }
        Ok(total)
    }

    /// Applies a newer version of this group.
    ///
    /// Rules are matched by ID: matched ones take the new configuration but
    /// keep their alerts and history, missing ones are closed, new ones are
    /// appended. The interval is not changed here; a different interval
    /// yields a different group ID.
    pub fn update_with(&self, new: &Group) -> Result<()> {
        let new_spec = new.spec();
        let mut spec = self
            .spec
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut incoming = new_spec.rules.clone();
        let mut rules = Vec::with_capacity(incoming.len());
        let mut removed = Vec::new();
        for old in &spec.rules {
            match incoming.iter().position(|nr| nr.id() == old.id()) {
                Some(pos) => {
                    let nr = incoming.remove(pos);
                    old.update_with(&nr)?;
                    rules.push(Arc::clone(old));
                }
                None => removed.push(Arc::clone(old)),
            }
        }
        rules.extend(incoming);
        for r in removed {
            r.close();
        }

        *spec = GroupSpec { rules, ..new_spec };
        Ok(())
    }

    /// Hands a newer version of the group to the running loop. Callers
    /// interrupt the in-flight evaluation first with [`Group::interrupt_eval`].
    pub async fn request_update(&self, new: Arc<Group>) {
        if self.update_tx.send(new).await.is_err() {
            tracing::warn!(group = %self.name, "group is not running, update dropped");
        }
    }

    /// Cancels the evaluation currently in flight, if any.
    pub fn interrupt_eval(&self) {
        lock(&self.eval_cancel).cancel();
    }

    /// Stops the loop and waits for it to exit, then releases rule metrics.
    pub async fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        self.interrupt_eval();
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(group = %self.name, error = %e, "group task ended abnormally");
            }
        }
        for rule in self.rules() {
            rule.close();
        }
    }

    /// Timestamp the datasource is queried at for a tick fired at `ts`.
    pub fn adjust_req_timestamp(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval = to_chrono(self.interval);
        if let Some(offset) = self.eval_offset {
            let ts_offset = truncate(ts, interval) + to_chrono(offset);
            // before the offset point of this interval: use the previous one
            if ts < ts_offset {
                return ts_offset - interval;
            }
            return ts_offset;
        }

        let delay = self.eval_delay.unwrap_or(self.settings.eval_delay);
        let ts = ts - to_chrono(delay);
        if self.eval_alignment.unwrap_or(true) {
            return truncate(ts, interval);
        }
        ts
    }
}

fn new_rule(
    qb: &dyn QuerierBuilder,
    owner: &RuleOwner,
    group_labels: &BTreeMap<String, String>,
    cfg: &RuleConfig,
) -> Rule {
    let mut labels = owner.settings.external_labels.clone();
    if !group_labels.is_empty() {
        labels = merge_labels(&owner.group_name, cfg.name(), &labels, group_labels);
    }
    if !cfg.labels.is_empty() {
        labels = merge_labels(&owner.group_name, cfg.name(), &labels, &cfg.labels);
    }
    if cfg.is_alerting() {
        Rule::Alerting(AlertingRule::new(qb, owner, cfg, labels))
    } else {
        Rule::Recording(RecordingRule::new(qb, owner, cfg, labels))
    }
}

/// Identity of a group; changes when its file, name, type, interval or
/// offset change.
fn group_id(
    file: &str,
    name: &str,
    datasource_type: &str,
    interval: Duration,
    eval_offset: Option<Duration>,
) -> u64 {
    let mut h = FnvHasher::default();
    h.write(file.as_bytes());
    h.write(&[0xff]);
    h.write(name.as_bytes());
    h.write(datasource_type.as_bytes());
    h.write(humantime::format_duration(interval).to_string().as_bytes());
    if let Some(offset) = eval_offset {
        h.write(humantime::format_duration(offset).to_string().as_bytes());
    }
    h.finish()
}

fn truncate(ts: DateTime<Utc>, interval: chrono::Duration) -> DateTime<Utc> {
    if interval <= chrono::Duration::zero() {
        return ts;
    }
    ts.duration_trunc(interval).unwrap_or(ts)
}

/// Delay before the first evaluation of a group.
///
/// The delay is derived from `key` so groups sharing an interval spread
/// over it, and lands within `[ts, ts + interval)` plus `offset` when the
/// computed point falls before the offset of its interval.
pub fn delay_before_start(
    ts: DateTime<Utc>,
    key: u64,
    interval: Duration,
    offset: Option<Duration>,
) -> Duration {
    let interval_ns = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
    if interval_ns <= 0 {
        return Duration::ZERO;
    }
    let mut rand_sleep = (interval_ns as f64 * (key as f64 / 18_446_744_073_709_551_616.0)) as i64;
    let ts_ns = ts.timestamp_nanos_opt().unwrap_or_default();
    let sleep_offset = ts_ns.rem_euclid(interval_ns);
    if rand_sleep < sleep_offset {
        rand_sleep += interval_ns;
    }
    rand_sleep -= sleep_offset;

    if let Some(offset) = offset {
        let offset_ns = i64::try_from(offset.as_nanos()).unwrap_or(i64::MAX);
        let next = ts_ns + rand_sleep;
        let interval_start = next - next.rem_euclid(interval_ns);
        if next < interval_start + offset_ns {
            rand_sleep += offset_ns;
        }
    }
    Duration::from_nanos(u64::try_from(rand_sleep).unwrap_or(0))
}

/// Timestamp of the evaluation following the one at `prev`, and the number
/// of whole intervals skipped because the loop fell behind `now`.
///
/// The result stays on the `prev + k * interval` grid.
pub fn next_eval_ts(
    prev: DateTime<Utc>,
    now: DateTime<Utc>,
    interval: Duration,
) -> (DateTime<Utc>, u64) {
    let interval_ns = to_chrono(interval).num_nanoseconds().unwrap_or(i64::MAX).max(1);
    let elapsed = (now - prev).num_nanoseconds().unwrap_or(i64::MAX);
    let missed = (elapsed / interval_ns - 1).max(0);
    let next = prev + chrono::Duration::nanoseconds(interval_ns.saturating_mul(missed + 1));
    (next, missed as u64)
}

/// How long after the last notification a firing alert counts as resolved
/// by the receiver.
pub fn get_resolve_duration(interval: Duration, resend_delay: Duration, max: Duration) -> Duration {
    let resolve = interval.max(resend_delay) * 4;
    if !max.is_zero() && resolve > max {
        return max;
    }
    resolve
}

/// Splits `[start, end)` into consecutive windows of at most `step`.
#[derive(Debug, Clone)]
pub struct RangeIterator {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: chrono::Duration,
    iter: i32,
}

impl RangeIterator {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            start,
            end,
            step,
            iter: 0,
        }
    }
}

impl Iterator for RangeIterator {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.step <= chrono::Duration::zero() {
            return None;
        }
        let s = self.start + self.step * self.iter;
        if self.end <= s {
            return None;
        }
        let e = (s + self.step).min(self.end);
        self.iter += 1;
        Some((s, e))
    }
}

async fn replay_rule(
    ctx: &CancellationToken,
    rule: &Rule,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rw: &dyn RwClient,
    retry_attempts: usize,
) -> Result<usize> {
    let attempts = retry_attempts.max(1);
    let mut attempt = 0;
    let tss = loop {
        attempt += 1;
        match rule.exec_range(ctx, start, end).await {
            Ok(tss) => break tss,
            Err(e) if attempt >= attempts || e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::error!(rule = %rule, attempt, error = %e, "replay attempt failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let mut n = 0;
    for ts in tss {
        let samples = ts.samples.len();
        rw.push(ts).map_err(|e| RuleError::RemoteWrite {
            rule: rule.name().to_string(),
            source: e,
        })?;
        n += samples;
    }
    Ok(n)
}
