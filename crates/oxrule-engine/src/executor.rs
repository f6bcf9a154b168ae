use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::settings::{to_chrono, EngineSettings};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use oxrule_common::types::stale_nan;
use oxrule_common::{Label, Sample, TimeSeries};
use oxrule_notify::Notifier;
use oxrule_remotewrite::RwClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Resolves the notifiers to use at the moment alerts are sent, so a
/// reload can swap them without restarting groups.
pub type NotifierProvider = Arc<dyn Fn() -> Vec<Arc<dyn Notifier>> + Send + Sync>;

type SentSeries = HashMap<u64, HashMap<String, Vec<Label>>>;

/// Runs rules of one group and forwards their output.
///
/// Series go to remote write, alerts to every notifier. The executor also
/// remembers what each rule wrote last time so vanished series can be
/// closed with a staleness marker.
pub struct Executor {
    rw: Option<Arc<dyn RwClient>>,
    notifiers: NotifierProvider,
    notifier_headers: RwLock<BTreeMap<String, String>>,
    previously_sent: Mutex<SentSeries>,
    settings: Arc<EngineSettings>,
}

impl Executor {
    pub fn new(
        notifiers: NotifierProvider,
        rw: Option<Arc<dyn RwClient>>,
        notifier_headers: BTreeMap<String, String>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            rw,
            notifiers,
            notifier_headers: RwLock::new(notifier_headers),
            previously_sent: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn set_notifier_headers(&self, headers: BTreeMap<String, String>) {
        *self
            .notifier_headers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = headers;
    }

    fn notifier_headers(&self) -> BTreeMap<String, String> {
        self.notifier_headers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn sent(&self) -> MutexGuard<'_, SentSeries> {
        self.previously_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Executes `rules`, returning one result per rule in rule order.
    ///
    /// With `concurrency == 1` rules run one after another; otherwise at
    /// most `concurrency` evaluations are in flight at once.
    pub async fn exec_concurrently(
        &self,
        ctx: &CancellationToken,
        rules: &[Arc<Rule>],
        ts: DateTime<Utc>,
        concurrency: usize,
        resolve_duration: Duration,
        limit: usize,
    ) -> Vec<Result<()>> {
        if concurrency <= 1 {
            let mut out = Vec::with_capacity(rules.len());
            for rule in rules {
                out.push(self.exec(ctx, rule, ts, resolve_duration, limit).await);
            }
            return out;
        }

        let sem = Semaphore::new(concurrency);
        let sem = &sem;
        join_all(rules.iter().map(|rule| async move {
            let _permit = sem.acquire().await.ok();
            self.exec(ctx, rule, ts, resolve_duration, limit).await
        }))
        .await
    }

    /// Evaluates one rule and ships its output.
    ///
    /// Cancellation is not an error. Every series is pushed even if some
    /// pushes fail; the last failure is returned.
    pub async fn exec(
        &self,
        ctx: &CancellationToken,
        rule: &Rule,
        ts: DateTime<Utc>,
        resolve_duration: Duration,
        limit: usize,
    ) -> Result<()> {
        metrics::counter!("oxrule_execution_total").increment(1);

        let tss = match rule.exec(ctx, ts, limit).await {
            Ok(tss) => tss,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => {
                metrics::counter!("oxrule_execution_errors_total").increment(1);
                return Err(RuleError::Exec {
                    rule: rule.name().to_string(),
                    source: Box::new(e),
                });
            }
        };

        if let Some(rw) = &self.rw {
            push_all(rw.as_ref(), rule, &tss)?;
            let stale = self.stale_series(rule, &tss, ts);
            push_all(rw.as_ref(), rule, &stale)?;
        }

        let Some(ar) = rule.as_alerting() else {
            return Ok(());
        };
        let alerts = ar.alerts_to_send(ts, resolve_duration, to_chrono(self.settings.resend_delay));
        if alerts.is_empty() {
            return Ok(());
        }

        let headers = self.notifier_headers();
        let notifiers = (self.notifiers)();
        let results = join_all(notifiers.iter().map(|nt| {
            let alerts = &alerts;
            let headers = &headers;
            async move {
                let sent = tokio::select! {
                    // interrupted delivery is not a failure
                    _ = ctx.cancelled() => return Ok(()),
                    res = nt.send(alerts, headers) => res.map_err(|e| e.to_string()),
                };
                sent.map_err(|e| {
                    format!(
                        "rule {:?}: failed to send alerts to addr {:?}: {e}",
                        rule.name(),
                        nt.addr()
                    )
                })
            }
        }))
        .await;

        let errs: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Notify(errs))
        }
    }

    /// Series written for `rule` last time but absent from `tss`, each
    /// carrying a staleness marker at `ts`.
    fn stale_series(&self, rule: &Rule, tss: &[TimeSeries], ts: DateTime<Utc>) -> Vec<TimeSeries> {
        let current: HashMap<String, Vec<Label>> = tss
            .iter()
            .map(|s| (s.labels_string(), s.labels.clone()))
            .collect();

        let mut sent = self.sent();
        let stale = sent
            .get(&rule.id())
            .map(|prev| {
                prev.iter()
                    .filter(|(key, _)| !current.contains_key(*key))
                    .map(|(_, labels)| {
                        TimeSeries::from_labels(
                            labels.clone(),
                            vec![Sample {
                                value: stale_nan(),
                                timestamp: ts.timestamp() * 1000,
                            }],
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        sent.insert(rule.id(), current);
        stale
    }

    /// Forgets written series of rules no longer in `active`.
    pub fn purge_stale_series(&self, active: &[Arc<Rule>]) {
        let mut sent = self.sent();
        let mut kept = HashMap::with_capacity(active.len());
        for rule in active {
            if let Some(prev) = sent.remove(&rule.id()) {
                kept.insert(rule.id(), prev);
            }
        }
        *sent = kept;
    }

    #[cfg(test)]
    pub(crate) fn tracked_rules(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sent().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn push_all(rw: &dyn RwClient, rule: &Rule, tss: &[TimeSeries]) -> Result<()> {
    let mut last_err = None;
    for ts in tss {
        if let Err(e) = rw.push(ts.clone()) {
            last_err = Some(RuleError::RemoteWrite {
                rule: rule.name().to_string(),
                source: e,
            });
        }
    }
    last_err.map_or(Ok(()), Err)
}
