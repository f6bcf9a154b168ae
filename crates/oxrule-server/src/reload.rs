use oxrule_engine::{config, GroupConfig, Manager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Identity of a loaded rule set: `(file, group, checksum)` per group.
pub type Fingerprint = Vec<(String, String, String)>;

pub fn fingerprint(cfgs: &[GroupConfig]) -> Fingerprint {
    cfgs.iter()
        .map(|g| (g.file.clone(), g.name.clone(), g.checksum.clone()))
        .collect()
}

/// Re-reads rule files and applies them when anything changed.
///
/// Returns whether the manager was updated. On error the running groups are
/// left untouched.
pub async fn reload_once(
    manager: &Manager,
    patterns: &[String],
    last: &mut Fingerprint,
) -> anyhow::Result<bool> {
    let cfgs = config::load(patterns)?;
    let current = fingerprint(&cfgs);
    if current == *last {
        return Ok(false);
    }
    manager.update(&cfgs).await;
    *last = current;
    Ok(true)
}

/// Periodically reloads rule files until `ctx` is cancelled.
pub fn spawn(
    manager: Arc<Manager>,
    patterns: Vec<String>,
    every: Duration,
    mut last: Fingerprint,
    ctx: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately; rules were just loaded
        tick.tick().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tick.tick() => {}
            }
            metrics::counter!("oxrule_config_reloads_total").increment(1);
            match reload_once(&manager, &patterns, &mut last).await {
                Ok(changed) => {
                    metrics::gauge!("oxrule_config_last_reload_successful").set(1.0);
                    if changed {
                        tracing::info!(groups = last.len(), "Rule files reloaded");
                    }
                }
                Err(e) => {
                    metrics::counter!("oxrule_config_reload_errors_total").increment(1);
                    metrics::gauge!("oxrule_config_last_reload_successful").set(0.0);
                    tracing::error!(error = %e, "Failed to reload rule files, keeping previous rules");
                }
            }
        }
    })
}
