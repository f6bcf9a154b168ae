use crate::config::GroupConfig;
use crate::executor::NotifierProvider;
use crate::group::Group;
use crate::settings::EngineSettings;
use futures::future::join_all;
use oxrule_datasource::QuerierBuilder;
use oxrule_remotewrite::RwClient;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Owns the running groups and applies rule file reloads to them.
pub struct Manager {
    qb: Arc<dyn QuerierBuilder>,
    rr: Option<Arc<dyn QuerierBuilder>>,
    rw: Option<Arc<dyn RwClient>>,
    notifiers: NotifierProvider,
    settings: Arc<EngineSettings>,
    ctx: CancellationToken,
    groups: RwLock<BTreeMap<u64, Arc<Group>>>,
    // serializes reloads
    update_lock: tokio::sync::Mutex<()>,
}

impl Manager {
    pub fn new(
        qb: Arc<dyn QuerierBuilder>,
        settings: Arc<EngineSettings>,
        notifiers: NotifierProvider,
        rw: Option<Arc<dyn RwClient>>,
        rr: Option<Arc<dyn QuerierBuilder>>,
    ) -> Self {
        Self {
            qb,
            rr,
            rw,
            notifiers,
            settings,
            ctx: CancellationToken::new(),
            groups: RwLock::new(BTreeMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Arc<Group>>> {
        self.groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Arc<Group>>> {
        self.groups
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Running groups ordered by ID.
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.read().values().cloned().collect()
    }

    pub fn group(&self, id: u64) -> Option<Arc<Group>> {
        self.read().get(&id).cloned()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Starts groups for `cfgs`.
    pub async fn start(&self, cfgs: &[GroupConfig]) {
        self.update(cfgs).await;
    }

    fn start_group(&self, group: &Arc<Group>) {
        group.start(
            self.ctx.clone(),
            Arc::clone(&self.notifiers),
            self.rw.clone(),
            self.rr.clone(),
        );
    }

    /// Reconciles running groups with `cfgs`.
    ///
    /// Groups missing from `cfgs` are closed, new ones started, and groups
    /// whose checksum changed are updated in place after their in-flight
    /// evaluation is interrupted.
    pub async fn update(&self, cfgs: &[GroupConfig]) {
        let _guard = self.update_lock.lock().await;

        let mut incoming: BTreeMap<u64, Arc<Group>> = cfgs
            .iter()
            .map(|cfg| {
                let g = Group::new(cfg, self.qb.as_ref(), Arc::clone(&self.settings));
                (g.id(), Arc::new(g))
            })
            .collect();

        let mut to_close = Vec::new();
        let mut to_update = Vec::new();
        for old in self.groups() {
            match incoming.remove(&old.id()) {
                None => to_close.push(old),
                Some(new) if new.checksum() != old.checksum() => to_update.push((old, new)),
                Some(_) => {}
            }
        }

        for g in &to_close {
            g.close().await;
            self.write().remove(&g.id());
        }
        for g in incoming.values() {
            self.start_group(g);
            self.write().insert(g.id(), Arc::clone(g));
        }
        join_all(to_update.iter().map(|(old, new)| async move {
            old.interrupt_eval();
            old.request_update(Arc::clone(new)).await;
        }))
        .await;

        tracing::info!(
            started = incoming.len(),
            updated = to_update.len(),
            stopped = to_close.len(),
            "rules reloaded"
        );
    }

    /// Stops every group, then flushes remote write.
    pub async fn close(&self) {
        let groups: Vec<Arc<Group>> = std::mem::take(&mut *self.write()).into_values().collect();
        join_all(groups.iter().map(|g| g.close())).await;
        self.ctx.cancel();
        if let Some(rw) = &self.rw {
            if let Err(e) = rw.close().await {
                tracing::error!(error = %e, "failed to close remote write client");
            }
        }
    }
}
