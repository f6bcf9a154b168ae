use crate::{Notifier, NotifyError, Result};
use async_trait::async_trait;
use oxrule_common::Alert;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Received {
    alerts: Vec<Alert>,
    headers: BTreeMap<String, String>,
    batches: usize,
    err: Option<String>,
}

/// Notifier that keeps the last received batch in memory.
#[derive(Clone, Default)]
pub struct FakeNotifier {
    inner: Arc<Mutex<Received>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Received> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following `send` fail with `msg`.
    pub fn set_err(&self, msg: &str) {
        self.lock().err = Some(msg.to_string());
    }

    /// Alerts of the last successful batch.
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.lock().headers.clone()
    }

    /// Number of successful `send` calls.
    pub fn batches(&self) -> usize {
        self.lock().batches
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, alerts: &[Alert], headers: &BTreeMap<String, String>) -> Result<()> {
        let mut received = self.lock();
        if let Some(msg) = &received.err {
            return Err(NotifyError::Other(msg.clone()));
        }
        received.alerts = alerts.to_vec();
        received.headers = headers.clone();
        received.batches += 1;
        Ok(())
    }

    fn addr(&self) -> &str {
        "fake"
    }
}
