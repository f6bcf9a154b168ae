use crate::{RemoteWriteError, Result, RwClient};
use async_trait::async_trait;
use oxrule_common::TimeSeries;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Written {
    series: Vec<TimeSeries>,
    err: Option<String>,
    closed: bool,
}

/// Remote-write client collecting pushed series in memory.
#[derive(Clone, Default)]
pub struct FakeRwClient {
    inner: Arc<Mutex<Written>>,
}

impl FakeRwClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Written> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn series(&self) -> Vec<TimeSeries> {
        self.lock().series.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().series.is_empty()
    }

    /// Forgets everything pushed so far.
    pub fn clear(&self) {
        self.lock().series.clear();
    }

    /// Makes every following `push` fail with `msg`.
    pub fn set_err(&self, msg: &str) {
        self.lock().err = Some(msg.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl RwClient for FakeRwClient {
    fn push(&self, series: TimeSeries) -> Result<()> {
        let mut w = self.lock();
        if w.closed {
            return Err(RemoteWriteError::Closed);
        }
        if let Some(msg) = &w.err {
            return Err(RemoteWriteError::Other(msg.clone()));
        }
        w.series.push(series);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
