use crate::proto::encode_write_request;
use crate::{RemoteWriteError, Result, RwClient};
use async_trait::async_trait;
use oxrule_common::TimeSeries;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const WRITE_PATH: &str = "/api/v1/write";

/// Settings of the batching remote-write client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote storage.
    pub addr: String,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    /// Number of workers shipping batches in parallel.
    pub concurrency: usize,
    pub flush_interval: Duration,
    /// First retry delay; doubles on every failed attempt.
    pub retry_min_interval: Duration,
    /// Upper bound for the total time spent retrying one batch.
    pub retry_max_time: Duration,
    pub headers: BTreeMap<String, String>,
    pub bearer_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: String::new(),
            max_batch_size: 1000,
            max_queue_size: 100_000,
            concurrency: 4,
            flush_interval: Duration::from_secs(5),
            retry_min_interval: Duration::from_secs(1),
            retry_max_time: Duration::from_secs(30),
            headers: BTreeMap::new(),
            bearer_token: None,
        }
    }
}

struct Shipper {
    client: reqwest::Client,
    url: String,
    cfg: Config,
}

/// Queueing remote-write client.
///
/// `push` never blocks: series go into a bounded channel and are shipped by
/// background workers either when a batch fills up or on every flush
/// interval.
pub struct Client {
    tx: Mutex<Option<mpsc::Sender<TimeSeries>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Starts the workers; must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the address is empty or a size setting is zero.
    pub fn new(cfg: Config, client: reqwest::Client) -> Result<Self> {
        if cfg.addr.is_empty() {
            return Err(RemoteWriteError::InvalidConfig("addr can't be empty".to_string()));
        }
        if cfg.max_batch_size == 0 || cfg.max_queue_size == 0 || cfg.concurrency == 0 {
            return Err(RemoteWriteError::InvalidConfig(
                "max_batch_size, max_queue_size and concurrency must be positive".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(cfg.max_queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shipper = Arc::new(Shipper {
            client,
            url: format!("{}{}", cfg.addr.trim_end_matches('/'), WRITE_PATH),
            cfg,
        });

        let workers = (0..shipper.cfg.concurrency)
            .map(|_| {
                let rx = rx.clone();
                let shipper = shipper.clone();
                tokio::spawn(async move { shipper.run(rx).await })
            })
            .collect();

        tracing::info!(
            url = %shipper.url,
            concurrency = shipper.cfg.concurrency,
            max_batch_size = shipper.cfg.max_batch_size,
            "Remote write client started"
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }
}

#[async_trait]
impl RwClient for Client {
    fn push(&self, series: TimeSeries) -> Result<()> {
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = guard.as_ref().ok_or(RemoteWriteError::Closed)?;
        tx.try_send(series).map_err(|e| match e {
            TrySendError::Full(_) => {
                metrics::counter!("oxrule_remotewrite_dropped_rows_total").increment(1);
                RemoteWriteError::QueueFull
            }
            TrySendError::Closed(_) => RemoteWriteError::Closed,
        })
    }

    async fn close(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if tx.is_none() {
            return Err(RemoteWriteError::Closed);
        }
        drop(tx);

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for w in workers {
            if let Err(e) = w.await {
                tracing::error!(error = %e, "Remote write worker panicked");
            }
        }
        tracing::info!("Remote write client stopped");
        Ok(())
    }
}

impl Shipper {
    async fn run(&self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TimeSeries>>>) {
        loop {
            let mut batch = Vec::with_capacity(self.cfg.max_batch_size);
            let closed = self.collect(&rx, &mut batch).await;
            if !batch.is_empty() {
                self.flush(batch).await;
            }
            if closed {
                return;
            }
        }
    }

    /// Fills `batch` until it is full or the flush interval passes.
    /// Returns true once the channel is closed and drained.
    async fn collect(
        &self,
        rx: &tokio::sync::Mutex<mpsc::Receiver<TimeSeries>>,
        batch: &mut Vec<TimeSeries>,
    ) -> bool {
        let deadline = Instant::now() + self.cfg.flush_interval;
        let mut rx = rx.lock().await;
        while batch.len() < self.cfg.max_batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ts)) => batch.push(ts),
                Ok(None) => return true,
                Err(_) => break,
            }
        }
        false
    }

    async fn flush(&self, batch: Vec<TimeSeries>) {
        let rows: usize = batch.iter().map(|ts| ts.samples.len()).sum();
        let body = match encode_write_request(&batch) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode remote write request");
                metrics::counter!("oxrule_remotewrite_dropped_rows_total").increment(rows as u64);
                return;
            }
        };

        let started = Instant::now();
        let mut backoff = self.cfg.retry_min_interval;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.send(body.clone()).await {
                Ok(()) => {
                    metrics::counter!("oxrule_remotewrite_sent_rows_total").increment(rows as u64);
                    return;
                }
                Err(e) => e,
            };
            metrics::counter!("oxrule_remotewrite_errors_total").increment(1);
            if !err.is_retriable() {
                tracing::error!(error = %err, rows, "Remote write rejected the batch, dropping it");
                metrics::counter!("oxrule_remotewrite_dropped_rows_total").increment(rows as u64);
                return;
            }
            if started.elapsed() + backoff > self.cfg.retry_max_time {
                tracing::error!(
                    error = %err,
                    attempts = attempt,
                    rows,
                    "Remote write retries exhausted, dropping batch"
                );
                metrics::counter!("oxrule_remotewrite_dropped_rows_total").increment(rows as u64);
                return;
            }
            tracing::warn!(
                error = %err,
                attempt,
                retry_in = ?backoff,
                "Remote write failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.cfg.retry_max_time);
        }
    }

    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let mut req = self
            .client
            .post(self.url.as_str())
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body);
        for (k, v) in &self.cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(token) = &self.cfg.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteWriteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
