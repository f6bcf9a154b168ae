//! Writing rule results back to a Prometheus-compatible storage.
//!
//! The engine pushes one series at a time through [`RwClient::push`];
//! [`client::Client`] queues them and ships batches in the background.

pub mod client;
pub mod error;
pub mod fake;
pub mod proto;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use oxrule_common::TimeSeries;

pub use error::{RemoteWriteError, Result};

/// Sink for series produced by rule evaluation.
#[async_trait]
pub trait RwClient: Send + Sync {
    /// Enqueues a series without waiting for it to be written.
    ///
    /// # Errors
    ///
    /// Fails if the queue is full or the client has been closed.
    fn push(&self, series: TimeSeries) -> Result<()>;

    /// Stops accepting series and flushes whatever is still queued.
    async fn close(&self) -> Result<()>;
}
