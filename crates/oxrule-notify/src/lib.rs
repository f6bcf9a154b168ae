//! Alert delivery and label/annotation templating.
//!
//! Alerts selected for sending by the rule engine are handed to one or more
//! [`Notifier`] implementations. [`alertmanager::AlertManager`] posts them to
//! an Alertmanager-compatible receiver; [`fake::FakeNotifier`] records them
//! for tests. The [`template`] module renders the `{{ ... }}` expressions used
//! in rule labels and annotations.

pub mod alertmanager;
pub mod error;
pub mod fake;
pub mod template;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use oxrule_common::Alert;
use std::collections::BTreeMap;

pub use error::{NotifyError, Result};

/// A receiver of firing and resolved alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers a batch of alerts, attaching `headers` to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails after retries.
    async fn send(&self, alerts: &[Alert], headers: &BTreeMap<String, String>) -> Result<()>;

    /// Address of the receiver, used in error messages.
    fn addr(&self) -> &str;
}
