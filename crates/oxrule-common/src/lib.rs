//! Data types shared by the rule engine, its collaborators and the server.
//!
//! Query results ([`types::Metric`]), the series written back to remote
//! storage ([`types::TimeSeries`]) and the alert instances tracked by alerting
//! rules ([`alert::Alert`]) all live here so that datasource, notifier and
//! remote-write crates do not depend on the engine.

pub mod alert;
pub mod hash;
pub mod types;

pub use alert::{Alert, AlertState};
pub use hash::hash_labels;
pub use types::{Label, Metric, QueryResult, Sample, TimeSeries};
