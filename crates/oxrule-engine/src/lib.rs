//! Alerting and recording rule evaluation.
//!
//! Rule files are parsed into [`config::GroupConfig`]s, each turned into a
//! [`group::Group`] that evaluates its rules on a fixed interval. Alerting
//! rules track alerts through pending, firing and inactive states and hand
//! them to notifiers; recording rules turn query results into new series.
//! Both kinds write their output through remote write.

pub mod alerting;
pub mod config;
pub mod error;
pub mod executor;
pub mod group;
pub mod labels;
pub mod manager;
pub mod recording;
pub mod rule;
pub mod settings;
pub mod state;


pub use alerting::AlertingRule;
pub use config::{GroupConfig, RuleConfig};
pub use error::{ConfigError, Result, RuleError};
pub use executor::{Executor, NotifierProvider};
pub use group::Group;
pub use manager::Manager;
pub use recording::RecordingRule;
pub use rule::{Rule, RuleOwner};
pub use settings::EngineSettings;
pub use state::{RuleState, StateEntry};
