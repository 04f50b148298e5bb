//! Virtual-user scheduling and execution engine for load testing.
//!
//! A validated [`plan::TestPlan`] drives load patterns that spawn concurrent
//! virtual users; each user executes scenarios of steps against pluggable
//! [`executor::StepHandler`]s while the [`metrics::MetricsCollector`]
//! aggregates results and streams them to [`sink::Sink`]s.

pub mod clock;
pub mod context;
pub mod data;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod metrics;
pub mod patterns;
pub mod plan;
pub mod rendezvous;
pub mod results;
pub mod runner;
pub mod sink;
pub mod template;
pub mod virtual_user;

pub use error::{EngineError, ErrorKind};
pub use runner::TestRunner;
