//! Faultline Controller Library
//!
//! Drives chaos experiments through their lifecycle: pending experiments are
//! started, started experiments are monitored against their Prometheus
//! failure conditions, and every experiment ends Succeeded (its duration ran
//! out) or Failed (a condition breached its threshold), with a report of all
//! samples observed along the way.

pub mod api;
pub mod checker;
pub mod config;
pub mod event_loop;
pub mod metrics;
pub mod metrics_server;
pub mod promquery;
pub mod starter;
pub mod store;
pub mod syncer;

pub use checker::{ExperimentChecker, FailureCheckSyncer, MonitorError};
pub use event_loop::EventLoop;
pub use promquery::{MetricsBackend, PrometheusClient, QueryPubSub};
pub use starter::{ExperimentStarter, StartError};
pub use syncer::ApiSyncer;
