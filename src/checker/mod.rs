//! Failure Condition Checking
//!
//! This module decides the outcome of started experiments:
//!
//! - [`ExperimentChecker`]: monitors one experiment, racing its failure
//!   conditions against the remaining duration and persisting the verdict
//!   plus a [`Report`](crate::api::Report) of every sample observed
//! - [`FailureCheckSyncer`]: an [`ApiSyncer`](crate::syncer::ApiSyncer) that
//!   (re)dispatches monitors when the set of started experiments changes
//!
//! # Verdicts
//!
//! A condition fails the experiment when its comparison operator holds
//! between the sampled value and the threshold (`<` fails when the value
//! drops below). The verdict is written once; an experiment that already
//! carries one is never overwritten.

pub mod failure_check;
pub mod monitor;

pub use failure_check::FailureCheckSyncer;
pub use monitor::{
    remaining_duration, resolve_condition, ExperimentChecker, MonitorError, ResolvedCondition,
    FAILURE_TYPE_THRESHOLD,
};
