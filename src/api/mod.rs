//! Experiment and Report Resources
//!
//! This module defines the resources the controller reads and writes:
//!
//! - **Experiment**: faults to inject, failure conditions to watch, and a duration,
//!   plus the `Result` block that only the controller mutates
//! - **Report**: the per-condition sample history recorded while monitoring
//! - **ApiSnapshot**: the list of experiments observed at one point in time
//!
//! Resources serialize to camelCase JSON so they can be stored verbatim as
//! custom resources or as files on disk.

pub mod experiment;
pub mod report;
pub mod snapshot;

pub use experiment::{
    ComparisonOperator, Experiment, ExperimentResult, ExperimentSpec, ExperimentState,
    FailureCondition, FailureReport, PrometheusQuery, PrometheusTrigger, ServiceRef, SuccessRateQuery,
    TriggerKind, DEFAULT_EXPERIMENT_DURATION,
};
pub use report::{FailureConditionHistory, FailureConditionSample, Report};
pub use snapshot::ApiSnapshot;

use serde::{Deserialize, Serialize};

/// Identity of a stored resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,

    /// Empty until assigned; the store rejects resources without one
    #[serde(default)]
    pub namespace: String,

    /// Opaque version assigned by the store on every write
    #[serde(default)]
    pub resource_version: String,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            resource_version: String::new(),
        }
    }

    /// Reference to this resource, without its version
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Namespace + name reference to a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Resources the store can hold
pub trait Resource: Clone + Send + Sync + Serialize + serde::de::DeserializeOwned + 'static {
    /// Kind name, used for store layout and error messages
    const KIND: &'static str;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;
}

/// Serialize an optional `Duration` as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            // rejects negatives, NaN and values too large for a Duration
            Some(s) => Duration::try_from_secs_f64(s).map(Some).map_err(|e| {
                serde::de::Error::custom(format!(
                    "duration must be a non-negative number of seconds, got {}: {}",
                    s, e
                ))
            }),
            None => Ok(None),
        }
    }
}
