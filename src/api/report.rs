// Report resource
//
// One report per finished experiment, holding every sample each failure
// condition observed while the experiment was monitored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Metadata, Resource, ResourceRef};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub metadata: Metadata,

    /// Experiment this report was produced for
    pub experiment: ResourceRef,

    #[serde(default)]
    pub failure_condition_history: Vec<FailureConditionHistory>,
}

impl Report {
    pub fn new(experiment: ResourceRef) -> Self {
        Self {
            metadata: Metadata::new(experiment.namespace.clone(), experiment.name.clone()),
            experiment,
            failure_condition_history: Vec::new(),
        }
    }

    /// History of the named condition, if one was recorded
    pub fn history(&self, failure_condition_name: &str) -> Option<&FailureConditionHistory> {
        self.failure_condition_history
            .iter()
            .find(|h| h.failure_condition_name == failure_condition_name)
    }
}

impl Resource for Report {
    const KIND: &'static str = "reports";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Ordered samples observed for one failure condition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureConditionHistory {
    pub failure_condition_name: String,

    #[serde(default)]
    pub samples: Vec<FailureConditionSample>,
}

impl FailureConditionHistory {
    pub fn new(failure_condition_name: impl Into<String>) -> Self {
        Self {
            failure_condition_name: failure_condition_name.into(),
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, value: f64, timestamp: DateTime<Utc>) {
        self.samples.push(FailureConditionSample { value, timestamp });
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureConditionSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_named_after_experiment() {
        let report = Report::new(ResourceRef::new("chaos", "abort-ratings"));
        assert_eq!(report.metadata.namespace, "chaos");
        assert_eq!(report.metadata.name, "abort-ratings");
        assert_eq!(report.experiment, ResourceRef::new("chaos", "abort-ratings"));
    }

    #[test]
    fn test_history_lookup_and_order() {
        let mut history = FailureConditionHistory::new("latency");
        let now = Utc::now();
        history.record(3.0, now);
        history.record(1.0, now);
        history.record(2.0, now);

        let mut report = Report::new(ResourceRef::new("ns", "exp"));
        report.failure_condition_history.push(history);

        assert_eq!(report.history("latency").unwrap().values(), vec![3.0, 1.0, 2.0]);
        assert!(report.history("missing").is_none());
    }
}
