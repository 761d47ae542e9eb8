// Experiment resource
//
// An experiment declares faults to inject, the failure conditions that decide
// whether the system under test survived them, and how long to keep watching.
// The `result` block is owned by the controller: the starter moves it from
// Pending to Started, the monitor moves it to a terminal state exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{duration_secs, Metadata, Resource, ResourceRef};

/// How long an experiment runs when its spec does not say
pub const DEFAULT_EXPERIMENT_DURATION: Duration = Duration::from_secs(10 * 60);

/// Failure details recorded on a failed experiment
pub type FailureReport = BTreeMap<String, String>;

/// Service targeted by a success-rate query
pub type ServiceRef = ResourceRef;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub metadata: Metadata,

    #[serde(default)]
    pub spec: ExperimentSpec,

    #[serde(default)]
    pub result: ExperimentResult,
}

impl Experiment {
    /// Create an empty, Pending experiment
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(namespace, name),
            spec: ExperimentSpec::default(),
            result: ExperimentResult::default(),
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        self.metadata.resource_ref()
    }

    pub fn state(&self) -> ExperimentState {
        self.result.state
    }

    /// Total duration, falling back to the default
    pub fn duration(&self) -> Duration {
        self.spec.duration.unwrap_or(DEFAULT_EXPERIMENT_DURATION)
    }
}

impl Resource for Experiment {
    const KIND: &'static str = "experiments";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Faults to inject. Opaque to the controller core; read by the translator.
    #[serde(default)]
    pub faults: Vec<serde_json::Value>,

    /// Conditions watched while the experiment runs, in declaration order
    #[serde(default)]
    pub failure_conditions: Vec<FailureCondition>,

    #[serde(default, with = "duration_secs", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

/// One pass/fail rule evaluated continuously against a live metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCondition {
    /// Unique within the experiment; generated by the starter when empty
    #[serde(default)]
    pub name: String,

    pub trigger: TriggerKind,
}

impl FailureCondition {
    pub fn prometheus(trigger: PrometheusTrigger) -> Self {
        Self {
            name: String::new(),
            trigger: TriggerKind::Prometheus(trigger),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Mechanism backing a failure condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TriggerKind {
    Prometheus(PrometheusTrigger),

    /// Any kind this controller does not know how to evaluate
    #[serde(other)]
    Unsupported,
}

impl TriggerKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TriggerKind::Prometheus(_) => "prometheus",
            TriggerKind::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusTrigger {
    #[serde(flatten)]
    pub query: PrometheusQuery,

    pub threshold_value: f64,

    #[serde(default)]
    pub comparison_operator: ComparisonOperator,
}

impl PrometheusTrigger {
    /// Trigger on a raw PromQL query with the default operator
    pub fn custom(query: impl Into<String>, threshold_value: f64) -> Self {
        Self {
            query: PrometheusQuery::CustomQuery(query.into()),
            threshold_value,
            comparison_operator: ComparisonOperator::default(),
        }
    }

    pub fn with_operator(mut self, op: ComparisonOperator) -> Self {
        self.comparison_operator = op;
        self
    }
}

/// Where a Prometheus trigger gets its query string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrometheusQuery {
    CustomQuery(String),
    SuccessRate(SuccessRateQuery),
}

/// Request success rate of a mesh service over a sliding window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessRateQuery {
    #[serde(default)]
    pub service: Option<ServiceRef>,

    #[serde(default, with = "duration_secs", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

/// Comparison between an observed value and a threshold.
///
/// The operator names the direction that fails the experiment: `<` fails when
/// the observed value falls below the threshold (suits success-rate metrics),
/// `>` fails when it rises above (suits latency or error-count metrics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComparisonOperator {
    #[default]
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
        }
    }

    /// Whether `value` breaches `threshold` under this operator
    pub fn exceeded(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::LessThan => value < threshold,
            ComparisonOperator::LessThanOrEqual => value <= threshold,
            ComparisonOperator::GreaterThan => value > threshold,
            ComparisonOperator::GreaterThanOrEqual => value >= threshold,
        }
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ComparisonOperator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            // unset operators fall back to the default
            "" | "<" => Ok(ComparisonOperator::LessThan),
            "<=" => Ok(ComparisonOperator::LessThanOrEqual),
            ">" => Ok(ComparisonOperator::GreaterThan),
            ">=" => Ok(ComparisonOperator::GreaterThanOrEqual),
            other => Err(format!(
                "invalid comparison operator {:?}, must be one of <, <=, >, >=",
                other
            )),
        }
    }
}

impl From<ComparisonOperator> for String {
    fn from(op: ComparisonOperator) -> Self {
        op.as_str().to_string()
    }
}

/// Lifecycle state of an experiment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentState {
    #[default]
    Pending,
    Started,
    Succeeded,
    Failed,
}

impl ExperimentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentState::Succeeded | ExperimentState::Failed)
    }
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Pending => write!(f, "Pending"),
            ExperimentState::Started => write!(f, "Started"),
            ExperimentState::Succeeded => write!(f, "Succeeded"),
            ExperimentState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    #[serde(default)]
    pub state: ExperimentState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_finished: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_report: FailureReport,
}
