// Failure condition monitor
//
// Watches one started experiment until it reaches a verdict. Every failure
// condition gets its own subscription and evaluator task; the first evaluator
// to see its threshold breached wins a single-slot race channel. If the
// experiment's remaining duration elapses first, the experiment succeeds.
//
// Remaining duration is computed from the persisted start time, so a monitor
// re-dispatched after a controller restart picks up where the old one was.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{
    ComparisonOperator, Experiment, ExperimentState, FailureCondition, FailureConditionHistory,
    FailureReport, PrometheusQuery, Report, ResourceRef, TriggerKind,
};
use crate::metrics;
use crate::promquery::queries::{istio_success_rate_query, DEFAULT_SUCCESS_RATE_INTERVAL};
use crate::promquery::{QueryPubSub, Subscription};
use crate::store::{ExperimentClient, ReportClient, StoreError, WriteOpts};

/// Value of `failure_type` in a failure report
pub const FAILURE_TYPE_THRESHOLD: &str = "value_exceeded_threshold";

/// Errors that end a monitor without a verdict being written
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("experiment {0} has no start time, it cannot be monitored before it is started")]
    MissingStartTime(ResourceRef),

    #[error("failure condition {condition:?} of experiment {experiment} has an unsupported trigger kind")]
    UnsupportedTrigger {
        experiment: ResourceRef,
        condition: String,
    },

    #[error("failure condition {condition:?} of experiment {experiment} is invalid: {reason}")]
    InvalidTrigger {
        experiment: ResourceRef,
        condition: String,
        reason: String,
    },

    #[error("query subscription for failure condition {condition:?} closed unexpectedly")]
    SubscriptionClosed { condition: String },

    #[error("failed to record result of experiment {experiment}: {source}")]
    Store {
        experiment: ResourceRef,
        #[source]
        source: StoreError,
    },
}

/// A failure condition reduced to what the evaluator needs
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCondition {
    pub name: String,
    pub query: String,
    pub operator: ComparisonOperator,
    pub threshold: f64,
}

impl ResolvedCondition {
    fn failure_report(&self, value: f64) -> FailureReport {
        BTreeMap::from([
            ("failure_type".to_string(), FAILURE_TYPE_THRESHOLD.to_string()),
            ("value".to_string(), value.to_string()),
            ("threshold".to_string(), self.threshold.to_string()),
            ("comparison_operator".to_string(), self.operator.as_str().to_string()),
        ])
    }
}

/// History key for a condition. The starter names every condition, but an
/// experiment written straight into the store may still carry empty names.
fn condition_key(index: usize, condition: &FailureCondition) -> String {
    if condition.name.is_empty() {
        format!("condition-{}", index)
    } else {
        condition.name.clone()
    }
}

/// Turn a declared failure condition into a concrete query and comparison
pub fn resolve_condition(
    experiment: &ResourceRef,
    index: usize,
    condition: &FailureCondition,
) -> Result<ResolvedCondition, MonitorError> {
    let name = condition_key(index, condition);
    let trigger = match &condition.trigger {
        TriggerKind::Prometheus(trigger) => trigger,
        TriggerKind::Unsupported => {
            return Err(MonitorError::UnsupportedTrigger {
                experiment: experiment.clone(),
                condition: name,
            })
        }
    };

    let query = match &trigger.query {
        PrometheusQuery::CustomQuery(q) => q.clone(),
        PrometheusQuery::SuccessRate(sr) => {
            let service = sr.service.as_ref().ok_or_else(|| MonitorError::InvalidTrigger {
                experiment: experiment.clone(),
                condition: name.clone(),
                reason: "success rate query requires a service".to_string(),
            })?;
            istio_success_rate_query(
                &service.namespace,
                &service.name,
                sr.interval.unwrap_or(DEFAULT_SUCCESS_RATE_INTERVAL),
            )
        }
    };

    Ok(ResolvedCondition {
        name,
        query,
        operator: trigger.comparison_operator,
        threshold: trigger.threshold_value,
    })
}

/// Time left of `total` after starting at `started`. Zero once overdue.
pub fn remaining_duration(total: Duration, started: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // a start time in the future counts as no time elapsed
    let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
    total.saturating_sub(elapsed)
}

/// Sample histories of experiments being monitored, keyed by experiment then
/// condition. Entries outlive a single monitor so a re-dispatched monitor
/// keeps appending to the same history.
#[derive(Debug, Clone, Default)]
struct HistoryBook {
    entries: Arc<Mutex<HashMap<ResourceRef, HashMap<String, FailureConditionHistory>>>>,
}

impl HistoryBook {
    fn record(&self, experiment: &ResourceRef, condition: &str, value: f64, at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(experiment.clone())
            .or_default()
            .entry(condition.to_string())
            .or_insert_with(|| FailureConditionHistory::new(condition))
            .record(value, at);
    }

    fn take(&self, experiment: &ResourceRef) -> HashMap<String, FailureConditionHistory> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(experiment)
            .unwrap_or_default()
    }

    fn retain(&self, mut keep: impl FnMut(&ResourceRef) -> bool) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|target, _| keep(target));
    }

    fn values(&self, experiment: &ResourceRef, condition: &str) -> Vec<f64> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(experiment)
            .and_then(|conditions| conditions.get(condition))
            .map(FailureConditionHistory::values)
            .unwrap_or_default()
    }
}

/// What an evaluator reports back to the monitor
#[derive(Debug)]
enum ConditionEvent {
    Breached(FailureReport),
    StreamClosed { condition: String },
}

/// Outcome of the breach-versus-timeout race
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Failed(FailureReport),
    Succeeded,
}

/// Keeps the active monitor gauge accurate on every exit path
struct ActiveMonitor;

impl ActiveMonitor {
    fn enter() -> Self {
        metrics::ACTIVE_MONITORS.inc();
        Self
    }
}

impl Drop for ActiveMonitor {
    fn drop(&mut self) {
        metrics::ACTIVE_MONITORS.dec();
    }
}

/// Monitors started experiments and records their verdicts and reports
pub struct ExperimentChecker {
    queries: QueryPubSub,
    experiments: ExperimentClient,
    reports: ReportClient,
    histories: HistoryBook,
}

impl ExperimentChecker {
    pub fn new(queries: QueryPubSub, experiments: ExperimentClient, reports: ReportClient) -> Self {
        Self {
            queries,
            experiments,
            reports,
            histories: HistoryBook::default(),
        }
    }

    /// Values recorded so far for one condition of an experiment that has
    /// not produced its report yet
    pub fn recorded_values(&self, experiment: &ResourceRef, condition: &str) -> Vec<f64> {
        self.histories.values(experiment, condition)
    }

    /// Forget recorded samples of every experiment `keep` rejects. Only
    /// safe while no monitor for those experiments is running.
    pub fn retain_histories(&self, keep: impl FnMut(&ResourceRef) -> bool) {
        self.histories.retain(keep);
    }

    /// Watch `experiment` until a condition breaches or its duration runs
    /// out, then persist the verdict and the report.
    ///
    /// Returns `Ok(())` without writing anything when `cancel` fires first.
    #[instrument(skip(self, cancel, experiment), fields(experiment = %experiment.metadata.resource_ref()))]
    pub async fn monitor_experiment(
        &self,
        cancel: CancellationToken,
        experiment: Experiment,
    ) -> Result<(), MonitorError> {
        let target = experiment.resource_ref();
        let started = experiment
            .result
            .time_started
            .ok_or_else(|| MonitorError::MissingStartTime(target.clone()))?;

        let conditions = experiment
            .spec
            .failure_conditions
            .iter()
            .enumerate()
            .map(|(i, c)| resolve_condition(&target, i, c))
            .collect::<Result<Vec<_>, _>>()?;

        let remaining = remaining_duration(experiment.duration(), started, Utc::now());
        let _active = ActiveMonitor::enter();
        debug!(
            conditions = conditions.len(),
            remaining_ms = remaining.as_millis() as u64,
            "Monitoring experiment"
        );

        let stop = cancel.child_token();
        let (race_tx, mut race_rx) = mpsc::channel::<ConditionEvent>(1);
        let mut evaluators = JoinSet::new();
        for condition in conditions {
            let subscription = self.queries.subscribe(condition.query.clone()).await;
            evaluators.spawn(evaluate_condition(
                self.queries.clone(),
                self.histories.clone(),
                target.clone(),
                condition,
                subscription,
                race_tx.clone(),
                stop.clone(),
            ));
        }
        // with every sender owned by an evaluator, recv() yields None only
        // once they have all exited
        drop(race_tx);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            Some(event) = race_rx.recv() => Some(match event {
                ConditionEvent::Breached(report) => Ok(Verdict::Failed(report)),
                ConditionEvent::StreamClosed { condition } => Err(MonitorError::SubscriptionClosed { condition }),
            }),
            _ = tokio::time::sleep(remaining) => Some(Ok(Verdict::Succeeded)),
        };

        // stop every evaluator and wait until each has unsubscribed
        stop.cancel();
        while let Some(joined) = evaluators.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Failure condition evaluator panicked");
            }
        }

        match outcome {
            None => {
                debug!("Monitoring cancelled before a verdict");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            Some(Ok(verdict)) => self.report_result(&target, verdict).await,
        }
    }

    /// Write the verdict onto the stored experiment, then the report
    async fn report_result(&self, target: &ResourceRef, verdict: Verdict) -> Result<(), MonitorError> {
        let store_err = |source| MonitorError::Store {
            experiment: target.clone(),
            source,
        };

        let mut experiment = self
            .experiments
            .read(&target.namespace, &target.name)
            .await
            .map_err(store_err)?;

        if experiment.result.state.is_terminal() {
            warn!(
                state = %experiment.result.state,
                "Experiment already has a verdict, not overwriting it"
            );
            self.histories.take(target);
            return Ok(());
        }

        match verdict {
            Verdict::Failed(report) => {
                experiment.result.state = ExperimentState::Failed;
                experiment.result.failure_report = report;
            }
            Verdict::Succeeded => {
                experiment.result.state = ExperimentState::Succeeded;
                experiment.result.failure_report.clear();
            }
        }
        experiment.result.time_finished = Some(Utc::now());

        let experiment = self
            .experiments
            .write(experiment, WriteOpts::overwrite())
            .await
            .map_err(store_err)?;

        let state = experiment.result.state.to_string();
        metrics::EXPERIMENT_VERDICTS_TOTAL
            .with_label_values(&[state.as_str()])
            .inc();
        info!(
            state = %state,
            failure_report = ?experiment.result.failure_report,
            "Reported experiment result"
        );

        self.produce_report(&experiment).await;
        Ok(())
    }

    /// Persist the sample histories. Failures are logged, never returned.
    async fn produce_report(&self, experiment: &Experiment) {
        let target = experiment.resource_ref();
        let mut histories = self.histories.take(&target);

        let mut report = Report::new(target.clone());
        for (i, condition) in experiment.spec.failure_conditions.iter().enumerate() {
            let name = condition_key(i, condition);
            let history = histories.remove(&name).unwrap_or_else(|| {
                warn!(condition = %name, "No samples recorded for failure condition");
                FailureConditionHistory::new(name.clone())
            });
            report.failure_condition_history.push(history);
        }

        if let Err(e) = self.reports.write(report, WriteOpts::overwrite()).await {
            metrics::REPORT_WRITE_ERRORS_TOTAL.inc();
            warn!(error = %e, "Failed to write experiment report");
        }
    }
}

/// Evaluate one condition until it breaches, its stream closes, or `stop` fires
async fn evaluate_condition(
    queries: QueryPubSub,
    histories: HistoryBook,
    experiment: ResourceRef,
    condition: ResolvedCondition,
    mut subscription: Subscription,
    race: mpsc::Sender<ConditionEvent>,
    stop: CancellationToken,
) {
    let event = loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break None,
            sample = subscription.recv() => match sample {
                Some(value) => {
                    histories.record(&experiment, &condition.name, value, Utc::now());
                    if condition.operator.exceeded(value, condition.threshold) {
                        debug!(
                            condition = %condition.name,
                            value,
                            threshold = condition.threshold,
                            operator = %condition.operator,
                            "Failure condition breached"
                        );
                        break Some(ConditionEvent::Breached(condition.failure_report(value)));
                    }
                }
                // a stream closed by shutdown is not an error
                None if stop.is_cancelled() => break None,
                None => break Some(ConditionEvent::StreamClosed {
                    condition: condition.name.clone(),
                }),
            },
        }
    };

    match event {
        Some(event) => {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = race.send(event) => {}
            }
        }
        None => {
            // samples already delivered belong in the history even though
            // the race is over
            while let Some(value) = subscription.try_recv() {
                histories.record(&experiment, &condition.name, value, Utc::now());
            }
        }
    }

    queries.unsubscribe(subscription).await;
}
