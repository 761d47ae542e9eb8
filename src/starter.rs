// Experiment starter
//
// Moves Pending experiments to Started. The start time written here is what
// every later monitor measures the remaining duration from, so it is stamped
// exactly once and never touched again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiSnapshot, Experiment, ExperimentState, ResourceRef};
use crate::metrics;
use crate::store::{ExperimentClient, StoreError, WriteOpts};
use crate::syncer::ApiSyncer;

/// Longest name a generated failure condition may get
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("experiment {experiment}: duplicate failure condition names are not allowed, found multiple with name {name:?}")]
    DuplicateConditionName { experiment: ResourceRef, name: String },

    #[error("failed to write started experiment {experiment}: {source}")]
    Store {
        experiment: ResourceRef,
        #[source]
        source: StoreError,
    },

    #[error("{} experiments failed to start: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<StartError>),
}

fn join_errors(errors: &[StartError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Name for the `index`th condition, unique per experiment and start time
fn generated_condition_name(index: usize, now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
    sanitize_name(&format!("{}-{}", index, nanos))
}

/// Lowercase, DNS-label-safe version of `raw`
fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-') => c,
            _ => '-',
        })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_matches('-').to_string()
}

/// Fill in missing condition names and reject duplicates
pub fn validate_or_generate_condition_names(
    experiment: &mut Experiment,
    now: DateTime<Utc>,
) -> Result<(), StartError> {
    let target = experiment.resource_ref();
    let mut seen = HashSet::new();

    for (i, condition) in experiment.spec.failure_conditions.iter_mut().enumerate() {
        if condition.name.is_empty() {
            condition.name = generated_condition_name(i, now);
        }
        if !seen.insert(condition.name.clone()) {
            return Err(StartError::DuplicateConditionName {
                experiment: target,
                name: condition.name.clone(),
            });
        }
    }
    Ok(())
}

/// Marks pending experiments as started
pub struct ExperimentStarter {
    experiments: ExperimentClient,
}

impl ExperimentStarter {
    pub fn new(experiments: ExperimentClient) -> Self {
        Self { experiments }
    }

    /// Start every Pending experiment of `snapshot`, returning how many were
    /// started. One bad experiment does not stop the others.
    pub async fn start_pending(&self, snapshot: &ApiSnapshot) -> Result<usize, StartError> {
        let now = Utc::now();
        let mut started = 0;
        let mut errors = Vec::new();

        for exp in snapshot.experiments_with_state(ExperimentState::Pending) {
            match self.write_as_started(exp.clone(), now).await {
                Ok(()) => started += 1,
                Err(e) => errors.push(e),
            }
        }

        match errors.len() {
            0 => Ok(started),
            1 => Err(errors.remove(0)),
            _ => Err(StartError::Multiple(errors)),
        }
    }

    async fn write_as_started(&self, mut experiment: Experiment, now: DateTime<Utc>) -> Result<(), StartError> {
        let target = experiment.resource_ref();
        validate_or_generate_condition_names(&mut experiment, now)?;
        experiment.result.state = ExperimentState::Started;
        experiment.result.time_started = Some(now);

        self.experiments
            .write(experiment, WriteOpts::overwrite())
            .await
            .map_err(|source| StartError::Store {
                experiment: target.clone(),
                source,
            })?;

        metrics::EXPERIMENTS_STARTED_TOTAL.inc();
        info!(experiment = %target, "Started experiment");
        Ok(())
    }
}

#[async_trait]
impl ApiSyncer for ExperimentStarter {
    fn name(&self) -> &'static str {
        "experiment-starter"
    }

    async fn sync(&self, _cancel: CancellationToken, snapshot: &ApiSnapshot) -> anyhow::Result<()> {
        let snapshot_hash = snapshot.hash();
        debug!(syncer = self.name(), snapshot = snapshot_hash, "Begin sync");
        let result = self.start_pending(snapshot).await;
        debug!(syncer = self.name(), snapshot = snapshot_hash, "End sync");
        result.map(|_| ()).map_err(Into::into)
    }

    fn should_sync(&self, _old: Option<&ApiSnapshot>, new: &ApiSnapshot) -> bool {
        !new.experiments_with_state(ExperimentState::Pending).is_empty()
    }
}
