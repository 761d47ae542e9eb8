// Failure check syncer
//
// Dispatches one monitor per started experiment whenever the set of started
// experiments, or what is monitored about them, changes between snapshots.
// Each dispatch cancels and awaits the monitors of the previous one before
// spawning replacements, so an experiment never has two live monitors. Sample
// histories of experiments that are no longer started are dropped at the
// same point.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::ExperimentChecker;
use crate::api::{ApiSnapshot, Experiment, ExperimentState, ResourceRef};
use crate::syncer::ApiSyncer;

/// A dispatched monitor and the token that stops it
struct RunningMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct FailureCheckSyncer {
    checker: Arc<ExperimentChecker>,

    /// Monitor tasks spawned by `sync`
    monitors: TaskTracker,

    /// Monitor of the latest dispatch per experiment
    running: tokio::sync::Mutex<HashMap<ResourceRef, RunningMonitor>>,

    /// Last observed resource version per experiment, for change logging
    versions: Mutex<HashMap<ResourceRef, String>>,
}

impl FailureCheckSyncer {
    pub fn new(checker: Arc<ExperimentChecker>) -> Self {
        Self {
            checker,
            monitors: TaskTracker::new(),
            running: tokio::sync::Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor tasks that have not returned yet
    pub fn in_flight(&self) -> usize {
        self.monitors.len()
    }

    /// Wait for every dispatched monitor to return. Cancel their tokens
    /// first or this waits for verdicts.
    pub async fn wait_idle(&self) {
        self.monitors.close();
        self.monitors.wait().await;
        self.monitors.reopen();
    }

    fn log_changes(&self, snapshot: &ApiSnapshot) {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::with_capacity(snapshot.experiments.len());

        for exp in &snapshot.experiments {
            let key = exp.resource_ref();
            let version = exp.metadata.resource_version.clone();
            match versions.get(&key) {
                None => info!(experiment = %key, version = %version, "Received experiment"),
                Some(old) if *old != version => {
                    debug!(experiment = %key, from = %old, to = %version, "Experiment updated")
                }
                Some(_) => {}
            }
            next.insert(key, version);
        }
        for key in versions.keys().filter(|k| !next.contains_key(*k)) {
            info!(experiment = %key, "Experiment removed");
        }

        *versions = next;
    }
}

/// Hash of the fields a running monitor depends on
fn monitored_fields_hash(exp: &Experiment) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Ok(conditions) = serde_json::to_vec(&exp.spec.failure_conditions) {
        conditions.hash(&mut hasher);
    }
    exp.spec.duration.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl ApiSyncer for FailureCheckSyncer {
    fn name(&self) -> &'static str {
        "failure-checker"
    }

    async fn sync(&self, cancel: CancellationToken, snapshot: &ApiSnapshot) -> anyhow::Result<()> {
        let snapshot_hash = snapshot.hash();
        debug!(syncer = self.name(), snapshot = snapshot_hash, "Begin sync");
        self.log_changes(snapshot);

        let mut running = self.running.lock().await;

        // a replacement only starts once its predecessor has returned
        for (target, previous) in running.drain() {
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                warn!(experiment = %target, error = %e, "Previous monitor did not exit cleanly");
            }
        }

        let started = snapshot.experiments_with_state(ExperimentState::Started);
        let keep: HashSet<ResourceRef> = started.iter().map(|exp| exp.resource_ref()).collect();
        self.checker.retain_histories(|target| keep.contains(target));

        for exp in started {
            let checker = self.checker.clone();
            let token = cancel.child_token();
            let target = exp.resource_ref();
            let exp = exp.clone();
            let monitor_token = token.clone();
            let monitor_target = target.clone();
            let handle = self.monitors.spawn(async move {
                if let Err(e) = checker.monitor_experiment(monitor_token, exp).await {
                    error!(experiment = %monitor_target, error = %e, "Monitoring experiment failed");
                }
            });
            running.insert(target, RunningMonitor { cancel: token, handle });
        }

        debug!(syncer = self.name(), snapshot = snapshot_hash, "End sync");
        Ok(())
    }

    fn should_sync(&self, old: Option<&ApiSnapshot>, new: &ApiSnapshot) -> bool {
        let updated = new.experiments_with_state(ExperimentState::Started);
        let original = old
            .map(|s| s.experiments_with_state(ExperimentState::Started))
            .unwrap_or_default();

        if original.len() != updated.len() {
            return true;
        }

        original.iter().any(|o| {
            match updated
                .iter()
                .find(|u| u.metadata.namespace == o.metadata.namespace && u.metadata.name == o.metadata.name)
            {
                None => true,
                Some(u) => monitored_fields_hash(o) != monitored_fields_hash(u),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FailureCondition, PrometheusTrigger, Report};
    use crate::promquery::{QueryPubSub, ScriptedBackend};
    use crate::store::{MemoryClient, ResourceClient, WriteOpts};
    use chrono::Utc;
    use std::time::Duration;

    fn started(name: &str) -> Experiment {
        let mut exp = Experiment::new("unit-test", name);
        exp.spec.failure_conditions = vec![
            FailureCondition::prometheus(PrometheusTrigger::custom("query1", 50.0)).with_name("fc-1"),
            FailureCondition::prometheus(PrometheusTrigger::custom("query2", 50.0)).with_name("fc-2"),
        ];
        exp.spec.duration = Some(Duration::from_millis(500));
        exp.result.state = ExperimentState::Started;
        exp.result.time_started = Some(Utc::now());
        exp
    }

    fn syncer() -> FailureCheckSyncer {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_constant("query1", 100.0)
                .with_constant("query2", 100.0),
        );
        let queries = QueryPubSub::new(backend, Duration::from_millis(1), CancellationToken::new());
        let checker = ExperimentChecker::new(
            queries,
            Arc::new(MemoryClient::<Experiment>::new()),
            Arc::new(MemoryClient::<Report>::new()),
        );
        FailureCheckSyncer::new(Arc::new(checker))
    }

    #[test]
    fn test_should_sync_same_snapshot() {
        let s = syncer();
        let snap = ApiSnapshot::new(vec![started("aaaa"), started("bbbb")]);
        assert!(!s.should_sync(Some(&snap), &snap));
        assert!(s.should_sync(None, &snap));
    }

    #[test]
    fn test_should_sync_ignores_non_started_and_versions() {
        let s = syncer();
        let old = ApiSnapshot::new(vec![started("aaaa"), Experiment::new("unit-test", "pending")]);

        let mut bumped = started("aaaa");
        bumped.metadata.resource_version = "9".to_string();
        let new = ApiSnapshot::new(vec![bumped, Experiment::new("unit-test", "other-pending")]);
        assert!(!s.should_sync(Some(&old), &new));

        assert!(!s.should_sync(None, &ApiSnapshot::default()));
    }

    #[test]
    fn test_should_sync_on_monitored_changes() {
        let s = syncer();
        let old = ApiSnapshot::new(vec![started("aaaa")]);

        let mut longer = started("aaaa");
        longer.spec.duration = Some(Duration::from_secs(30));
        assert!(s.should_sync(Some(&old), &ApiSnapshot::new(vec![longer])));

        let mut stricter = started("aaaa");
        stricter.spec.failure_conditions[0] =
            FailureCondition::prometheus(PrometheusTrigger::custom("query1", 90.0)).with_name("fc-1");
        assert!(s.should_sync(Some(&old), &ApiSnapshot::new(vec![stricter])));

        // same count, different experiment
        assert!(s.should_sync(Some(&old), &ApiSnapshot::new(vec![started("bbbb")])));

        let mut finished = started("aaaa");
        finished.result.state = ExperimentState::Succeeded;
        assert!(s.should_sync(Some(&old), &ApiSnapshot::new(vec![finished])));
    }

    #[test]
    fn test_log_changes_tracks_versions() {
        let s = syncer();
        let mut a = started("aaaa");
        a.metadata.resource_version = "1".to_string();
        s.log_changes(&ApiSnapshot::new(vec![a.clone(), started("bbbb")]));
        assert_eq!(s.versions.lock().unwrap().len(), 2);

        a.metadata.resource_version = "2".to_string();
        s.log_changes(&ApiSnapshot::new(vec![a]));
        let versions = s.versions.lock().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[&ResourceRef::new("unit-test", "aaaa")], "2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_sync_leaves_no_monitors() {
        let s = syncer();
        let snap = ApiSnapshot::new(vec![started("aaaa"), started("bbbb")]);

        for _ in 0..3 {
            let cancel = CancellationToken::new();
            s.sync(cancel.clone(), &snap).await.unwrap();
            cancel.cancel();
        }

        tokio::time::timeout(Duration::from_secs(5), s.wait_idle())
            .await
            .expect("monitors did not stop after cancellation");
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redispatch_replaces_running_monitor() {
        let s = syncer();
        let mut exp = started("aaaa");
        exp.spec.duration = Some(Duration::from_secs(60));
        let snap = ApiSnapshot::new(vec![exp]);
        let target = ResourceRef::new("unit-test", "aaaa");

        s.sync(CancellationToken::new(), &snap).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.in_flight(), 1);
        let before = s.checker.recorded_values(&target, "fc-1").len();
        assert!(before > 0);

        // the first token is never cancelled by the caller
        let cancel = CancellationToken::new();
        s.sync(cancel.clone(), &snap).await.unwrap();
        assert_eq!(s.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.in_flight(), 1);
        assert!(s.checker.recorded_values(&target, "fc-1").len() > before);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), s.wait_idle())
            .await
            .unwrap();
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_drops_histories_of_experiments_no_longer_started() {
        let s = syncer();
        let mut doomed = started("doomed");
        doomed.spec.duration = Some(Duration::from_secs(60));
        let mut kept = started("kept");
        kept.spec.duration = Some(Duration::from_secs(60));
        let doomed_ref = ResourceRef::new("unit-test", "doomed");
        let kept_ref = ResourceRef::new("unit-test", "kept");

        let first = CancellationToken::new();
        s.sync(first.clone(), &ApiSnapshot::new(vec![doomed, kept.clone()]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!s.checker.recorded_values(&doomed_ref, "fc-1").is_empty());
        assert!(!s.checker.recorded_values(&kept_ref, "fc-1").is_empty());

        // deleted from the store while started
        first.cancel();
        let second = CancellationToken::new();
        s.sync(second.clone(), &ApiSnapshot::new(vec![kept])).await.unwrap();

        assert!(s.checker.recorded_values(&doomed_ref, "fc-1").is_empty());
        assert!(s.checker.recorded_values(&doomed_ref, "fc-2").is_empty());
        assert!(!s.checker.recorded_values(&kept_ref, "fc-1").is_empty());

        second.cancel();
        s.sync(CancellationToken::new(), &ApiSnapshot::default()).await.unwrap();
        assert!(s.checker.recorded_values(&kept_ref, "fc-1").is_empty());
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_dispatches_monitor_to_verdict() {
        let experiments = Arc::new(MemoryClient::<Experiment>::new());
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_constant("query1", 100.0)
                .with_constant("query2", 100.0),
        );
        let queries = QueryPubSub::new(backend, Duration::from_millis(1), CancellationToken::new());
        let checker = ExperimentChecker::new(queries, experiments.clone(), Arc::new(MemoryClient::<Report>::new()));
        let s = FailureCheckSyncer::new(Arc::new(checker));

        let exp = experiments
            .write(started("aaaa"), WriteOpts::default())
            .await
            .unwrap();
        s.sync(CancellationToken::new(), &ApiSnapshot::new(vec![exp]))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), s.wait_idle())
            .await
            .unwrap();
        let stored = experiments.read("unit-test", "aaaa").await.unwrap();
        assert_eq!(stored.result.state, ExperimentState::Succeeded);
    }
}
