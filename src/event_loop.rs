// Snapshot event loop
//
// Lists the experiment store on a fixed refresh interval and feeds every
// changed snapshot to the registered syncers. Each syncer gets its own chain
// of cancellation tokens: a new dispatch first cancels the token handed out
// by the previous one, so work spawned for an outdated snapshot winds down
// before its replacement starts.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiSnapshot;
use crate::store::{ExperimentClient, StoreError};
use crate::syncer::ApiSyncer;

struct Registered {
    syncer: Arc<dyn ApiSyncer>,

    /// Token passed to the syncer's most recent dispatch
    current: Option<CancellationToken>,
}

pub struct EventLoop {
    experiments: ExperimentClient,
    namespace: Option<String>,
    refresh_interval: Duration,
    syncers: Vec<Registered>,
    previous: Option<ApiSnapshot>,
}

impl EventLoop {
    pub fn new(experiments: ExperimentClient, refresh_interval: Duration) -> Self {
        Self {
            experiments,
            namespace: None,
            refresh_interval,
            syncers: Vec::new(),
            previous: None,
        }
    }

    /// Restrict the loop to one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_syncer(mut self, syncer: Arc<dyn ApiSyncer>) -> Self {
        self.syncers.push(Registered {
            syncer,
            current: None,
        });
        self
    }

    /// Current contents of the experiment store
    pub async fn snapshot(&self) -> Result<ApiSnapshot, StoreError> {
        let experiments = self.experiments.list(self.namespace.as_deref()).await?;
        Ok(ApiSnapshot::new(experiments))
    }

    /// Take one snapshot and dispatch it. Returns whether the snapshot
    /// differed from the previous one.
    pub async fn step(&mut self, root: &CancellationToken) -> Result<bool, StoreError> {
        let snapshot = self.snapshot().await?;
        if self.previous.as_ref() == Some(&snapshot) {
            return Ok(false);
        }

        debug!(
            snapshot = snapshot.hash(),
            experiments = snapshot.experiments.len(),
            "New snapshot"
        );
        for registered in &mut self.syncers {
            if !registered.syncer.should_sync(self.previous.as_ref(), &snapshot) {
                continue;
            }

            if let Some(previous) = registered.current.take() {
                previous.cancel();
            }
            let token = root.child_token();
            registered.current = Some(token.clone());

            if let Err(e) = registered.syncer.sync(token, &snapshot).await {
                error!(syncer = registered.syncer.name(), error = %e, "Sync failed");
            }
        }

        self.previous = Some(snapshot);
        Ok(true)
    }

    /// Run until `root` is cancelled
    pub async fn run(mut self, root: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            refresh_ms = self.refresh_interval.as_millis() as u64,
            syncers = self.syncers.len(),
            "Event loop started"
        );

        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.step(&root).await {
                warn!(error = %e, "Failed to list experiments, retrying on next tick");
            }
        }

        for registered in &mut self.syncers {
            if let Some(token) = registered.current.take() {
                token.cancel();
            }
        }
        info!("Event loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Experiment, ExperimentState};
    use crate::store::{MemoryClient, ResourceClient, WriteOpts};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every token it is handed
    #[derive(Default)]
    struct RecordingSyncer {
        tokens: Mutex<Vec<CancellationToken>>,
    }

    #[async_trait]
    impl ApiSyncer for RecordingSyncer {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn sync(&self, cancel: CancellationToken, _snapshot: &ApiSnapshot) -> anyhow::Result<()> {
            self.tokens.lock().unwrap().push(cancel);
            Ok(())
        }

        fn should_sync(&self, _old: Option<&ApiSnapshot>, _new: &ApiSnapshot) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_step_skips_unchanged_snapshots() {
        let client = Arc::new(MemoryClient::<Experiment>::new());
        client
            .write(Experiment::new("ns", "a"), WriteOpts::default())
            .await
            .unwrap();

        let recorder = Arc::new(RecordingSyncer::default());
        let mut event_loop =
            EventLoop::new(client.clone(), Duration::from_millis(10)).with_syncer(recorder.clone());
        let root = CancellationToken::new();

        assert!(event_loop.step(&root).await.unwrap());
        assert!(!event_loop.step(&root).await.unwrap());
        assert_eq!(recorder.tokens.lock().unwrap().len(), 1);

        let mut exp = client.read("ns", "a").await.unwrap();
        exp.result.state = ExperimentState::Started;
        client.write(exp, WriteOpts::overwrite()).await.unwrap();
        assert!(event_loop.step(&root).await.unwrap());

        // the second dispatch cancelled the first one's token
        let tokens = recorder.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
    }

    #[tokio::test]
    async fn test_namespace_filter() {
        let client = Arc::new(MemoryClient::<Experiment>::new());
        for ns in ["chaos", "other"] {
            client
                .write(Experiment::new(ns, "a"), WriteOpts::default())
                .await
                .unwrap();
        }
        let event_loop = EventLoop::new(client, Duration::from_millis(10)).with_namespace(Some("chaos".to_string()));
        let snap = event_loop.snapshot().await.unwrap();
        assert_eq!(snap.experiments.len(), 1);
        assert_eq!(snap.experiments[0].metadata.namespace, "chaos");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancels_dispatch_on_shutdown() {
        let client = Arc::new(MemoryClient::<Experiment>::new());
        client
            .write(Experiment::new("ns", "a"), WriteOpts::default())
            .await
            .unwrap();
        let recorder = Arc::new(RecordingSyncer::default());
        let event_loop = EventLoop::new(client, Duration::from_millis(10)).with_syncer(recorder.clone());

        let root = CancellationToken::new();
        let handle = tokio::spawn(event_loop.run(root.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        root.cancel();
        handle.await.unwrap().unwrap();

        let tokens = recorder.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].is_cancelled());
    }
}
