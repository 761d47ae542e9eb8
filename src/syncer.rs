// Snapshot-driven reconciliation interface
//
// The event loop owns the store and hands each syncer successive snapshots.
// A syncer first says whether the change matters to it (`should_sync`) and,
// if so, is given the new snapshot together with a cancellation token that
// stays live until the next dispatch replaces it.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::ApiSnapshot;

#[async_trait]
pub trait ApiSyncer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Act on `snapshot`. Work spawned here must stop when `cancel` fires.
    async fn sync(&self, cancel: CancellationToken, snapshot: &ApiSnapshot) -> anyhow::Result<()>;

    /// Whether moving from `old` to `new` requires a sync. `old` is `None`
    /// on the first snapshot.
    fn should_sync(&self, old: Option<&ApiSnapshot>, new: &ApiSnapshot) -> bool;
}
