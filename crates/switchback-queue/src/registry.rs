//! Active worker registry.

use std::collections::BTreeSet;
use switchback_core::{Result, WorkerId};
use tracing::info;

use crate::BuildQueue;

impl BuildQueue {
    pub async fn register(&self, worker: &WorkerId) -> Result<()> {
        self.store
            .set_add(&self.keys.active_workers(), worker.as_str())
            .await?;
        info!(worker_id = %worker, "Worker registered");
        Ok(())
    }

    /// Remove a worker. Unknown workers are ignored.
    pub async fn unregister(&self, worker: &WorkerId) -> Result<()> {
        self.store
            .set_remove(&self.keys.active_workers(), worker.as_str())
            .await?;
        info!(worker_id = %worker, "Worker unregistered");
        Ok(())
    }

    /// Workers that registered and have not unregistered since.
    ///
    /// A worker that died without unregistering stays listed.
    pub async fn active_workers(&self) -> Result<BTreeSet<WorkerId>> {
        let members = self.store.set_members(&self.keys.active_workers()).await?;
        Ok(members.into_iter().map(WorkerId::from).collect())
    }
}
