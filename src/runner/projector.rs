//! Status projector
//!
//! Consumes `run.status.updates` and applies each update to the durable run
//! record. Delivery is at-least-once; the projector is idempotent because
//! status transitions are monotonic within a run and the run store drops
//! regressions.

use std::sync::Arc;

use tracing::{debug, warn};

use super::Services;
use crate::ir::StatusUpdate;
use crate::store::{RunStore, StoreError};

/// Projects the status stream into the cold store
pub struct StatusProjector {
    services: Arc<Services>,
}

impl StatusProjector {
    pub fn new(services: Arc<Services>) -> Self {
        StatusProjector { services }
    }

    /// Spawn a projector task; abort the handle to stop it
    pub fn spawn(services: Arc<Services>) -> tokio::task::JoinHandle<()> {
        let projector = StatusProjector::new(services);
        tokio::spawn(async move { projector.run_loop().await })
    }

    /// Block on the status stream until the bus goes away
    pub async fn run_loop(&self) {
        let updates = self.services.bus.status_updates();
        while let Some(update) = updates.recv().await {
            if let Err(e) = self.apply(&update).await {
                warn!(run = %update.run_id, status = %update.status, error = %e,
                      "status projection failed");
            }
        }
    }

    /// Apply one update; regressions and duplicates are no-ops
    pub async fn apply(&self, update: &StatusUpdate) -> Result<bool, StoreError> {
        let changed = self
            .services
            .runs
            .update_status(update.run_id, update.status)
            .await?;
        if changed {
            debug!(run = %update.run_id, status = %update.status, "run status projected");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::ir::RunStatus;
    use crate::store::{RunBaseKind, RunRecord};
    use crate::types::{ArtifactId, Username};
    use serde_json::Value;

    #[tokio::test]
    async fn projects_in_order_and_drops_regressions() {
        let services = Services::in_memory(CoreConfig::default());
        let projector = StatusProjector::new(Arc::clone(&services));

        let record = RunRecord::new(
            Username::new("alice").unwrap(),
            RunBaseKind::DagVersion,
            "base",
            ArtifactId::generate(),
            Value::Null,
        );
        let run_id = record.id;
        services.runs.insert(record).await.unwrap();

        let running = StatusUpdate::now(run_id, RunStatus::Running);
        assert!(projector.apply(&running).await.unwrap());
        // at-least-once redelivery of the same update is a no-op
        assert!(!projector.apply(&running).await.unwrap());
        // a late QUEUED is a regression and is dropped
        assert!(!projector
            .apply(&StatusUpdate::now(run_id, RunStatus::Queued))
            .await
            .unwrap());

        assert!(projector
            .apply(&StatusUpdate::now(run_id, RunStatus::Completed))
            .await
            .unwrap());
        assert_eq!(
            services.runs.get(run_id).await.unwrap().status,
            RunStatus::Completed
        );
    }
}
