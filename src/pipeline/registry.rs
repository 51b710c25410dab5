//! Run registry
//!
//! Snapshots of in-flight and finished runs for status queries. The
//! orchestrator publishes after every transition; nothing reads it back for
//! control decisions.

use super::types::PipelineRun;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, run: &PipelineRun) {
        self.runs.write().await.insert(run.id, run.clone());
    }

    pub async fn get(&self, id: Uuid) -> Option<PipelineRun> {
        self.runs.read().await.get(&id).cloned()
    }

    /// Newest first
    pub async fn list(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ChangeKind, RunStatus};

    #[tokio::test]
    async fn test_publish_replaces_snapshot() {
        let registry = RunRegistry::new();
        let mut run = PipelineRun::new("fix crash", ChangeKind::Bugfix);
        registry.publish(&run).await;

        run.complete();
        registry.publish(&run).await;

        let stored = registry.get(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Complete);
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }
}
