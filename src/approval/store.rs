//! Approval storage
//!
//! The gate talks to storage only through [`ApprovalStore`], so the
//! single-process file store can be swapped for a lock-aware or transactional
//! one without touching gate or pipeline logic.

use super::gate::GateError;
use super::models::{ApprovalRequest, ApprovalStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Result of a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    Swapped,
    /// No record with that id
    Missing,
    /// The stored record was not in the expected status; carries the current record
    Conflict(ApprovalRequest),
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, GateError>;

    /// Insert or overwrite
    async fn put(&self, request: &ApprovalRequest) -> Result<(), GateError>;

    /// Replace the record only if its stored status equals `expected`
    async fn compare_and_swap(
        &self,
        expected: ApprovalStatus,
        updated: &ApprovalRequest,
    ) -> Result<SwapOutcome, GateError>;

    async fn list(&self) -> Result<Vec<ApprovalRequest>, GateError>;
}

fn swap_in(
    approvals: &mut HashMap<Uuid, ApprovalRequest>,
    expected: ApprovalStatus,
    updated: &ApprovalRequest,
) -> SwapOutcome {
    match approvals.get(&updated.id) {
        None => SwapOutcome::Missing,
        Some(current) if current.status != expected => SwapOutcome::Conflict(current.clone()),
        Some(_) => {
            approvals.insert(updated.id, updated.clone());
            SwapOutcome::Swapped
        }
    }
}

fn sorted(mut requests: Vec<ApprovalRequest>) -> Vec<ApprovalRequest> {
    requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    requests
}

/// Thread-safe in-memory approval store
pub struct MemoryApprovalStore {
    approvals: RwLock<HashMap<Uuid, ApprovalRequest>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            approvals: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, GateError> {
        Ok(self.approvals.read().await.get(&id).cloned())
    }

    async fn put(&self, request: &ApprovalRequest) -> Result<(), GateError> {
        self.approvals.write().await.insert(request.id, request.clone());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected: ApprovalStatus,
        updated: &ApprovalRequest,
    ) -> Result<SwapOutcome, GateError> {
        let mut approvals = self.approvals.write().await;
        Ok(swap_in(&mut approvals, expected, updated))
    }

    async fn list(&self) -> Result<Vec<ApprovalRequest>, GateError> {
        Ok(sorted(self.approvals.read().await.values().cloned().collect()))
    }
}

/// File-backed store: one JSON object keyed by request id, rewritten on
/// every transition.
///
/// The in-process mutex makes read-modify-write atomic for runs sharing
/// this store instance. Separate processes sharing the file still race
/// (last writer wins).
pub struct FileApprovalStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileApprovalStore {
    pub async fn new(path: PathBuf) -> Result<Self, GateError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GateError::Storage(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<HashMap<Uuid, ApprovalRequest>, GateError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                GateError::Storage(format!("approval store {} is corrupt: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(GateError::Storage(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, approvals: &HashMap<Uuid, ApprovalRequest>) -> Result<(), GateError> {
        let raw = serde_json::to_string_pretty(approvals)
            .map_err(|e| GateError::Storage(format!("cannot serialize approvals: {}", e)))?;

        // Write-then-rename so a crash never leaves a half-written store
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| GateError::Storage(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| GateError::Storage(format!("cannot replace {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl ApprovalStore for FileApprovalStore {
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, GateError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(&id))
    }

    async fn put(&self, request: &ApprovalRequest) -> Result<(), GateError> {
        let _guard = self.lock.lock().await;
        let mut approvals = self.load().await?;
        approvals.insert(request.id, request.clone());
        self.save(&approvals).await
    }

    async fn compare_and_swap(
        &self,
        expected: ApprovalStatus,
        updated: &ApprovalRequest,
    ) -> Result<SwapOutcome, GateError> {
        let _guard = self.lock.lock().await;
        let mut approvals = self.load().await?;
        let outcome = swap_in(&mut approvals, expected, updated);
        if outcome == SwapOutcome::Swapped {
            self.save(&approvals).await?;
        }
        Ok(outcome)
    }

    async fn list(&self) -> Result<Vec<ApprovalRequest>, GateError> {
        let _guard = self.lock.lock().await;
        Ok(sorted(self.load().await?.into_values().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{Agent, ApprovalAction};
    use serde_json::json;

    fn sample() -> ApprovalRequest {
        ApprovalRequest::new(Agent::Test, ApprovalAction::TestGeneration, "tests", json!({}))
    }

    #[tokio::test]
    async fn test_memory_cas_only_from_expected_status() {
        let store = MemoryApprovalStore::new();
        let request = sample();
        store.put(&request).await.unwrap();

        let approved = request.resolved(ApprovalStatus::Approved, Some("alice".into()), None);
        let outcome = store.compare_and_swap(ApprovalStatus::Pending, &approved).await.unwrap();
        assert_eq!(outcome, SwapOutcome::Swapped);

        let rejected = request.resolved(ApprovalStatus::Rejected, Some("bob".into()), None);
        match store.compare_and_swap(ApprovalStatus::Pending, &rejected).await.unwrap() {
            SwapOutcome::Conflict(current) => assert_eq!(current.approver.as_deref(), Some("alice")),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_cas_missing() {
        let store = MemoryApprovalStore::new();
        let outcome = store.compare_and_swap(ApprovalStatus::Pending, &sample()).await.unwrap();
        assert_eq!(outcome, SwapOutcome::Missing);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.json");

        let request = sample();
        {
            let store = FileApprovalStore::new(path.clone()).await.unwrap();
            store.put(&request).await.unwrap();
        }

        let reopened = FileApprovalStore::new(path).await.unwrap();
        let loaded = reopened.get(request.id).await.unwrap().unwrap();
        assert_eq!(loaded, request);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let store = FileApprovalStore::new(path).await.unwrap();
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, GateError::Storage(_)));
    }
}
