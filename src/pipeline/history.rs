//! Deployment history
//!
//! One append-only JSONL stream per (run, environment) under
//! `<root>/deployments/<run>/<env>.jsonl`. Rollbacks have no run and land
//! under `rollbacks/`. An in-memory index serves lookups.

use super::types::{DeploymentKind, DeploymentRecord, Environment};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const ROLLBACK_DIR: &str = "rollbacks";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Deployment history I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deployment history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct DeploymentHistory {
    root: Option<PathBuf>,
    records: RwLock<Vec<DeploymentRecord>>,
}

impl DeploymentHistory {
    pub fn in_memory() -> Self {
        Self {
            root: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Open the history under `root`, loading every existing stream
    pub async fn open(root: PathBuf) -> Result<Self, HistoryError> {
        tokio::fs::create_dir_all(&root).await?;

        let mut records = Vec::new();
        let mut runs = tokio::fs::read_dir(&root).await?;
        while let Some(run_dir) = runs.next_entry().await? {
            if !run_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut streams = tokio::fs::read_dir(run_dir.path()).await?;
            while let Some(stream) = streams.next_entry().await? {
                let path = stream.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    records.extend(read_stream(&path).await?);
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        debug!("Loaded {} deployment records from {}", records.len(), root.display());

        Ok(Self {
            root: Some(root),
            records: RwLock::new(records),
        })
    }

    fn stream_path(root: &Path, record: &DeploymentRecord) -> PathBuf {
        let dir = record
            .run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| ROLLBACK_DIR.to_string());
        root.join(dir).join(format!("{}.jsonl", record.environment))
    }

    pub async fn append(&self, record: &DeploymentRecord) -> Result<(), HistoryError> {
        if let Some(root) = &self.root {
            let path = Self::stream_path(root, record);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        self.records.write().await.push(record.clone());
        Ok(())
    }

    /// Records for one environment, oldest first
    pub async fn for_environment(&self, environment: Environment) -> Vec<DeploymentRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.environment == environment)
            .cloned()
            .collect()
    }

    /// Version currently running in `environment`
    pub async fn current_version(&self, environment: Environment) -> Option<String> {
        self.for_environment(environment)
            .await
            .into_iter()
            .rev()
            .find(|r| r.succeeded())
            .map(|r| r.artifact_version)
    }

    /// Rollback target for `environment`: the most recent successful version
    /// that is neither the current one nor one a later rollback moved away
    /// from. Repeated rollbacks therefore keep walking back.
    pub async fn previous_version(&self, environment: Environment) -> Option<String> {
        let successful: Vec<DeploymentRecord> = self
            .for_environment(environment)
            .await
            .into_iter()
            .filter(|r| r.succeeded())
            .collect();
        let current = successful.last()?.artifact_version.clone();

        // Newest first, so a redeploy after a rollback makes a version eligible again
        let mut retired: HashSet<String> = HashSet::new();
        for record in successful.into_iter().rev() {
            let eligible = record.artifact_version != current && !retired.contains(&record.artifact_version);
            if record.kind == DeploymentKind::Rollback {
                if let Some(left) = &record.previous_version {
                    retired.insert(left.clone());
                }
            }
            if eligible {
                return Some(record.artifact_version);
            }
        }
        None
    }

    /// Hash last deployed for `version` in `environment`, if known
    pub async fn hash_of(&self, environment: Environment, version: &str) -> Option<String> {
        self.for_environment(environment)
            .await
            .into_iter()
            .rev()
            .find(|r| r.artifact_version == version && !r.artifact_hash.is_empty())
            .map(|r| r.artifact_hash)
    }
}

async fn read_stream(path: &Path) -> Result<Vec<DeploymentRecord>, HistoryError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<DeploymentRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable deployment record in {}: {}", path.display(), e),
        }
    }
    Ok(records)
}
