//! Audit sinks for storing audit events

use super::event::{redact_details, truncate_summary, AuditEvent, AuditFilter};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for audit sinks
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one event
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Read events matching the filter, newest first
    async fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError>;
}

/// In-memory audit sink
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// All events in append order
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.read().await;
        Ok(filter.apply(events.iter().cloned()))
    }
}

/// File-based audit sink, one JSON record per line, append-only
pub struct FileAuditSink {
    path: PathBuf,
    /// Serializes appends from concurrent runs within this process
    write_lock: Mutex<()>,
}

impl FileAuditSink {
    pub async fn new(path: PathBuf) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                // A torn trailing line from a crashed writer is skipped, not fatal
                Err(e) => debug!("Skipping unreadable audit line: {}", e),
            }
        }
        Ok(filter.apply(events))
    }
}

/// Handle used by the gate, orchestrator and governor to record events.
///
/// Applies summary truncation and secret redaction before the sink sees the
/// event. A failing sink is reported through tracing and never aborts the
/// caller's control flow.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    summary_cap: usize,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, summary_cap: usize) -> Self {
        Self { sink, summary_cap }
    }

    /// In-memory log, handy for tests and disabled-audit mode
    pub fn in_memory(summary_cap: usize) -> (Self, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Self::new(sink.clone(), summary_cap), sink)
    }

    pub fn summary_cap(&self) -> usize {
        self.summary_cap
    }

    pub async fn record(&self, mut event: AuditEvent) {
        event.summary = truncate_summary(&event.summary, self.summary_cap);
        event.details = event.details.map(redact_details);

        if let Err(e) = self.sink.append(&event).await {
            error!(
                "Failed to append audit event {:?} for {}: {}",
                event.event, event.subject, e
            );
        }
    }

    pub async fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        self.sink.read(filter).await
    }
}
