//! Append-only audit trail of authorization decisions

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qkme_core::*;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use ulid::Ulid;

/// Protocol operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Status,
    EncKeys,
    DecKeys,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Status => write!(f, "status"),
            Operation::EncKeys => write!(f, "enc_keys"),
            Operation::DecKeys => write!(f, "dec_keys"),
        }
    }
}

/// One authorization decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Time-ordered event identifier
    pub id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub sae_id: SaeId,
    pub target: String,
    pub allowed: bool,
    pub reason: String,
}

impl AuditEvent {
    pub fn new(
        operation: Operation,
        sae_id: &SaeId,
        target: impl Into<String>,
        allowed: bool,
        reason: impl Into<String>,
    ) -> Self {
        AuditEvent {
            id: Ulid::new(),
            timestamp: Utc::now(),
            operation,
            sae_id: sae_id.clone(),
            target: target.into(),
            allowed,
            reason: reason.into(),
        }
    }
}

/// Destination for audit events. Implementations must tolerate concurrent callers.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits audit events on the `qkme::audit` tracing target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            target: "qkme::audit",
            id = %event.id,
            operation = %event.operation,
            sae_id = %event.sae_id,
            target_resource = %event.target,
            allowed = event.allowed,
            reason = %event.reason,
            "authorization decision"
        );
    }
}

/// Appends audit events as JSON lines to a file
pub struct FileAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(FileAuditSink {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode audit event {}: {}", event.id, e);
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            tracing::error!("Failed to write audit event {}: {}", event.id, e);
        }
    }
}

/// Keeps events in memory for inspection in tests
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fan-out over the configured sinks
#[derive(Clone, Default)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn record(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}
