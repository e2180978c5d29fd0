//! Audit collaborator interface.
//!
//! The pipeline reports every mutation as an [`AuditEvent`]. Storage is somebody
//! else's job: events go to an [`AuditSink`] through the [`AuditNotifier`], which
//! owns a background thread so recording never blocks or fails a pipeline call.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Action names shared with the audit log viewer.
pub mod actions {
    pub const DOCUMENT_UPLOADED: &str = "DOCUMENT_UPLOADED";
    pub const DOCUMENT_DELETED: &str = "DOCUMENT_DELETED";
    pub const REQUIREMENT_DELETED: &str = "REQUIREMENT_DELETED";
    pub const EXTRACTION_REQUESTED: &str = "EXTRACTION_REQUESTED";
    pub const EXTRACTION_STATUS_CHANGED: &str = "EXTRACTION_STATUS_CHANGED";
    pub const MATRIX_ENTRY_GENERATED: &str = "MATRIX_ENTRY_GENERATED";
    pub const MATRIX_ENTRY_DELETED: &str = "MATRIX_ENTRY_DELETED";
    pub const MATRIX_ENTRY_UPDATED: &str = "MATRIX_ENTRY_UPDATED";
    pub const MATRIX_ENTRY_REVIEWED: &str = "MATRIX_ENTRY_REVIEWED";
}

/// Who caused a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User(String),
    /// Workers and the stale-job sweeper.
    System,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: Actor,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: Actor,
        action: &str,
        entity_type: &str,
        entity_id: impl ToString,
    ) -> Self {
        Self {
            actor,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            field: None,
            old_value: None,
            new_value: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_change(
        mut self,
        field: &str,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        self.field = Some(field.to_string());
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit storage failed: {0}")]
    Storage(String),

    #[error("Audit sink lock poisoned")]
    LockPoisoned,
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes events to the `audit` tracing target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            actor = %event.actor,
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            field = event.field.as_deref().unwrap_or(""),
            old_value = event.old_value.as_deref().unwrap_or(""),
            new_value = event.new_value.as_deref().unwrap_or(""),
            reason = event.reason.as_deref().unwrap_or(""),
            "audit"
        );
        Ok(())
    }
}

/// In-memory sink, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given action name, in arrival order.
    pub fn with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        events.push(event.clone());
        Ok(())
    }
}

enum Message {
    Event(Box<AuditEvent>),
    Flush(Sender<()>),
}

/// Fire-and-forget delivery to an [`AuditSink`].
///
/// Events are queued on an unbounded channel and recorded in order by a
/// dedicated thread. Dropping the notifier drains the queue and joins the thread.
pub struct AuditNotifier {
    sender: Option<Sender<Message>>,
    thread: Option<JoinHandle<()>>,
}

impl AuditNotifier {
    pub fn start(sink: Arc<dyn AuditSink>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("audit-notifier".into())
            .spawn(move || deliver(sink, receiver));

        match thread {
            Ok(handle) => Self {
                sender: Some(sender),
                thread: Some(handle),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn audit thread, audit events will be dropped");
                Self {
                    sender: None,
                    thread: None,
                }
            }
        }
    }

    /// Queue an event. Never blocks and never fails the caller.
    pub fn notify(&self, event: AuditEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(Message::Event(Box::new(event))).is_err() {
            tracing::warn!("Audit thread gone, event dropped");
        }
    }

    /// Wait until every event queued so far has been handed to the sink.
    /// Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if sender.send(Message::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for AuditNotifier {
    fn drop(&mut self) {
        // Closing the channel ends the delivery loop once it has drained.
        self.sender.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn deliver(sink: Arc<dyn AuditSink>, receiver: Receiver<Message>) {
    for message in receiver {
        match message {
            Message::Event(event) => {
                if let Err(e) = sink.record(&event) {
                    tracing::warn!(
                        error = %e,
                        action = %event.action,
                        entity_id = %event.entity_id,
                        "Audit sink rejected event"
                    );
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
