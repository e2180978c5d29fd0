//! Extraction state machine: `pending → processing → {completed | failed}`.
//!
//! `request_extraction` is the only way into `pending` once a document has
//! finished an attempt, and `process` is the only way into `processing`. Both
//! rely on conditional updates, so a document is never extracted twice at once.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dispatch::queue;
use super::provider::{ExtractionResult, Provider};
use super::retry::RetryPolicy;
use super::PipelineError;
use crate::audit::{actions, Actor, AuditEvent, AuditNotifier};
use crate::db::{self, Database};
use crate::models::{Document, ExtractionStatus, Job};

/// How one `process` call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Completed { pages: usize, warnings: usize },
    Failed { kind: String, message: String },
}

pub struct ExtractionOrchestrator {
    db: Database,
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    audit: Arc<AuditNotifier>,
}

impl ExtractionOrchestrator {
    pub fn new(
        db: Database,
        provider: Arc<dyn Provider>,
        retry: RetryPolicy,
        audit: Arc<AuditNotifier>,
    ) -> Self {
        Self {
            db,
            provider,
            retry,
            audit,
        }
    }

    /// Queue an extraction for `document_id`.
    ///
    /// From `completed` or `failed` this is the explicit re-run: the previous
    /// outcome is cleared and the document returns to `pending`.
    pub fn request_extraction(&self, document_id: &Uuid, actor: &Actor) -> Result<Job, PipelineError> {
        let conn = self.db.connect()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;

        let doc = db::require_document(&tx, document_id)?;
        if doc.extraction_status == ExtractionStatus::Processing {
            return Err(PipelineError::Conflict(format!(
                "document {document_id} is already being extracted"
            )));
        }
        if db::find_live_extraction_job(&tx, document_id)?.is_some() {
            return Err(PipelineError::Conflict(format!(
                "document {document_id} already has an extraction queued"
            )));
        }

        let previous = doc.extraction_status;
        if previous != ExtractionStatus::Pending && db::reset_extraction(&tx, document_id)? == 0 {
            return Err(PipelineError::Conflict(format!(
                "document {document_id} changed state concurrently"
            )));
        }
        let job = queue::enqueue_extraction(&tx, document_id)?;
        tx.commit()?;

        tracing::info!(document_id = %document_id, job_id = %job.id, "Extraction requested");
        self.audit.notify(
            AuditEvent::new(actor.clone(), actions::EXTRACTION_REQUESTED, "document", document_id)
                .with_change("job_id", None, Some(job.id.to_string())),
        );
        if previous != ExtractionStatus::Pending {
            self.notify_status(actor, document_id, previous, ExtractionStatus::Pending, None);
        }
        Ok(job)
    }

    /// Run one extraction attempt. Called by a worker after claiming the job.
    ///
    /// Provider failures are not errors here: they end the attempt in `failed`
    /// and come back as [`ExtractionOutcome::Failed`].
    pub fn process(&self, document_id: &Uuid) -> Result<ExtractionOutcome, PipelineError> {
        let conn = self.db.connect()?;
        let doc = db::require_document(&conn, document_id)?;

        let claimed = db::transition_extraction_status(
            &conn,
            document_id,
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
        )?;
        if claimed == 0 {
            return Err(PipelineError::Conflict(format!(
                "document {document_id} is {}, expected pending",
                doc.extraction_status
            )));
        }
        self.notify_status(
            &Actor::System,
            document_id,
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
            None,
        );

        let bytes = match std::fs::read(&doc.file_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                let message = format!("stored file unreadable: {e}");
                return self.record_failure(&conn, &doc, "io", message);
            }
        };

        let started = std::time::Instant::now();
        let identity = self.provider.identity();
        tracing::info!(
            document_id = %document_id,
            provider = %identity,
            size = bytes.len(),
            "Extraction started"
        );

        let result = self
            .retry
            .run("extract", |_| self.provider.extract(&bytes, &doc.mime_type));

        match result {
            Ok(extracted) => {
                let json = serde_json::to_string(&extracted)?;
                let rows = db::mark_extraction_completed(
                    &conn,
                    document_id,
                    &json,
                    &extracted.provider.provider,
                    &extracted.provider.model,
                    Utc::now(),
                )?;
                if rows == 0 {
                    return Err(PipelineError::Conflict(format!(
                        "document {document_id} left processing before extraction finished"
                    )));
                }
                tracing::info!(
                    document_id = %document_id,
                    pages = extracted.page_count(),
                    warnings = extracted.warnings.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Extraction completed"
                );
                self.notify_status(
                    &Actor::System,
                    document_id,
                    ExtractionStatus::Processing,
                    ExtractionStatus::Completed,
                    None,
                );
                Ok(ExtractionOutcome::Completed {
                    pages: extracted.page_count(),
                    warnings: extracted.warnings.len(),
                })
            }
            Err(e) => self.record_failure(&conn, &doc, e.kind(), e.to_string()),
        }
    }

    fn record_failure(
        &self,
        conn: &Connection,
        doc: &Document,
        kind: &str,
        message: String,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let identity = self.provider.identity();
        let rows = db::mark_extraction_failed(
            conn,
            &doc.id,
            &message,
            Some(&identity.provider),
            Some(&identity.model),
        )?;
        if rows == 0 {
            return Err(PipelineError::Conflict(format!(
                "document {} left processing before extraction finished",
                doc.id
            )));
        }
        tracing::warn!(document_id = %doc.id, kind, "Extraction failed");
        self.notify_status(
            &Actor::System,
            &doc.id,
            ExtractionStatus::Processing,
            ExtractionStatus::Failed,
            Some(kind),
        );
        Ok(ExtractionOutcome::Failed {
            kind: kind.to_string(),
            message,
        })
    }

    fn notify_status(
        &self,
        actor: &Actor,
        document_id: &Uuid,
        from: ExtractionStatus,
        to: ExtractionStatus,
        reason: Option<&str>,
    ) {
        let mut event = AuditEvent::new(
            actor.clone(),
            actions::EXTRACTION_STATUS_CHANGED,
            "document",
            document_id,
        )
        .with_change(
            "extraction_status",
            Some(from.to_string()),
            Some(to.to_string()),
        );
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.audit.notify(event);
    }
}

/// Decode the stored extraction of a completed document.
pub fn load_extraction(doc: &Document) -> Result<ExtractionResult, PipelineError> {
    if doc.extraction_status != ExtractionStatus::Completed {
        return Err(PipelineError::Precondition(format!(
            "document {} extraction is {}, expected completed",
            doc.id, doc.extraction_status
        )));
    }
    let data = doc.extracted_data.as_deref().ok_or_else(|| {
        PipelineError::Precondition(format!("document {} has no extracted data", doc.id))
    })?;
    Ok(serde_json::from_str(data)?)
}
