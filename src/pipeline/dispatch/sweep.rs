//! Recovery of work orphaned by crashed or hung workers.
//!
//! Workers refresh `heartbeat_at` while a job runs. A running job whose
//! worker has been silent for longer than `stale_after` is presumed dead.
//! It goes back to the queue while it has attempts left; after that the job
//! and its document are failed for good.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use super::queue;
use crate::audit::{actions, Actor, AuditEvent, AuditNotifier};
use crate::db::{self, DatabaseError};
use crate::models::{Document, ExtractionStatus, Job, JobKind};

pub const ABANDONED_MESSAGE: &str = "extraction abandoned after worker timeout";

const REASON_REQUEUED: &str = "stale_job_requeued";
const REASON_ABANDONED: &str = "stale_job_abandoned";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: Vec<Uuid>,
    pub abandoned: Vec<Uuid>,
    /// Documents found in `processing` without a live job.
    pub orphaned_documents: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.abandoned.is_empty() && self.orphaned_documents.is_empty()
    }
}

pub fn recover_stale_jobs(
    conn: &Connection,
    audit: &AuditNotifier,
    silent_since: DateTime<Utc>,
    max_attempts: u32,
) -> Result<SweepReport, DatabaseError> {
    let mut report = SweepReport::default();

    for job in db::list_stale_running_jobs(conn, silent_since)? {
        let tx = conn.unchecked_transaction()?;
        if job.attempts < max_attempts {
            if db::requeue_job(&tx, &job.id, Utc::now())? == 0 {
                continue;
            }
            let reset = job.kind == JobKind::Extraction
                && db::transition_extraction_status(
                    &tx,
                    &job.document_id,
                    ExtractionStatus::Processing,
                    ExtractionStatus::Pending,
                )? > 0;
            tx.commit()?;

            tracing::warn!(job_id = %job.id, attempts = job.attempts, "Stale job requeued");
            if reset {
                notify(audit, &job.document_id, ExtractionStatus::Pending, REASON_REQUEUED);
            }
            report.requeued.push(job.id);
        } else {
            db::mark_job_failed(&tx, &job.id, ABANDONED_MESSAGE)?;
            let failed = job.kind == JobKind::Extraction
                && db::mark_extraction_failed(&tx, &job.document_id, ABANDONED_MESSAGE, None, None)? > 0;
            tx.commit()?;

            tracing::warn!(job_id = %job.id, attempts = job.attempts, "Stale job abandoned");
            if failed {
                notify(audit, &job.document_id, ExtractionStatus::Failed, REASON_ABANDONED);
            }
            report.abandoned.push(job.id);
        }
    }

    for doc in db::list_orphaned_processing_documents(conn)? {
        if doc.updated_at >= silent_since {
            continue;
        }
        recover_orphan(conn, audit, &doc, max_attempts)?;
        report.orphaned_documents.push(doc.id);
    }

    if !report.is_empty() {
        tracing::info!(
            requeued = report.requeued.len(),
            abandoned = report.abandoned.len(),
            orphaned = report.orphaned_documents.len(),
            "Stale job sweep recovered work"
        );
    }
    Ok(report)
}

/// A `processing` document with no live job: retry it if its last job still
/// had attempts left, otherwise fail it.
fn recover_orphan(
    conn: &Connection,
    audit: &AuditNotifier,
    doc: &Document,
    max_attempts: u32,
) -> Result<(), DatabaseError> {
    let attempts = last_extraction_job(conn, &doc.id)?
        .map(|job| job.attempts)
        .unwrap_or(0);

    let tx = conn.unchecked_transaction()?;
    if attempts < max_attempts {
        let moved = db::transition_extraction_status(
            &tx,
            &doc.id,
            ExtractionStatus::Processing,
            ExtractionStatus::Pending,
        )?;
        if moved == 0 {
            return Ok(());
        }
        queue::enqueue_extraction(&tx, &doc.id)?;
        tx.commit()?;
        notify(audit, &doc.id, ExtractionStatus::Pending, REASON_REQUEUED);
    } else {
        if db::mark_extraction_failed(&tx, &doc.id, ABANDONED_MESSAGE, None, None)? == 0 {
            return Ok(());
        }
        tx.commit()?;
        notify(audit, &doc.id, ExtractionStatus::Failed, REASON_ABANDONED);
    }
    tracing::warn!(document_id = %doc.id, attempts, "Orphaned extraction recovered");
    Ok(())
}

fn last_extraction_job(conn: &Connection, document_id: &Uuid) -> Result<Option<Job>, DatabaseError> {
    Ok(db::list_jobs_for_document(conn, document_id)?
        .into_iter()
        .filter(|job| job.kind == JobKind::Extraction)
        .last())
}

fn notify(audit: &AuditNotifier, document_id: &Uuid, to: ExtractionStatus, reason: &str) {
    audit.notify(
        AuditEvent::new(
            Actor::System,
            actions::EXTRACTION_STATUS_CHANGED,
            "document",
            document_id,
        )
        .with_change(
            "extraction_status",
            Some(ExtractionStatus::Processing.to_string()),
            Some(to.to_string()),
        )
        .with_reason(reason),
    );
}
