//! Durable job queue on the `jobs` table.
//!
//! Enqueueing is a plain insert; the partial unique index on live extraction
//! jobs turns a double enqueue into a constraint error. Claiming happens in an
//! IMMEDIATE transaction so two workers (or two processes) can never both move
//! the same job to `running`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::Actor;
use crate::db::{self, DatabaseError};
use crate::models::{Job, JobKind};
use crate::pipeline::analysis::AnalyzeRequest;
use crate::pipeline::PipelineError;

/// Payload stored on extraction jobs.
const EMPTY_PAYLOAD: &str = "{}";

/// Payload stored on analysis jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    #[serde(flatten)]
    pub request: AnalyzeRequest,
    pub requested_by: Actor,
}

pub fn enqueue_extraction(conn: &Connection, document_id: &Uuid) -> Result<Job, DatabaseError> {
    let job = Job::queued(JobKind::Extraction, *document_id, EMPTY_PAYLOAD);
    db::insert_job(conn, &job)?;
    tracing::debug!(job_id = %job.id, document_id = %document_id, "Extraction job queued");
    Ok(job)
}

pub fn enqueue_analysis(
    conn: &Connection,
    request: &AnalyzeRequest,
    requested_by: &Actor,
) -> Result<Job, PipelineError> {
    let payload = serde_json::to_string(&AnalysisJob {
        request: request.clone(),
        requested_by: requested_by.clone(),
    })?;
    let job = Job::queued(JobKind::Analysis, request.document_id, payload);
    db::insert_job(conn, &job)?;
    tracing::debug!(
        job_id = %job.id,
        document_id = %request.document_id,
        requirements = request.requirement_ids.len(),
        "Analysis job queued"
    );
    Ok(job)
}

/// Atomically claim the oldest runnable job, if any.
pub fn claim(conn: &Connection, worker_id: &str) -> Result<Option<Job>, DatabaseError> {
    claim_at(conn, worker_id, Utc::now())
}

pub fn claim_at(
    conn: &Connection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let job = db::claim_next_job(&tx, worker_id, now)?;
    tx.commit()?;

    if let Some(job) = &job {
        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
            worker = worker_id,
            "Job claimed"
        );
    }
    Ok(job)
}

/// Decode the payload of an analysis job.
pub fn analysis_payload(job: &Job) -> Result<AnalysisJob, PipelineError> {
    Ok(serde_json::from_str(&job.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_memory_database, Database};
    use crate::models::{Document, JobStatus};

    fn seed_document(conn: &Connection) -> Uuid {
        let doc = Document::new_pending("p1", "spec.pdf", "/tmp/spec.pdf", "application/pdf", 10, "abc");
        db::insert_document(conn, &doc).unwrap();
        doc.id
    }

    #[test]
    fn double_extraction_enqueue_is_rejected() {
        let conn = open_memory_database().unwrap();
        let doc = seed_document(&conn);

        enqueue_extraction(&conn, &doc).unwrap();
        let err = enqueue_extraction(&conn, &doc).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn claim_marks_running_and_counts_attempt() {
        let conn = open_memory_database().unwrap();
        let doc = seed_document(&conn);
        let queued = enqueue_extraction(&conn, &doc).unwrap();

        let claimed = claim(&conn, "w-1").unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w-1"));

        assert!(claim(&conn, "w-2").unwrap().is_none());
    }

    #[test]
    fn analysis_payload_round_trips() {
        let conn = open_memory_database().unwrap();
        let doc = seed_document(&conn);
        let request = AnalyzeRequest {
            document_id: doc,
            requirement_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            force_regenerate: true,
        };

        let job = enqueue_analysis(&conn, &request, &Actor::user("alice")).unwrap();
        assert_eq!(job.kind, JobKind::Analysis);
        let payload = analysis_payload(&job).unwrap();
        assert_eq!(payload.request, request);
        assert_eq!(payload.requested_by, Actor::user("alice"));
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open(dir.path().join("queue.db")).unwrap();
        {
            let conn = database.connect().unwrap();
            for _ in 0..20 {
                let doc = seed_document(&conn);
                enqueue_extraction(&conn, &doc).unwrap();
            }
        }

        let claimed: Vec<Uuid> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|w| {
                    let database = database.clone();
                    s.spawn(move || {
                        let conn = database.connect().unwrap();
                        let mut mine = Vec::new();
                        while let Some(job) = claim(&conn, &format!("w-{w}")).unwrap() {
                            mine.push(job.id);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let mut unique = claimed.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(claimed.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
