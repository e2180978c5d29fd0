//! Repository layer: entity-scoped database operations.
//!
//! Free functions over a borrowed `Connection`. Callers own transactions.
//! Matrix entries live behind the `MatrixEntryStore` trait in `pipeline::matrix`.

mod document;
mod job;
mod requirement;

use uuid::Uuid;

use super::DatabaseError;

pub use document::*;
pub use job::*;
pub use requirement::*;

/// Parse a UUID stored as TEXT.
pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::InvalidUuid {
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Cut `text` to at most `max` characters without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rusqlite::Connection;
    use uuid::Uuid;

    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::*;

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    fn make_document(conn: &Connection) -> Document {
        let doc = Document::new_pending(
            "proj-1",
            "tender.pdf",
            "/uploads/proj-1/tender.pdf",
            "application/pdf",
            2048,
            "ab".repeat(32),
        );
        insert_document(conn, &doc).unwrap();
        doc
    }

    fn make_job(conn: &Connection, document_id: Uuid, kind: JobKind) -> Job {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind,
            document_id,
            payload: "{}".into(),
            status: JobStatus::Queued,
            attempts: 0,
            worker_id: None,
            run_after: now,
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        insert_job(conn, &job).unwrap();
        job
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn document_insert_and_retrieve() {
        let conn = test_db();
        let doc = make_document(&conn);
        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.original_filename, "tender.pdf");
        assert_eq!(loaded.extraction_status, ExtractionStatus::Pending);
        assert_eq!(loaded.checksum.len(), 64);
        assert!(loaded.extracted_data.is_none());
    }

    #[test]
    fn missing_document_is_none() {
        let conn = test_db();
        assert!(get_document(&conn, &Uuid::new_v4()).unwrap().is_none());
        assert!(matches!(
            require_document(&conn, &Uuid::new_v4()),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn conditional_transition_applies_once() {
        let conn = test_db();
        let doc = make_document(&conn);

        let first = transition_extraction_status(
            &conn,
            &doc.id,
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
        )
        .unwrap();
        let second = transition_extraction_status(
            &conn,
            &doc.id,
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
        )
        .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[test]
    fn completion_only_applies_while_processing() {
        let conn = test_db();
        let doc = make_document(&conn);

        let rows = mark_extraction_completed(&conn, &doc.id, "{}", "mock", "mock-1", Utc::now()).unwrap();
        assert_eq!(rows, 0, "pending document cannot complete");

        transition_extraction_status(&conn, &doc.id, ExtractionStatus::Pending, ExtractionStatus::Processing)
            .unwrap();
        let rows = mark_extraction_completed(&conn, &doc.id, "{\"pages\":[]}", "mock", "mock-1", Utc::now())
            .unwrap();
        assert_eq!(rows, 1);

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Completed);
        assert_eq!(loaded.extraction_provider.as_deref(), Some("mock"));
        assert_eq!(loaded.extraction_model.as_deref(), Some("mock-1"));
        assert!(loaded.extracted_at.is_some());
        assert!(loaded.extraction_error.is_none());
    }

    #[test]
    fn failure_message_is_truncated() {
        let conn = test_db();
        let doc = make_document(&conn);
        transition_extraction_status(&conn, &doc.id, ExtractionStatus::Pending, ExtractionStatus::Processing)
            .unwrap();

        let long = "x".repeat(5000);
        mark_extraction_failed(&conn, &doc.id, &long, Some("gemini"), None).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Failed);
        assert_eq!(loaded.extraction_error.unwrap().chars().count(), MAX_EXTRACTION_ERROR_CHARS);
        assert_eq!(loaded.extraction_provider.as_deref(), Some("gemini"));
    }

    #[test]
    fn reset_clears_outcome_but_not_while_processing() {
        let conn = test_db();
        let doc = make_document(&conn);
        transition_extraction_status(&conn, &doc.id, ExtractionStatus::Pending, ExtractionStatus::Processing)
            .unwrap();
        assert_eq!(reset_extraction(&conn, &doc.id).unwrap(), 0);

        mark_extraction_failed(&conn, &doc.id, "boom", None, None).unwrap();
        assert_eq!(reset_extraction(&conn, &doc.id).unwrap(), 1);

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Pending);
        assert!(loaded.extraction_error.is_none());
    }

    #[test]
    fn requirement_insert_and_list() {
        let conn = test_db();
        let mut req = Requirement::new("proj-1", "REQ-002", "Operating temperature -40..85C");
        req.priority = Priority::High;
        insert_requirement(&conn, &req).unwrap();
        insert_requirement(&conn, &Requirement::new("proj-1", "REQ-001", "IP67 enclosure")).unwrap();
        insert_requirement(&conn, &Requirement::new("proj-2", "REQ-001", "Other project")).unwrap();

        let listed = list_requirements_by_project(&conn, "proj-1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].code, "REQ-001");

        let loaded = get_requirement(&conn, &req.id).unwrap().unwrap();
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.category_or_default(), "General");
    }

    #[test]
    fn requirement_status_update() {
        let conn = test_db();
        let req = Requirement::new("proj-1", "REQ-001", "IP67 enclosure");
        insert_requirement(&conn, &req).unwrap();
        update_requirement_status(&conn, &req.id, RequirementStatus::Completed).unwrap();
        let loaded = get_requirement(&conn, &req.id).unwrap().unwrap();
        assert_eq!(loaded.status, RequirementStatus::Completed);

        let missing = update_requirement_status(&conn, &Uuid::new_v4(), RequirementStatus::Completed);
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn one_live_extraction_job_per_document() {
        let conn = test_db();
        let doc = make_document(&conn);
        make_job(&conn, doc.id, JobKind::Extraction);

        let now = Utc::now();
        let duplicate = Job {
            id: Uuid::new_v4(),
            kind: JobKind::Extraction,
            document_id: doc.id,
            payload: "{}".into(),
            status: JobStatus::Queued,
            attempts: 0,
            worker_id: None,
            run_after: now,
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        let err = insert_job(&conn, &duplicate).unwrap_err();
        assert!(err.is_unique_violation());

        // Analysis jobs are not limited.
        make_job(&conn, doc.id, JobKind::Analysis);
        make_job(&conn, doc.id, JobKind::Analysis);
        assert_eq!(list_jobs_for_document(&conn, &doc.id).unwrap().len(), 3);
    }

    #[test]
    fn claim_marks_running_and_counts_attempt() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);

        let claimed = claim_next_job(&conn, "worker-0", Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-0"));

        assert!(claim_next_job(&conn, "worker-1", Utc::now()).unwrap().is_none());
        assert!(find_live_extraction_job(&conn, &doc.id).unwrap().is_some());
    }

    #[test]
    fn claim_respects_run_after() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);
        claim_next_job(&conn, "w", Utc::now()).unwrap().unwrap();
        requeue_job(&conn, &job.id, Utc::now() + Duration::minutes(10)).unwrap();

        assert!(claim_next_job(&conn, "w", Utc::now()).unwrap().is_none());
        let later = claim_next_job(&conn, "w", Utc::now() + Duration::minutes(11)).unwrap().unwrap();
        assert_eq!(later.attempts, 2);
    }

    #[test]
    fn finished_job_frees_the_live_slot() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);
        claim_next_job(&conn, "w", Utc::now()).unwrap();
        mark_job_failed(&conn, &job.id, "provider exploded").unwrap();

        let loaded = get_job(&conn, &job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.finished_at.is_some());
        assert!(find_live_extraction_job(&conn, &doc.id).unwrap().is_none());

        make_job(&conn, doc.id, JobKind::Extraction);
    }

    #[test]
    fn stale_running_jobs_listed_by_heartbeat() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);
        claim_next_job(&conn, "w", Utc::now()).unwrap().unwrap();
        let long_ago = Utc::now() - Duration::hours(2);
        conn.execute(
            "UPDATE jobs SET claimed_at = ?2, heartbeat_at = ?2 WHERE id = ?1",
            rusqlite::params![job.id.to_string(), long_ago],
        )
        .unwrap();

        let stale = list_stale_running_jobs(&conn, Utc::now() - Duration::minutes(30)).unwrap();
        assert_eq!(stale.len(), 1);
        let fresh = list_stale_running_jobs(&conn, long_ago - Duration::minutes(1)).unwrap();
        assert!(fresh.is_empty());

        // An old claim with a recent heartbeat is alive.
        assert_eq!(touch_job(&conn, &job.id, "w", Utc::now()).unwrap(), 1);
        assert!(list_stale_running_jobs(&conn, Utc::now() - Duration::minutes(30)).unwrap().is_empty());
    }

    #[test]
    fn heartbeat_only_from_the_claiming_worker() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);
        assert_eq!(touch_job(&conn, &job.id, "w", Utc::now()).unwrap(), 0);

        let claimed = claim_next_job(&conn, "w", Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.heartbeat_at, claimed.claimed_at);
        assert_eq!(touch_job(&conn, &job.id, "other", Utc::now()).unwrap(), 0);
        assert_eq!(touch_job(&conn, &job.id, "w", Utc::now()).unwrap(), 1);

        requeue_job(&conn, &job.id, Utc::now()).unwrap();
        assert_eq!(touch_job(&conn, &job.id, "w", Utc::now()).unwrap(), 0);
        assert!(get_job(&conn, &job.id).unwrap().unwrap().heartbeat_at.is_none());
    }

    #[test]
    fn orphaned_processing_documents_exclude_live_jobs() {
        let conn = test_db();
        let orphan = make_document(&conn);
        let tracked = make_document(&conn);
        for doc in [&orphan, &tracked] {
            transition_extraction_status(&conn, &doc.id, ExtractionStatus::Pending, ExtractionStatus::Processing)
                .unwrap();
        }
        make_job(&conn, tracked.id, JobKind::Extraction);

        let orphans = list_orphaned_processing_documents(&conn).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan.id);
    }

    #[test]
    fn deleting_document_cascades_to_jobs() {
        let conn = test_db();
        let doc = make_document(&conn);
        let job = make_job(&conn, doc.id, JobKind::Extraction);
        delete_document(&conn, &doc.id).unwrap();
        assert!(get_job(&conn, &job.id).unwrap().is_none());
        assert!(matches!(delete_document(&conn, &doc.id), Err(DatabaseError::NotFound { .. })));
    }
}
