//! Pull-based status queries for documents and jobs.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PipelineError;
use crate::db;
use crate::models::{Document, ExtractionStatus, Job};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub document_id: Uuid,
    pub extraction_status: ExtractionStatus,
    pub extraction_error: Option<String>,
    pub extraction_provider: Option<String>,
    pub extraction_model: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub has_extracted_data: bool,
}

impl From<&Document> for DocumentStatus {
    fn from(doc: &Document) -> Self {
        Self {
            document_id: doc.id,
            extraction_status: doc.extraction_status,
            extraction_error: doc.extraction_error.clone(),
            extraction_provider: doc.extraction_provider.clone(),
            extraction_model: doc.extraction_model.clone(),
            extracted_at: doc.extracted_at,
            has_extracted_data: doc.extracted_data.is_some(),
        }
    }
}

pub fn document_status(conn: &Connection, document_id: &Uuid) -> Result<DocumentStatus, PipelineError> {
    let doc = db::require_document(conn, document_id)?;
    Ok(DocumentStatus::from(&doc))
}

pub fn job_status(conn: &Connection, job_id: &Uuid) -> Result<Job, PipelineError> {
    db::get_job(conn, job_id)?.ok_or_else(|| PipelineError::not_found("Job", job_id))
}

/// Final observation of a poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Terminal(DocumentStatus),
    /// Gave up; carries the last status seen.
    TimedOut(DocumentStatus),
}

/// Call `fetch` every `interval` until the extraction is completed or failed,
/// or `timeout` elapses. Errors from `fetch` end the loop.
pub fn poll_until_terminal<F>(
    mut fetch: F,
    interval: Duration,
    timeout: Duration,
) -> Result<PollResult, PipelineError>
where
    F: FnMut() -> Result<DocumentStatus, PipelineError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let status = fetch()?;
        if status.extraction_status.is_terminal() {
            return Ok(PollResult::Terminal(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(PollResult::TimedOut(status));
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}
