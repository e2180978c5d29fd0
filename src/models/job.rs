use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{JobKind, JobStatus};

/// A durable unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub document_id: Uuid,
    /// JSON arguments; `{}` for extraction, an `AnalyzeRequest` for analysis.
    pub payload: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub run_after: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last sign of life from the claiming worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A queued job, runnable immediately.
    pub fn queued(kind: JobKind, document_id: Uuid, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            document_id,
            payload: payload.into(),
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
        }
    }
}
