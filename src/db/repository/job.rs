use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_uuid, truncate_chars, MAX_EXTRACTION_ERROR_CHARS};
use crate::db::DatabaseError;
use crate::models::*;

const JOB_COLUMNS: &str = "id, kind, document_id, payload, status, attempts, worker_id, run_after,
     claimed_at, heartbeat_at, finished_at, error, result, created_at, updated_at";

pub fn insert_job(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, kind, document_id, payload, status, attempts, worker_id, run_after,
         claimed_at, heartbeat_at, finished_at, error, result, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.id.to_string(),
            job.kind.as_str(),
            job.document_id.to_string(),
            job.payload,
            job.status.as_str(),
            job.attempts,
            job.worker_id,
            job.run_after,
            job.claimed_at,
            job.heartbeat_at,
            job.finished_at,
            job.error,
            job.result,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_job(conn: &Connection, id: &Uuid) -> Result<Option<Job>, DatabaseError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    let result = conn.query_row(&sql, params![id.to_string()], read_job_row);

    match result {
        Ok(row) => Ok(Some(job_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The queued or running extraction job of a document, if any.
pub fn find_live_extraction_job(
    conn: &Connection,
    document_id: &Uuid,
) -> Result<Option<Job>, DatabaseError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE document_id = ?1 AND kind = 'extraction' AND status IN ('queued', 'running')
         LIMIT 1"
    );
    let row = conn
        .query_row(&sql, params![document_id.to_string()], read_job_row)
        .optional()?;
    row.map(job_from_row).transpose()
}

pub fn list_jobs_for_document(conn: &Connection, document_id: &Uuid) -> Result<Vec<Job>, DatabaseError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE document_id = ?1 ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![document_id.to_string()], read_job_row)?;

    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(job_from_row(row?)?);
    }
    Ok(jobs)
}

/// Claim the oldest runnable job for `worker_id`.
///
/// Must run inside a write (IMMEDIATE) transaction so that the select and the
/// conditional update are one atomic step across connections.
pub fn claim_next_job(
    conn: &Connection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let candidate: Option<String> = conn
        .query_row(
            "SELECT id FROM jobs WHERE status = 'queued' AND run_after <= ?1
             ORDER BY run_after ASC, created_at ASC LIMIT 1",
            params![now],
            |row| row.get(0),
        )
        .optional()?;

    let Some(job_id) = candidate else {
        return Ok(None);
    };

    let claimed = conn.execute(
        "UPDATE jobs SET status = 'running', attempts = attempts + 1, worker_id = ?2,
         claimed_at = ?3, heartbeat_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'queued'",
        params![job_id, worker_id, now],
    )?;
    if claimed == 0 {
        return Ok(None);
    }

    get_job(conn, &parse_uuid(&job_id)?)
}

pub fn mark_job_succeeded(conn: &Connection, id: &Uuid, result: Option<&str>) -> Result<(), DatabaseError> {
    let now = Utc::now();
    conn.execute(
        "UPDATE jobs SET status = 'succeeded', result = ?2, error = NULL, finished_at = ?3,
         updated_at = ?3
         WHERE id = ?1",
        params![id.to_string(), result, now],
    )?;
    Ok(())
}

pub fn mark_job_failed(conn: &Connection, id: &Uuid, error: &str) -> Result<(), DatabaseError> {
    let now = Utc::now();
    conn.execute(
        "UPDATE jobs SET status = 'failed', error = ?2, finished_at = ?3, updated_at = ?3
         WHERE id = ?1",
        params![id.to_string(), truncate_chars(error, MAX_EXTRACTION_ERROR_CHARS), now],
    )?;
    Ok(())
}

/// Return a running job to the queue. Attempts are kept.
pub fn requeue_job(conn: &Connection, id: &Uuid, run_after: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE jobs SET status = 'queued', worker_id = NULL, claimed_at = NULL, heartbeat_at = NULL,
         run_after = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'running'",
        params![id.to_string(), run_after, Utc::now()],
    )?;
    Ok(rows)
}

/// Record that `worker_id` is still working on job `id`.
///
/// Returns 0 when the job is no longer running under that worker's claim.
pub fn touch_job(conn: &Connection, id: &Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE jobs SET heartbeat_at = ?3
         WHERE id = ?1 AND status = 'running' AND worker_id = ?2",
        params![id.to_string(), worker_id, now],
    )?;
    Ok(rows)
}

/// Running jobs whose worker has not been heard from since `silent_since`.
pub fn list_stale_running_jobs(
    conn: &Connection,
    silent_since: DateTime<Utc>,
) -> Result<Vec<Job>, DatabaseError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE status = 'running' AND COALESCE(heartbeat_at, claimed_at) < ?1
         ORDER BY claimed_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![silent_since], read_job_row)?;

    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(job_from_row(row?)?);
    }
    Ok(jobs)
}

struct JobRow {
    id: String,
    kind: String,
    document_id: String,
    payload: String,
    status: String,
    attempts: u32,
    worker_id: Option<String>,
    run_after: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        document_id: row.get(2)?,
        payload: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        worker_id: row.get(6)?,
        run_after: row.get(7)?,
        claimed_at: row.get(8)?,
        heartbeat_at: row.get(9)?,
        finished_at: row.get(10)?,
        error: row.get(11)?,
        result: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn job_from_row(row: JobRow) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: parse_uuid(&row.id)?,
        kind: JobKind::from_str(&row.kind)?,
        document_id: parse_uuid(&row.document_id)?,
        payload: row.payload,
        status: JobStatus::from_str(&row.status)?,
        attempts: row.attempts,
        worker_id: row.worker_id,
        run_after: row.run_after,
        claimed_at: row.claimed_at,
        heartbeat_at: row.heartbeat_at,
        finished_at: row.finished_at,
        error: row.error,
        result: row.result,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
