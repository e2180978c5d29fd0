//! Worker pool draining the job queue.
//!
//! Each worker thread owns its own SQLite connection, claims one job at a time
//! and runs it to the end while a companion thread refreshes the job's
//! heartbeat. One extra thread runs the stale-job sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::{queue, sweep};
use crate::audit::AuditNotifier;
use crate::config::PipelineSettings;
use crate::db::{self, Database};
use crate::models::{Job, JobKind, JobStatus};
use crate::pipeline::analysis::AnalysisOrchestrator;
use crate::pipeline::extraction::{ExtractionOrchestrator, ExtractionOutcome};
use crate::pipeline::PipelineError;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(200);

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);
const MAX_HEARTBEAT: Duration = Duration::from_secs(60);

/// What happened to one claimed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
}

pub struct JobDispatcher {
    db: Database,
    extraction: Arc<ExtractionOrchestrator>,
    analysis: Arc<AnalysisOrchestrator>,
    audit: Arc<AuditNotifier>,
    settings: PipelineSettings,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        extraction: Arc<ExtractionOrchestrator>,
        analysis: Arc<AnalysisOrchestrator>,
        audit: Arc<AuditNotifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            extraction,
            analysis,
            audit,
            settings,
        }
    }

    /// Spawn the worker threads and the sweeper.
    pub fn start(self) -> DispatcherHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher = Arc::new(self);
        let mut threads = Vec::new();

        for n in 0..dispatcher.settings.workers.max(1) {
            let worker_id = format!("worker-{}-{n}", std::process::id());
            let flag = shutdown.clone();
            let dispatcher = dispatcher.clone();
            let spawned = std::thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || dispatcher.worker_loop(&worker_id, &flag));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => tracing::warn!(error = %e, "Failed to spawn worker thread"),
            }
        }

        let flag = shutdown.clone();
        let sweeper = dispatcher.clone();
        match std::thread::Builder::new()
            .name("stale-job-sweeper".into())
            .spawn(move || sweeper.sweep_loop(&flag))
        {
            Ok(handle) => threads.push(handle),
            Err(e) => tracing::warn!(error = %e, "Failed to spawn sweeper thread"),
        }

        tracing::info!(workers = dispatcher.settings.workers.max(1), "Job dispatcher started");
        DispatcherHandle {
            shutdown,
            threads,
        }
    }

    /// Claim and run a single job. `Ok(None)` when the queue is empty.
    pub fn run_once(&self, worker_id: &str) -> Result<Option<JobReport>, PipelineError> {
        let conn = self.db.connect()?;
        let Some(job) = queue::claim(&conn, worker_id)? else {
            return Ok(None);
        };

        let status = self.with_heartbeat(&job, worker_id, || match job.kind {
            JobKind::Extraction => self.run_extraction(&conn, &job),
            JobKind::Analysis => self.run_analysis(&conn, &job),
        })?;
        Ok(Some(JobReport {
            job_id: job.id,
            kind: job.kind,
            status,
        }))
    }

    /// Run `work` while a scoped thread keeps the claim on `job` alive.
    fn with_heartbeat<T>(&self, job: &Job, worker_id: &str, work: impl FnOnce() -> T) -> T {
        let done = AtomicBool::new(false);
        let interval = heartbeat_interval(self.settings.stale_after);
        std::thread::scope(|scope| {
            scope.spawn(|| self.heartbeat_loop(&job.id, worker_id, interval, &done));
            let _stop = StopOnDrop(&done);
            work()
        })
    }

    fn heartbeat_loop(&self, job_id: &Uuid, worker_id: &str, interval: Duration, done: &AtomicBool) {
        let conn = match self.db.connect() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Heartbeat connection failed");
                return;
            }
        };
        loop {
            sleep_unless_shutdown(interval, done);
            if done.load(Ordering::Relaxed) {
                return;
            }
            match db::touch_job(&conn, job_id, worker_id, Utc::now()) {
                Ok(0) => {
                    tracing::warn!(job_id = %job_id, worker = worker_id, "Job claim lost, heartbeat stopped");
                    return;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Heartbeat write failed"),
            }
        }
    }

    fn run_extraction(&self, conn: &rusqlite::Connection, job: &Job) -> Result<JobStatus, PipelineError> {
        match self.extraction.process(&job.document_id) {
            Ok(outcome) => {
                let result = serde_json::to_string(&outcome)?;
                match &outcome {
                    ExtractionOutcome::Completed { .. } => {
                        db::mark_job_succeeded(conn, &job.id, Some(&result))?;
                        Ok(JobStatus::Succeeded)
                    }
                    ExtractionOutcome::Failed { message, .. } => {
                        db::mark_job_failed(conn, &job.id, message)?;
                        Ok(JobStatus::Failed)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, document_id = %job.document_id, error = %e, "Extraction job failed");
                db::mark_job_failed(conn, &job.id, &e.to_string())?;
                Ok(JobStatus::Failed)
            }
        }
    }

    fn run_analysis(&self, conn: &rusqlite::Connection, job: &Job) -> Result<JobStatus, PipelineError> {
        let outcome = queue::analysis_payload(job)
            .and_then(|payload| self.analysis.analyze(&payload.request, &payload.requested_by));
        match outcome {
            Ok(outcome) => {
                let result = serde_json::to_string(&outcome.summary())?;
                db::mark_job_succeeded(conn, &job.id, Some(&result))?;
                Ok(JobStatus::Succeeded)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, document_id = %job.document_id, error = %e, "Analysis job failed");
                db::mark_job_failed(conn, &job.id, &e.to_string())?;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Run the stale-job sweep once, now.
    pub fn sweep_once(&self) -> Result<sweep::SweepReport, PipelineError> {
        let conn = self.db.connect()?;
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Ok(sweep::recover_stale_jobs(
            &conn,
            &self.audit,
            Utc::now() - stale_after,
            self.settings.max_job_attempts,
        )?)
    }

    fn worker_loop(&self, worker_id: &str, shutdown: &AtomicBool) {
        tracing::info!(worker = worker_id, "Worker started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.run_once(worker_id) {
                Ok(Some(report)) => {
                    tracing::debug!(worker = worker_id, job_id = %report.job_id, status = %report.status, "Job finished");
                }
                Ok(None) => sleep_unless_shutdown(self.settings.poll_interval, shutdown),
                Err(e) => {
                    tracing::warn!(worker = worker_id, error = %e, "Worker iteration failed");
                    sleep_unless_shutdown(self.settings.poll_interval, shutdown);
                }
            }
        }
        tracing::info!(worker = worker_id, "Worker shutting down");
    }

    fn sweep_loop(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.sweep_once() {
                tracing::warn!(error = %e, "Stale job sweep failed");
            }
            sleep_unless_shutdown(self.settings.sweep_interval, shutdown);
        }
    }
}

/// Beat often enough that a live worker is never older than `stale_after`.
fn heartbeat_interval(stale_after: Duration) -> Duration {
    (stale_after / 4).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

/// Raises the flag when dropped, including on unwind.
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let step = remaining.min(SLEEP_GRANULARITY);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Handle for the running dispatcher.
///
/// `shutdown()` asks every thread to stop after its current job; dropping the
/// handle also waits for them.
pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Block until every thread has exited. Returns immediately after `shutdown`
    /// once in-flight jobs finish.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
