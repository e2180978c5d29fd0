//! Application state shared by every entry point.
//!
//! `CoreState` owns the database handle, the configured providers, the audit
//! notifier and the two orchestrators. Every public operation of the pipeline
//! goes through it; nothing is held in globals.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use crate::audit::{actions, Actor, AuditEvent, AuditNotifier, AuditSink, TracingAuditSink};
use crate::config::AppConfig;
use crate::db::{self, Database};
use crate::models::{
    Document, ExtractionStatus, FieldChange, Job, MatrixEntry, MatrixEntryPatch, Requirement, ReviewStatus,
};
use crate::pipeline::analysis::{AnalysisOrchestrator, AnalysisOutcome, AnalyzeRequest};
use crate::pipeline::dispatch::{self, DispatcherHandle, JobDispatcher};
use crate::pipeline::extraction::ExtractionOrchestrator;
use crate::pipeline::import::{self, ImportResult, UploadLimits};
use crate::pipeline::matrix::{MatrixEntryStore, SqliteMatrixStore};
use crate::pipeline::provider::{ProviderHealth, ProviderSet};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::status::{self, DocumentStatus};
use crate::pipeline::PipelineError;

pub struct CoreState {
    config: AppConfig,
    db: Database,
    providers: ProviderSet,
    audit: Arc<AuditNotifier>,
    store: Arc<dyn MatrixEntryStore>,
    extraction: Arc<ExtractionOrchestrator>,
    analysis: Arc<AnalysisOrchestrator>,
}

impl CoreState {
    /// Providers from configuration, audit events to the `audit` log target.
    pub fn from_config(config: AppConfig) -> Result<Self, PipelineError> {
        let providers = ProviderSet::from_config(&config)?;
        Self::new(config, providers, Arc::new(TracingAuditSink))
    }

    pub fn new(
        config: AppConfig,
        providers: ProviderSet,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Result<Self, PipelineError> {
        let db = Database::open(&config.database_path)?;
        std::fs::create_dir_all(&config.upload_dir)?;

        let audit = Arc::new(AuditNotifier::start(audit_sink));
        let store: Arc<dyn MatrixEntryStore> = Arc::new(SqliteMatrixStore::new());
        let retry = RetryPolicy::from_settings(&config.pipeline);

        let extraction = Arc::new(ExtractionOrchestrator::new(
            db.clone(),
            providers.extraction.clone(),
            retry.clone(),
            audit.clone(),
        ));
        let analysis = Arc::new(AnalysisOrchestrator::new(
            db.clone(),
            providers.analysis.clone(),
            store.clone(),
            retry,
            audit.clone(),
            config.pipeline.analysis_concurrency,
        ));

        tracing::info!(database = %db.path().display(), "Core state ready");
        Ok(Self {
            config,
            db,
            providers,
            audit,
            store,
            extraction,
            analysis,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn audit(&self) -> &AuditNotifier {
        &self.audit
    }

    pub fn open_db(&self) -> Result<Connection, PipelineError> {
        Ok(self.db.connect()?)
    }

    pub fn provider_health(&self) -> ProviderHealth {
        self.providers.health()
    }

    // ── Intake & extraction ─────────────────────────────────

    pub fn import_document(
        &self,
        project_id: &str,
        filename: &str,
        bytes: &[u8],
        actor: &Actor,
    ) -> Result<ImportResult, PipelineError> {
        let conn = self.open_db()?;
        let limits = UploadLimits::from_config(&self.config);
        Ok(import::import_document(
            &conn,
            &limits,
            &self.audit,
            project_id,
            filename,
            bytes,
            actor,
        )?)
    }

    pub fn request_extraction(&self, document_id: &Uuid, actor: &Actor) -> Result<Job, PipelineError> {
        self.extraction.request_extraction(document_id, actor)
    }

    pub fn document_status(&self, document_id: &Uuid) -> Result<DocumentStatus, PipelineError> {
        status::document_status(&self.open_db()?, document_id)
    }

    pub fn job_status(&self, job_id: &Uuid) -> Result<Job, PipelineError> {
        status::job_status(&self.open_db()?, job_id)
    }

    /// Remove a document, its jobs and matrix entries, and its staged file.
    /// Refused while a worker is extracting it.
    pub fn delete_document(&self, document_id: &Uuid, actor: &Actor) -> Result<Document, PipelineError> {
        let conn = self.open_db()?;
        let doc = db::require_document(&conn, document_id)?;
        if doc.extraction_status == ExtractionStatus::Processing {
            return Err(PipelineError::Conflict(format!(
                "document {document_id} is being extracted"
            )));
        }
        db::delete_document(&conn, document_id)?;

        if !doc.file_path.is_empty() {
            if let Err(e) = import::remove_staged(Path::new(&doc.file_path)) {
                tracing::warn!(document_id = %document_id, error = %e, "Staged file not removed");
            }
        }
        self.audit.notify(
            AuditEvent::new(actor.clone(), actions::DOCUMENT_DELETED, "document", document_id)
                .with_change("original_filename", Some(doc.original_filename.clone()), None),
        );
        Ok(doc)
    }

    // ── Requirements ────────────────────────────────────────

    pub fn add_requirement(&self, requirement: &Requirement) -> Result<(), PipelineError> {
        Ok(db::insert_requirement(&self.open_db()?, requirement)?)
    }

    /// Remove a requirement together with its matrix entries.
    pub fn delete_requirement(&self, requirement_id: &Uuid, actor: &Actor) -> Result<Requirement, PipelineError> {
        let conn = self.open_db()?;
        let requirement = db::get_requirement(&conn, requirement_id)?
            .ok_or_else(|| PipelineError::not_found("Requirement", requirement_id))?;
        db::delete_requirement(&conn, requirement_id)?;
        self.audit.notify(
            AuditEvent::new(actor.clone(), actions::REQUIREMENT_DELETED, "requirement", requirement_id)
                .with_change("code", Some(requirement.code.clone()), None),
        );
        Ok(requirement)
    }

    pub fn list_requirements(&self, project_id: &str) -> Result<Vec<Requirement>, PipelineError> {
        Ok(db::list_requirements_by_project(&self.open_db()?, project_id)?)
    }

    // ── Analysis ────────────────────────────────────────────

    /// Analyse inline, on the calling thread.
    pub fn analyze(&self, request: &AnalyzeRequest, actor: &Actor) -> Result<AnalysisOutcome, PipelineError> {
        self.analysis.analyze(request, actor)
    }

    /// Queue the analysis for the dispatcher; the outcome lands in the job result.
    pub fn enqueue_analysis(&self, request: &AnalyzeRequest, actor: &Actor) -> Result<Job, PipelineError> {
        let conn = self.open_db()?;
        db::require_document(&conn, &request.document_id)?;
        dispatch::enqueue_analysis(&conn, request, actor)
    }

    // ── Matrix entries ──────────────────────────────────────

    pub fn matrix_for_document(&self, document_id: &Uuid) -> Result<Vec<MatrixEntry>, PipelineError> {
        self.store.list_by_document(&self.open_db()?, document_id)
    }

    pub fn entries_for_requirement(&self, requirement_id: &Uuid) -> Result<Vec<MatrixEntry>, PipelineError> {
        self.store.list_by_requirement(&self.open_db()?, requirement_id)
    }

    pub fn entry_history(
        &self,
        requirement_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Vec<MatrixEntry>, PipelineError> {
        self.store.list_history(&self.open_db()?, requirement_id, document_id)
    }

    pub fn edit_entry(
        &self,
        entry_id: &Uuid,
        patch: &MatrixEntryPatch,
        actor: &Actor,
    ) -> Result<Vec<FieldChange>, PipelineError> {
        let changes = self.store.edit(&self.open_db()?, entry_id, patch, &actor.to_string())?;
        for change in &changes {
            self.audit.notify(
                AuditEvent::new(actor.clone(), actions::MATRIX_ENTRY_UPDATED, "matrix_entry", entry_id)
                    .with_change(&change.field, change.old_value.clone(), change.new_value.clone()),
            );
        }
        Ok(changes)
    }

    pub fn advance_review(
        &self,
        entry_id: &Uuid,
        new_status: ReviewStatus,
        actor: &Actor,
    ) -> Result<MatrixEntry, PipelineError> {
        let conn = self.open_db()?;
        let before = self
            .store
            .get(&conn, entry_id)?
            .ok_or_else(|| PipelineError::not_found("MatrixEntry", entry_id))?;
        let entry = self
            .store
            .advance_review(&conn, entry_id, new_status, &actor.to_string())?;
        self.notify_review(actor, &entry, before.review_status, None);
        Ok(entry)
    }

    pub fn reopen_entry(&self, entry_id: &Uuid, actor: &Actor) -> Result<MatrixEntry, PipelineError> {
        let conn = self.open_db()?;
        let before = self
            .store
            .get(&conn, entry_id)?
            .ok_or_else(|| PipelineError::not_found("MatrixEntry", entry_id))?;
        let entry = self.store.reopen(&conn, entry_id, &actor.to_string())?;
        self.notify_review(actor, &entry, before.review_status, Some("reopened"));
        Ok(entry)
    }

    pub fn delete_entry(&self, entry_id: &Uuid, actor: &Actor) -> Result<MatrixEntry, PipelineError> {
        let entry = self.store.soft_delete(&self.open_db()?, entry_id)?;
        self.audit.notify(AuditEvent::new(
            actor.clone(),
            actions::MATRIX_ENTRY_DELETED,
            "matrix_entry",
            entry_id,
        ));
        Ok(entry)
    }

    fn notify_review(&self, actor: &Actor, entry: &MatrixEntry, from: ReviewStatus, reason: Option<&str>) {
        let mut event = AuditEvent::new(actor.clone(), actions::MATRIX_ENTRY_REVIEWED, "matrix_entry", entry.id)
            .with_change(
                "review_status",
                Some(from.to_string()),
                Some(entry.review_status.to_string()),
            );
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.audit.notify(event);
    }

    // ── Background work ─────────────────────────────────────

    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::new(
            self.db.clone(),
            self.extraction.clone(),
            self.analysis.clone(),
            self.audit.clone(),
            self.config.pipeline.clone(),
        )
    }

    pub fn start_dispatcher(&self) -> DispatcherHandle {
        self.dispatcher().start()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::models::{ComplianceStatus, ExtractionStatus, JobStatus};
    use crate::pipeline::provider::mock::MockProvider;
    use crate::pipeline::provider::ProviderError;
    use crate::pipeline::status::{poll_until_terminal, PollResult};

    struct Harness {
        _dir: tempfile::TempDir,
        mock: Arc<MockProvider>,
        sink: Arc<MemoryAuditSink>,
        state: CoreState,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("SPECMATRIX_DATA_DIR", dir.path().to_string_lossy().into_owned());
        env.insert("SPECMATRIX_EXTRACTION_PROVIDER", "mock".to_string());
        env.insert("SPECMATRIX_ANALYSIS_PROVIDER", "mock".to_string());
        env.insert("SPECMATRIX_RETRY_BASE_MS", "0".to_string());
        let config = AppConfig::from_lookup(|key| env.get(key).cloned()).unwrap();

        let mock = Arc::new(MockProvider::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let state = CoreState::new(
            config,
            ProviderSet::new(mock.clone(), mock.clone()),
            sink.clone(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            mock,
            sink,
            state,
        }
    }

    fn alice() -> Actor {
        Actor::user("alice")
    }

    fn wait_for_extraction(state: &CoreState, document_id: &Uuid) -> DocumentStatus {
        let result = poll_until_terminal(
            || state.document_status(document_id),
            Duration::from_millis(20),
            Duration::from_secs(10),
        )
        .unwrap();
        match result {
            PollResult::Terminal(status) => status,
            PollResult::TimedOut(status) => panic!("extraction did not finish: {status:?}"),
        }
    }

    #[test]
    fn upload_extract_analyze_regenerate() {
        let h = harness();
        let upload = h
            .state
            .import_document("proj-1", "supplier.md", b"# Datasheet\nIP67 rated", &alice())
            .unwrap();
        let doc_id = upload.document.id;
        assert_eq!(
            h.state.document_status(&doc_id).unwrap().extraction_status,
            ExtractionStatus::Pending
        );

        let handle = h.state.start_dispatcher();
        let status = wait_for_extraction(&h.state, &doc_id);
        handle.shutdown();
        drop(handle);
        assert_eq!(status.extraction_status, ExtractionStatus::Completed);
        assert!(status.has_extracted_data);
        assert_eq!(h.state.job_status(&upload.job.id).unwrap().status, JobStatus::Succeeded);

        let r1 = Requirement::new("proj-1", "R1", "Enclosure rated IP67");
        let r2 = Requirement::new("proj-1", "R2", "Operating range -20..60C");
        h.state.add_requirement(&r1).unwrap();
        h.state.add_requirement(&r2).unwrap();
        let request = |force| AnalyzeRequest {
            document_id: doc_id,
            requirement_ids: vec![r1.id, r2.id],
            force_regenerate: force,
        };

        let first = h.state.analyze(&request(false), &alice()).unwrap();
        assert_eq!(first.generated_count(), 2);

        let again = h.state.analyze(&request(false), &alice()).unwrap();
        assert_eq!(again.generated_count(), 0);
        assert_eq!(again.skipped_count(), 2);

        let forced = h.state.analyze(&request(true), &alice()).unwrap();
        assert_eq!(forced.generated_count(), 2);
        assert_eq!(h.state.matrix_for_document(&doc_id).unwrap().len(), 2);

        let deleted: usize = [r1.id, r2.id]
            .iter()
            .map(|id| {
                h.state
                    .entry_history(id, &doc_id)
                    .unwrap()
                    .iter()
                    .filter(|e| !e.is_active())
                    .count()
            })
            .sum();
        assert_eq!(deleted, 2);
    }

    #[test]
    fn finished_extraction_never_restarts_without_request() {
        let h = harness();
        let upload = h
            .state
            .import_document("proj-1", "a.txt", b"text", &alice())
            .unwrap();
        let dispatcher = h.state.dispatcher();
        dispatcher.run_once("w").unwrap().unwrap();
        assert!(dispatcher.run_once("w").unwrap().is_none());
        dispatcher.sweep_once().unwrap();

        let status = h.state.document_status(&upload.document.id).unwrap();
        assert_eq!(status.extraction_status, ExtractionStatus::Completed);
        assert_eq!(h.mock.extract_calls(), 1);

        h.state.request_extraction(&upload.document.id, &alice()).unwrap();
        assert_eq!(
            h.state.document_status(&upload.document.id).unwrap().extraction_status,
            ExtractionStatus::Pending
        );
        dispatcher.run_once("w").unwrap().unwrap();
        assert_eq!(h.mock.extract_calls(), 2);
    }

    #[test]
    fn queued_analysis_runs_on_dispatcher() {
        let h = harness();
        let upload = h
            .state
            .import_document("proj-1", "a.txt", b"text", &alice())
            .unwrap();
        let dispatcher = h.state.dispatcher();
        dispatcher.run_once("w").unwrap().unwrap();

        let req = Requirement::new("proj-1", "R1", "Something");
        h.state.add_requirement(&req).unwrap();
        let job = h
            .state
            .enqueue_analysis(
                &AnalyzeRequest {
                    document_id: upload.document.id,
                    requirement_ids: vec![req.id],
                    force_regenerate: false,
                },
                &alice(),
            )
            .unwrap();
        dispatcher.run_once("w").unwrap().unwrap();

        let job = h.state.job_status(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(h.state.entries_for_requirement(&req.id).unwrap().len(), 1);
    }

    #[test]
    fn review_workflow_is_audited() {
        let h = harness();
        let upload = h
            .state
            .import_document("proj-1", "a.txt", b"text", &alice())
            .unwrap();
        h.state.dispatcher().run_once("w").unwrap().unwrap();
        let req = Requirement::new("proj-1", "R1", "Something");
        h.state.add_requirement(&req).unwrap();
        let outcome = h
            .state
            .analyze(
                &AnalyzeRequest {
                    document_id: upload.document.id,
                    requirement_ids: vec![req.id],
                    force_regenerate: false,
                },
                &alice(),
            )
            .unwrap();
        let entry_id = outcome.generated[0].entry.id;

        let patch = MatrixEntryPatch {
            compliance_status: Some(ComplianceStatus::Partial),
            ..Default::default()
        };
        let changes = h.state.edit_entry(&entry_id, &patch, &Actor::user("bob")).unwrap();
        assert_eq!(changes.len(), 1);

        h.state.advance_review(&entry_id, ReviewStatus::Reviewed, &Actor::user("bob")).unwrap();
        let err = h
            .state
            .advance_review(&entry_id, ReviewStatus::Reviewed, &Actor::user("bob"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        h.state.reopen_entry(&entry_id, &Actor::user("lead")).unwrap();
        h.state.delete_entry(&entry_id, &Actor::user("lead")).unwrap();

        assert!(h.state.audit().flush(Duration::from_secs(5)));
        let updated = h.sink.with_action(actions::MATRIX_ENTRY_UPDATED);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].field.as_deref(), Some("compliance_status"));
        assert_eq!(h.sink.with_action(actions::MATRIX_ENTRY_REVIEWED).len(), 2);
        assert_eq!(h.sink.with_action(actions::MATRIX_ENTRY_DELETED).len(), 1);
    }

    #[test]
    fn upload_errors_surface_as_pipeline_errors() {
        let h = harness();
        let err = h
            .state
            .import_document("proj-1", "virus.exe", b"MZ", &alice())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upload(_)));
    }

    #[test]
    fn provider_failure_surfaces_in_status() {
        let h = harness();
        h.mock.push_extraction(Err(ProviderError::UnsupportedInput("encrypted pdf".into())));
        let upload = h
            .state
            .import_document("proj-1", "a.txt", b"text", &alice())
            .unwrap();
        h.state.dispatcher().run_once("w").unwrap().unwrap();

        let status = h.state.document_status(&upload.document.id).unwrap();
        assert_eq!(status.extraction_status, ExtractionStatus::Failed);
        assert!(status.extraction_error.unwrap().contains("encrypted pdf"));
        assert!(!status.has_extracted_data);
    }

    #[test]
    fn mock_providers_report_healthy() {
        let h = harness();
        let health = h.state.provider_health();
        assert!(health.extraction.available);
        assert!(health.analysis.available);
    }

    /// An extracted upload with one generated matrix entry.
    fn analyzed_upload(h: &Harness) -> (Document, Requirement, MatrixEntry) {
        let upload = h
            .state
            .import_document("proj-1", "sheet.txt", b"IP67 enclosure", &alice())
            .unwrap();
        h.state.dispatcher().run_once("w").unwrap().unwrap();

        let req = Requirement::new("proj-1", "R1", "Enclosure rated IP67");
        h.state.add_requirement(&req).unwrap();
        let outcome = h
            .state
            .analyze(
                &AnalyzeRequest {
                    document_id: upload.document.id,
                    requirement_ids: vec![req.id],
                    force_regenerate: false,
                },
                &alice(),
            )
            .unwrap();
        let entry = outcome.generated[0].entry.clone();
        let conn = h.state.open_db().unwrap();
        let doc = db::require_document(&conn, &upload.document.id).unwrap();
        (doc, req, entry)
    }

    #[test]
    fn deleting_document_removes_entries_and_staged_file() {
        let h = harness();
        let (doc, req, entry) = analyzed_upload(&h);
        assert!(Path::new(&doc.file_path).exists());

        h.state.delete_document(&doc.id, &alice()).unwrap();

        assert!(!Path::new(&doc.file_path).exists());
        let conn = h.state.open_db().unwrap();
        assert!(h.state.store.get(&conn, &entry.id).unwrap().is_none());
        assert!(h.state.entries_for_requirement(&req.id).unwrap().is_empty());
        assert!(matches!(
            h.state.document_status(&doc.id),
            Err(PipelineError::NotFound { .. })
        ));

        assert!(h.state.audit().flush(Duration::from_secs(5)));
        let events = h.sink.with_action(actions::DOCUMENT_DELETED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value.as_deref(), Some("sheet.txt"));

        assert!(matches!(
            h.state.delete_document(&doc.id, &alice()),
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn deleting_requirement_removes_its_entries() {
        let h = harness();
        let (doc, req, entry) = analyzed_upload(&h);

        h.state.delete_requirement(&req.id, &alice()).unwrap();

        let conn = h.state.open_db().unwrap();
        assert!(h.state.store.get(&conn, &entry.id).unwrap().is_none());
        assert!(h.state.matrix_for_document(&doc.id).unwrap().is_empty());
        assert!(h.state.list_requirements("proj-1").unwrap().is_empty());

        assert!(h.state.audit().flush(Duration::from_secs(5)));
        let events = h.sink.with_action(actions::REQUIREMENT_DELETED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, req.id.to_string());
        assert_eq!(events[0].old_value.as_deref(), Some("R1"));

        assert!(matches!(
            h.state.delete_requirement(&req.id, &alice()),
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn document_under_extraction_is_not_deleted() {
        let h = harness();
        let upload = h
            .state
            .import_document("proj-1", "a.txt", b"text", &alice())
            .unwrap();
        let conn = h.state.open_db().unwrap();
        db::transition_extraction_status(
            &conn,
            &upload.document.id,
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
        )
        .unwrap();

        let err = h.state.delete_document(&upload.document.id, &alice()).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        assert!(Path::new(&upload.document.file_path).exists());
    }
}
