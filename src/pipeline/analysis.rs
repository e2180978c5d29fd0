//! Analysis: requirements against a completed extraction, one matrix entry each.
//!
//! A request never fails as a whole because of one requirement. Unknown
//! requirements, provider failures and insert conflicts are reported per
//! requirement in [`AnalysisOutcome::failed`]; only a missing or unextracted
//! document fails the call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extraction::load_extraction;
use super::matrix::{MatrixEntryStore, UpsertMode};
use super::provider::{ExtractionResult, Provider, RequirementContext};
use super::retry::RetryPolicy;
use super::PipelineError;
use crate::audit::{actions, Actor, AuditEvent, AuditNotifier};
use crate::db::{self, Database};
use crate::models::{GenerationInfo, MatrixEntry, Requirement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub document_id: Uuid,
    pub requirement_ids: Vec<Uuid>,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedEntry {
    pub requirement_id: Uuid,
    pub entry: MatrixEntry,
    /// The entry soft-deleted by a forced regeneration.
    pub replaced: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRequirement {
    pub requirement_id: Uuid,
    /// `not_found`, `conflict`, `database`, or a provider error kind.
    pub reason: String,
    pub message: String,
}

impl FailedRequirement {
    fn new(requirement_id: Uuid, reason: &str, message: impl Into<String>) -> Self {
        Self {
            requirement_id,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub generated: Vec<GeneratedEntry>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<FailedRequirement>,
}

/// Wire form: generated entries, a skipped count and the failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub generated: Vec<MatrixEntry>,
    pub skipped: usize,
    pub failed: Vec<FailedRequirement>,
}

impl AnalysisOutcome {
    pub fn generated_count(&self) -> usize {
        self.generated.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            generated: self.generated.iter().map(|g| g.entry.clone()).collect(),
            skipped: self.skipped.len(),
            failed: self.failed.clone(),
        }
    }
}

enum ItemResult {
    Generated(GeneratedEntry),
    Failed(FailedRequirement),
}

pub struct AnalysisOrchestrator {
    db: Database,
    provider: Arc<dyn Provider>,
    store: Arc<dyn MatrixEntryStore>,
    retry: RetryPolicy,
    audit: Arc<AuditNotifier>,
    concurrency: usize,
}

impl AnalysisOrchestrator {
    pub fn new(
        db: Database,
        provider: Arc<dyn Provider>,
        store: Arc<dyn MatrixEntryStore>,
        retry: RetryPolicy,
        audit: Arc<AuditNotifier>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            provider,
            store,
            retry,
            audit,
            concurrency: concurrency.max(1),
        }
    }

    pub fn analyze(&self, request: &AnalyzeRequest, actor: &Actor) -> Result<AnalysisOutcome, PipelineError> {
        let started = Instant::now();
        let conn = self.db.connect()?;
        let doc = db::require_document(&conn, &request.document_id)?;
        let extracted = load_extraction(&doc)?;

        let mut outcome = AnalysisOutcome::default();
        let mut work: Vec<Requirement> = Vec::new();
        let mut seen = HashSet::new();

        for id in &request.requirement_ids {
            if !seen.insert(*id) {
                continue;
            }
            let requirement = match db::get_requirement(&conn, id)? {
                Some(req) if req.project_id == doc.project_id => req,
                Some(_) => {
                    outcome.failed.push(FailedRequirement::new(
                        *id,
                        "not_found",
                        format!("requirement {id} belongs to another project"),
                    ));
                    continue;
                }
                None => {
                    outcome
                        .failed
                        .push(FailedRequirement::new(*id, "not_found", format!("requirement {id} not found")));
                    continue;
                }
            };

            if !request.force_regenerate
                && self.store.get_active(&conn, id, &request.document_id)?.is_some()
            {
                outcome.skipped.push(*id);
                continue;
            }
            work.push(requirement);
        }
        drop(conn);

        let results = self.run_batch(&work, &extracted, request, actor);
        for result in results {
            match result {
                ItemResult::Generated(entry) => outcome.generated.push(entry),
                ItemResult::Failed(failure) => outcome.failed.push(failure),
            }
        }

        tracing::info!(
            document_id = %request.document_id,
            requested = request.requirement_ids.len(),
            generated = outcome.generated_count(),
            skipped = outcome.skipped_count(),
            failed = outcome.failed_count(),
            force = request.force_regenerate,
            duration_ms = started.elapsed().as_millis() as u64,
            "Analysis finished"
        );
        Ok(outcome)
    }

    /// Analyse `work` on at most `concurrency` threads, each with its own
    /// connection. Results come back in input order.
    fn run_batch(
        &self,
        work: &[Requirement],
        extracted: &ExtractionResult,
        request: &AnalyzeRequest,
        actor: &Actor,
    ) -> Vec<ItemResult> {
        if work.is_empty() {
            return Vec::new();
        }
        let threads = self.concurrency.min(work.len());
        let next = AtomicUsize::new(0);

        let mut indexed: Vec<(usize, ItemResult)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let next = &next;
                    s.spawn(move || {
                        let conn = self.db.connect();
                        let mut done = Vec::new();
                        loop {
                            let i = next.fetch_add(1, Ordering::SeqCst);
                            let Some(requirement) = work.get(i) else { break };
                            let result = match &conn {
                                Ok(conn) => self.analyze_one(conn, requirement, extracted, request, actor),
                                Err(e) => ItemResult::Failed(FailedRequirement::new(
                                    requirement.id,
                                    "database",
                                    e.to_string(),
                                )),
                            };
                            done.push((i, result));
                        }
                        done
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(done) => done,
                    Err(_) => {
                        tracing::warn!("Analysis worker thread panicked");
                        Vec::new()
                    }
                })
                .collect()
        });

        // A panicked worker loses its items; report them rather than drop them.
        let finished: HashSet<usize> = indexed.iter().map(|(i, _)| *i).collect();
        for (i, requirement) in work.iter().enumerate() {
            if !finished.contains(&i) {
                indexed.push((
                    i,
                    ItemResult::Failed(FailedRequirement::new(
                        requirement.id,
                        "internal",
                        "analysis worker panicked",
                    )),
                ));
            }
        }

        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, r)| r).collect()
    }

    fn analyze_one(
        &self,
        conn: &rusqlite::Connection,
        requirement: &Requirement,
        extracted: &ExtractionResult,
        request: &AnalyzeRequest,
        actor: &Actor,
    ) -> ItemResult {
        let context = RequirementContext::from(requirement);
        let analysed = self
            .retry
            .run("analyze", |_| self.provider.analyze(&context, extracted));

        let result = match analysed {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    requirement_id = %requirement.id,
                    document_id = %request.document_id,
                    kind = e.kind(),
                    "Requirement analysis failed"
                );
                return ItemResult::Failed(FailedRequirement::new(requirement.id, e.kind(), e.to_string()));
            }
        };

        let generation = GenerationInfo {
            provider: result.provider.provider.clone(),
            model: result.provider.model.clone(),
            created_by: actor.to_string(),
        };
        let mode = if request.force_regenerate {
            UpsertMode::Replace
        } else {
            UpsertMode::InsertOnly
        };

        let upserted = self.store.upsert_active(
            conn,
            &requirement.id,
            &request.document_id,
            &result.to_fields(),
            &generation,
            mode,
        );
        match upserted {
            Ok(outcome) => {
                if let Some(replaced) = outcome.replaced {
                    self.audit.notify(
                        AuditEvent::new(actor.clone(), actions::MATRIX_ENTRY_DELETED, "matrix_entry", replaced)
                            .with_reason("force_regenerate"),
                    );
                }
                self.audit.notify(
                    AuditEvent::new(
                        actor.clone(),
                        actions::MATRIX_ENTRY_GENERATED,
                        "matrix_entry",
                        outcome.entry.id,
                    )
                    .with_change(
                        "compliance_status",
                        None,
                        Some(outcome.entry.fields.compliance_status.to_string()),
                    ),
                );
                ItemResult::Generated(GeneratedEntry {
                    requirement_id: requirement.id,
                    entry: outcome.entry,
                    replaced: outcome.replaced,
                })
            }
            Err(PipelineError::Conflict(message)) => {
                ItemResult::Failed(FailedRequirement::new(requirement.id, "conflict", message))
            }
            Err(e) => ItemResult::Failed(FailedRequirement::new(requirement.id, "database", e.to_string())),
        }
    }
}
