//! Matrix entry store.
//!
//! Entries are never updated in place by analysis: regeneration soft-deletes
//! the active entry and inserts a new one. The partial unique index
//! `uq_matrix_entries_active_pair` keeps at most one active entry per
//! (requirement, document) pair; violations surface as `Conflict`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

use super::PipelineError;
use crate::db::repository::parse_uuid;
use crate::db::DatabaseError;
use crate::models::*;

/// What to do when the pair already has an active entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Fail with `Conflict`.
    InsertOnly,
    /// Soft-delete the active entry and insert the new one, atomically.
    Replace,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub entry: MatrixEntry,
    /// Id of the entry soft-deleted by a `Replace`.
    pub replaced: Option<Uuid>,
}

pub trait MatrixEntryStore: Send + Sync {
    fn upsert_active(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
        fields: &MatrixFields,
        generation: &GenerationInfo,
        mode: UpsertMode,
    ) -> Result<UpsertOutcome, PipelineError>;

    fn soft_delete(&self, conn: &Connection, entry_id: &Uuid) -> Result<MatrixEntry, PipelineError>;

    /// Apply a user edit. Returns only the fields whose value changed.
    fn edit(
        &self,
        conn: &Connection,
        entry_id: &Uuid,
        patch: &MatrixEntryPatch,
        editor: &str,
    ) -> Result<Vec<FieldChange>, PipelineError>;

    fn advance_review(
        &self,
        conn: &Connection,
        entry_id: &Uuid,
        new_status: ReviewStatus,
        reviewer: &str,
    ) -> Result<MatrixEntry, PipelineError>;

    /// Send a reviewed or approved entry back to `pending`.
    fn reopen(&self, conn: &Connection, entry_id: &Uuid, reviewer: &str) -> Result<MatrixEntry, PipelineError>;

    fn get(&self, conn: &Connection, entry_id: &Uuid) -> Result<Option<MatrixEntry>, PipelineError>;

    fn get_active(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Option<MatrixEntry>, PipelineError>;

    fn list_by_document(&self, conn: &Connection, document_id: &Uuid) -> Result<Vec<MatrixEntry>, PipelineError>;

    fn list_by_requirement(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
    ) -> Result<Vec<MatrixEntry>, PipelineError>;

    /// Every entry of the pair, soft-deleted ones included, newest first.
    fn list_history(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Vec<MatrixEntry>, PipelineError>;
}

/// SQLite-backed matrix entry store.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteMatrixStore;

impl SqliteMatrixStore {
    pub fn new() -> Self {
        Self
    }

    fn require(&self, conn: &Connection, entry_id: &Uuid) -> Result<MatrixEntry, PipelineError> {
        self.get(conn, entry_id)?
            .ok_or_else(|| PipelineError::not_found("MatrixEntry", entry_id))
    }

    fn require_active(&self, conn: &Connection, entry_id: &Uuid) -> Result<MatrixEntry, PipelineError> {
        let entry = self.require(conn, entry_id)?;
        if !entry.is_active() {
            return Err(PipelineError::Precondition(format!(
                "matrix entry {entry_id} has been deleted"
            )));
        }
        Ok(entry)
    }
}

const ENTRY_COLUMNS: &str = "id, requirement_id, document_id, spec_reference, supplier_response,
     justification, compliance_status, test_reference, risk_assessment, comments,
     confidence_score, review_status, generation_provider, generation_model, generated_at,
     created_by, last_modified_by, reviewed_by, reviewed_at, deleted_at, created_at, updated_at";

impl MatrixEntryStore for SqliteMatrixStore {
    fn upsert_active(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
        fields: &MatrixFields,
        generation: &GenerationInfo,
        mode: UpsertMode,
    ) -> Result<UpsertOutcome, PipelineError> {
        // Take the write lock up front; replacements of one pair serialize on it.
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let replaced = match mode {
            UpsertMode::InsertOnly => None,
            UpsertMode::Replace => {
                let active: Option<String> = tx
                    .query_row(
                        "SELECT id FROM matrix_entries
                         WHERE requirement_id = ?1 AND document_id = ?2 AND deleted_at IS NULL",
                        params![requirement_id.to_string(), document_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match active {
                    Some(id) => {
                        tx.execute(
                            "UPDATE matrix_entries SET deleted_at = ?2, updated_at = ?2
                             WHERE id = ?1 AND deleted_at IS NULL",
                            params![id, now],
                        )?;
                        Some(parse_uuid(&id)?)
                    }
                    None => None,
                }
            }
        };

        let entry = MatrixEntry {
            id: Uuid::new_v4(),
            requirement_id: *requirement_id,
            document_id: *document_id,
            fields: fields.clone(),
            review_status: ReviewStatus::Pending,
            generation_provider: generation.provider.clone(),
            generation_model: generation.model.clone(),
            generated_at: now,
            created_by: generation.created_by.clone(),
            last_modified_by: None,
            reviewed_by: None,
            reviewed_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        insert_entry(&tx, &entry).map_err(|e| match PipelineError::from(e) {
            PipelineError::Conflict(_) => PipelineError::Conflict(format!(
                "requirement {requirement_id} already has an active entry for document {document_id}"
            )),
            other => other,
        })?;
        tx.commit()?;

        Ok(UpsertOutcome { entry, replaced })
    }

    fn soft_delete(&self, conn: &Connection, entry_id: &Uuid) -> Result<MatrixEntry, PipelineError> {
        let rows = conn.execute(
            "UPDATE matrix_entries SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![entry_id.to_string(), Utc::now()],
        )?;
        let entry = self.require(conn, entry_id)?;
        if rows == 0 {
            return Err(PipelineError::Conflict(format!("matrix entry {entry_id} is already deleted")));
        }
        Ok(entry)
    }

    fn edit(
        &self,
        conn: &Connection,
        entry_id: &Uuid,
        patch: &MatrixEntryPatch,
        editor: &str,
    ) -> Result<Vec<FieldChange>, PipelineError> {
        let current = self.require_active(conn, entry_id)?;
        let mut updated = current.fields.clone();
        let mut changes = Vec::new();

        let text_fields: [(&str, &Option<Option<String>>, &mut Option<String>); 6] = [
            ("spec_reference", &patch.spec_reference, &mut updated.spec_reference),
            ("supplier_response", &patch.supplier_response, &mut updated.supplier_response),
            ("justification", &patch.justification, &mut updated.justification),
            ("test_reference", &patch.test_reference, &mut updated.test_reference),
            ("risk_assessment", &patch.risk_assessment, &mut updated.risk_assessment),
            ("comments", &patch.comments, &mut updated.comments),
        ];
        for (field, requested, slot) in text_fields {
            let Some(new_value) = requested else { continue };
            if *slot != *new_value {
                changes.push(FieldChange {
                    field: field.to_string(),
                    old_value: slot.clone(),
                    new_value: new_value.clone(),
                });
                *slot = new_value.clone();
            }
        }
        if let Some(status) = patch.compliance_status {
            if status != updated.compliance_status {
                changes.push(FieldChange {
                    field: "compliance_status".to_string(),
                    old_value: Some(updated.compliance_status.to_string()),
                    new_value: Some(status.to_string()),
                });
                updated.compliance_status = status;
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        // Review status and generation metadata are deliberately left alone.
        let rows = conn.execute(
            "UPDATE matrix_entries SET spec_reference = ?2, supplier_response = ?3,
             justification = ?4, compliance_status = ?5, test_reference = ?6,
             risk_assessment = ?7, comments = ?8, last_modified_by = ?9, updated_at = ?10
             WHERE id = ?1 AND deleted_at IS NULL",
            params![
                entry_id.to_string(),
                updated.spec_reference,
                updated.supplier_response,
                updated.justification,
                updated.compliance_status.as_str(),
                updated.test_reference,
                updated.risk_assessment,
                updated.comments,
                editor,
                Utc::now(),
            ],
        )?;
        if rows == 0 {
            return Err(PipelineError::Conflict(format!("matrix entry {entry_id} was deleted concurrently")));
        }

        tracing::debug!(entry_id = %entry_id, changed = changes.len(), "Matrix entry edited");
        Ok(changes)
    }

    fn advance_review(
        &self,
        conn: &Connection,
        entry_id: &Uuid,
        new_status: ReviewStatus,
        reviewer: &str,
    ) -> Result<MatrixEntry, PipelineError> {
        let current = self.require_active(conn, entry_id)?;
        if current.review_status.next() != Some(new_status) {
            return Err(PipelineError::InvalidTransition {
                from: current.review_status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        let rows = conn.execute(
            "UPDATE matrix_entries SET review_status = ?3, reviewed_by = ?4, reviewed_at = ?5,
             updated_at = ?5
             WHERE id = ?1 AND review_status = ?2 AND deleted_at IS NULL",
            params![
                entry_id.to_string(),
                current.review_status.as_str(),
                new_status.as_str(),
                reviewer,
                now,
            ],
        )?;
        if rows == 0 {
            return Err(PipelineError::Conflict(format!(
                "review status of matrix entry {entry_id} changed concurrently"
            )));
        }
        self.require(conn, entry_id)
    }

    fn reopen(&self, conn: &Connection, entry_id: &Uuid, reviewer: &str) -> Result<MatrixEntry, PipelineError> {
        let current = self.require_active(conn, entry_id)?;
        if current.review_status == ReviewStatus::Pending {
            return Err(PipelineError::InvalidTransition {
                from: current.review_status.to_string(),
                to: ReviewStatus::Pending.to_string(),
            });
        }

        let rows = conn.execute(
            "UPDATE matrix_entries SET review_status = 'pending', reviewed_by = NULL,
             reviewed_at = NULL, last_modified_by = ?3, updated_at = ?4
             WHERE id = ?1 AND review_status = ?2 AND deleted_at IS NULL",
            params![
                entry_id.to_string(),
                current.review_status.as_str(),
                reviewer,
                Utc::now(),
            ],
        )?;
        if rows == 0 {
            return Err(PipelineError::Conflict(format!(
                "review status of matrix entry {entry_id} changed concurrently"
            )));
        }
        self.require(conn, entry_id)
    }

    fn get(&self, conn: &Connection, entry_id: &Uuid) -> Result<Option<MatrixEntry>, PipelineError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM matrix_entries WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![entry_id.to_string()], read_entry_row)
            .optional()?;
        Ok(row.map(entry_from_row).transpose()?)
    }

    fn get_active(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Option<MatrixEntry>, PipelineError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM matrix_entries
             WHERE requirement_id = ?1 AND document_id = ?2 AND deleted_at IS NULL"
        );
        let row = conn
            .query_row(
                &sql,
                params![requirement_id.to_string(), document_id.to_string()],
                read_entry_row,
            )
            .optional()?;
        Ok(row.map(entry_from_row).transpose()?)
    }

    fn list_by_document(&self, conn: &Connection, document_id: &Uuid) -> Result<Vec<MatrixEntry>, PipelineError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM matrix_entries
             WHERE document_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at ASC"
        );
        query_entries(conn, &sql, params![document_id.to_string()])
    }

    fn list_by_requirement(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
    ) -> Result<Vec<MatrixEntry>, PipelineError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM matrix_entries
             WHERE requirement_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at ASC"
        );
        query_entries(conn, &sql, params![requirement_id.to_string()])
    }

    fn list_history(
        &self,
        conn: &Connection,
        requirement_id: &Uuid,
        document_id: &Uuid,
    ) -> Result<Vec<MatrixEntry>, PipelineError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM matrix_entries
             WHERE requirement_id = ?1 AND document_id = ?2
             ORDER BY created_at DESC, rowid DESC"
        );
        query_entries(
            conn,
            &sql,
            params![requirement_id.to_string(), document_id.to_string()],
        )
    }
}

fn insert_entry(conn: &Connection, entry: &MatrixEntry) -> Result<(), DatabaseError> {
    let f = &entry.fields;
    conn.execute(
        &format!(
            "INSERT INTO matrix_entries ({ENTRY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            entry.id.to_string(),
            entry.requirement_id.to_string(),
            entry.document_id.to_string(),
            f.spec_reference,
            f.supplier_response,
            f.justification,
            f.compliance_status.as_str(),
            f.test_reference,
            f.risk_assessment,
            f.comments,
            f.confidence_score,
            entry.review_status.as_str(),
            entry.generation_provider,
            entry.generation_model,
            entry.generated_at,
            entry.created_by,
            entry.last_modified_by,
            entry.reviewed_by,
            entry.reviewed_at,
            entry.deleted_at,
            entry.created_at,
            entry.updated_at,
        ],
    )?;
    Ok(())
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<MatrixEntry>, PipelineError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, read_entry_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(entry_from_row(row?)?);
    }
    Ok(entries)
}

struct EntryRow {
    id: String,
    requirement_id: String,
    document_id: String,
    spec_reference: Option<String>,
    supplier_response: Option<String>,
    justification: Option<String>,
    compliance_status: String,
    test_reference: Option<String>,
    risk_assessment: Option<String>,
    comments: Option<String>,
    confidence_score: Option<f64>,
    review_status: String,
    generation_provider: String,
    generation_model: String,
    generated_at: DateTime<Utc>,
    created_by: String,
    last_modified_by: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_entry_row(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        requirement_id: row.get(1)?,
        document_id: row.get(2)?,
        spec_reference: row.get(3)?,
        supplier_response: row.get(4)?,
        justification: row.get(5)?,
        compliance_status: row.get(6)?,
        test_reference: row.get(7)?,
        risk_assessment: row.get(8)?,
        comments: row.get(9)?,
        confidence_score: row.get(10)?,
        review_status: row.get(11)?,
        generation_provider: row.get(12)?,
        generation_model: row.get(13)?,
        generated_at: row.get(14)?,
        created_by: row.get(15)?,
        last_modified_by: row.get(16)?,
        reviewed_by: row.get(17)?,
        reviewed_at: row.get(18)?,
        deleted_at: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn entry_from_row(row: EntryRow) -> Result<MatrixEntry, DatabaseError> {
    Ok(MatrixEntry {
        id: parse_uuid(&row.id)?,
        requirement_id: parse_uuid(&row.requirement_id)?,
        document_id: parse_uuid(&row.document_id)?,
        fields: MatrixFields {
            spec_reference: row.spec_reference,
            supplier_response: row.supplier_response,
            justification: row.justification,
            compliance_status: ComplianceStatus::from_str(&row.compliance_status)?,
            test_reference: row.test_reference,
            risk_assessment: row.risk_assessment,
            comments: row.comments,
            confidence_score: row.confidence_score,
        },
        review_status: ReviewStatus::from_str(&row.review_status)?,
        generation_provider: row.generation_provider,
        generation_model: row.generation_model,
        generated_at: row.generated_at,
        created_by: row.created_by,
        last_modified_by: row.last_modified_by,
        reviewed_by: row.reviewed_by,
        reviewed_at: row.reviewed_at,
        deleted_at: row.deleted_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
