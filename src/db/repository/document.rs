use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::{parse_uuid, truncate_chars};
use crate::db::DatabaseError;
use crate::models::*;

/// Stored extraction errors are cut to this many characters.
pub const MAX_EXTRACTION_ERROR_CHARS: usize = 1000;

const DOCUMENT_COLUMNS: &str = "id, project_id, original_filename, file_path, mime_type, file_size,
     checksum, extraction_status, extracted_data, extraction_error, extraction_provider,
     extraction_model, extracted_at, created_at, updated_at";

pub fn insert_document(conn: &Connection, doc: &Document) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO documents (id, project_id, original_filename, file_path, mime_type, file_size,
         checksum, extraction_status, extracted_data, extraction_error, extraction_provider,
         extraction_model, extracted_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            doc.id.to_string(),
            doc.project_id,
            doc.original_filename,
            doc.file_path,
            doc.mime_type,
            doc.file_size,
            doc.checksum,
            doc.extraction_status.as_str(),
            doc.extracted_data,
            doc.extraction_error,
            doc.extraction_provider,
            doc.extraction_model,
            doc.extracted_at,
            doc.created_at,
            doc.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
    let result = conn.query_row(&sql, params![id.to_string()], read_document_row);

    match result {
        Ok(row) => Ok(Some(document_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Like [`get_document`] but a missing row is an error.
pub fn require_document(conn: &Connection, id: &Uuid) -> Result<Document, DatabaseError> {
    get_document(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "Document".into(),
        id: id.to_string(),
    })
}

pub fn list_documents_by_project(
    conn: &Connection,
    project_id: &str,
) -> Result<Vec<Document>, DatabaseError> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE project_id = ?1 ORDER BY created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id], read_document_row)?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(document_from_row(row?)?);
    }
    Ok(docs)
}

/// Documents stuck in `processing` with no queued or running extraction job.
pub fn list_orphaned_processing_documents(conn: &Connection) -> Result<Vec<Document>, DatabaseError> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents d
         WHERE d.extraction_status = 'processing'
           AND NOT EXISTS (
               SELECT 1 FROM jobs j
               WHERE j.document_id = d.id AND j.kind = 'extraction'
                 AND j.status IN ('queued', 'running'))
         ORDER BY d.updated_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], read_document_row)?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(document_from_row(row?)?);
    }
    Ok(docs)
}

/// Conditional status change. Returns the number of rows updated: 0 means the
/// document was not in `from` (or does not exist).
pub fn transition_extraction_status(
    conn: &Connection,
    id: &Uuid,
    from: ExtractionStatus,
    to: ExtractionStatus,
) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE documents SET extraction_status = ?3, updated_at = ?4
         WHERE id = ?1 AND extraction_status = ?2",
        params![id.to_string(), from.as_str(), to.as_str(), Utc::now()],
    )?;
    Ok(rows)
}

/// Record a successful extraction. Only applies to a document in `processing`.
pub fn mark_extraction_completed(
    conn: &Connection,
    id: &Uuid,
    extracted_data: &str,
    provider: &str,
    model: &str,
    extracted_at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE documents SET extraction_status = 'completed', extracted_data = ?2,
         extraction_error = NULL, extraction_provider = ?3, extraction_model = ?4,
         extracted_at = ?5, updated_at = ?5
         WHERE id = ?1 AND extraction_status = 'processing'",
        params![id.to_string(), extracted_data, provider, model, extracted_at],
    )?;
    Ok(rows)
}

/// Record a failed extraction. Only applies to a document in `processing`.
pub fn mark_extraction_failed(
    conn: &Connection,
    id: &Uuid,
    error: &str,
    provider: Option<&str>,
    model: Option<&str>,
) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE documents SET extraction_status = 'failed', extracted_data = NULL,
         extraction_error = ?2, extraction_provider = COALESCE(?3, extraction_provider),
         extraction_model = COALESCE(?4, extraction_model), updated_at = ?5
         WHERE id = ?1 AND extraction_status = 'processing'",
        params![
            id.to_string(),
            truncate_chars(error, MAX_EXTRACTION_ERROR_CHARS),
            provider,
            model,
            Utc::now(),
        ],
    )?;
    Ok(rows)
}

/// Put a document back to `pending` and clear the previous outcome.
/// Refuses documents currently in `processing`.
pub fn reset_extraction(conn: &Connection, id: &Uuid) -> Result<usize, DatabaseError> {
    let rows = conn.execute(
        "UPDATE documents SET extraction_status = 'pending', extracted_data = NULL,
         extraction_error = NULL, extracted_at = NULL, updated_at = ?2
         WHERE id = ?1 AND extraction_status IN ('pending', 'completed', 'failed')",
        params![id.to_string(), Utc::now()],
    )?;
    Ok(rows)
}

/// Hard delete. Matrix entries and jobs go with it.
pub fn delete_document(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])?;
    if deleted == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Document".into(),
            id: id.to_string(),
        });
    }
    tracing::info!(document_id = %id, "Document deleted");
    Ok(())
}

// Internal row type for Document mapping
struct DocumentRow {
    id: String,
    project_id: String,
    original_filename: String,
    file_path: String,
    mime_type: String,
    file_size: i64,
    checksum: String,
    extraction_status: String,
    extracted_data: Option<String>,
    extraction_error: Option<String>,
    extraction_provider: Option<String>,
    extraction_model: Option<String>,
    extracted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        original_filename: row.get(2)?,
        file_path: row.get(3)?,
        mime_type: row.get(4)?,
        file_size: row.get(5)?,
        checksum: row.get(6)?,
        extraction_status: row.get(7)?,
        extracted_data: row.get(8)?,
        extraction_error: row.get(9)?,
        extraction_provider: row.get(10)?,
        extraction_model: row.get(11)?,
        extracted_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn document_from_row(row: DocumentRow) -> Result<Document, DatabaseError> {
    Ok(Document {
        id: parse_uuid(&row.id)?,
        project_id: row.project_id,
        original_filename: row.original_filename,
        file_path: row.file_path,
        mime_type: row.mime_type,
        file_size: row.file_size,
        checksum: row.checksum,
        extraction_status: ExtractionStatus::from_str(&row.extraction_status)?,
        extracted_data: row.extracted_data,
        extraction_error: row.extraction_error,
        extraction_provider: row.extraction_provider,
        extraction_model: row.extraction_model,
        extracted_at: row.extracted_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
