use std::path::PathBuf;

use rusqlite::Connection;
use serde::Serialize;

use super::format::{detect_format, sanitize_filename, FormatDetection};
use super::hash::content_hash;
use super::staging::{remove_staged, stage_bytes};
use super::ImportError;
use crate::audit::{actions, Actor, AuditEvent, AuditNotifier};
use crate::config::AppConfig;
use crate::db;
use crate::models::{Document, Job};
use crate::pipeline::dispatch::queue;

/// Where uploads go and how large they may be.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub upload_dir: PathBuf,
    pub max_bytes: u64,
}

impl UploadLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            max_bytes: config.max_upload_bytes,
        }
    }
}

/// Result of importing a file
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub document: Document,
    pub format: FormatDetection,
    /// The extraction job queued for the new document.
    pub job: Job,
}

/// Validate, stage and register an uploaded file, then queue its extraction.
///
/// The document row and its extraction job are written in one transaction; if
/// that fails the staged file is removed again.
pub fn import_document(
    conn: &Connection,
    limits: &UploadLimits,
    audit: &AuditNotifier,
    project_id: &str,
    filename: &str,
    bytes: &[u8],
    actor: &Actor,
) -> Result<ImportResult, ImportError> {
    if bytes.is_empty() {
        return Err(ImportError::EmptyFile);
    }
    let size = bytes.len() as u64;
    if size > limits.max_bytes {
        return Err(ImportError::FileTooLarge {
            size_mb: size as f64 / (1024.0 * 1024.0),
            max_mb: limits.max_bytes / (1024 * 1024),
        });
    }

    let format = detect_format(bytes, filename)?;
    let original_filename = sanitize_filename(filename);
    let checksum = content_hash(bytes);

    let mut document = Document::new_pending(
        project_id,
        original_filename,
        String::new(),
        format.mime_type.clone(),
        bytes.len() as i64,
        checksum,
    );
    let staged_path = stage_bytes(
        &limits.upload_dir,
        project_id,
        &document.id,
        &format.extension,
        bytes,
    )?;
    document.file_path = staged_path.to_string_lossy().into_owned();

    let job = match register(conn, &document) {
        Ok(job) => job,
        Err(e) => {
            if let Err(cleanup) = remove_staged(&staged_path) {
                tracing::warn!(error = %cleanup, document_id = %document.id, "Failed to remove staged file");
            }
            return Err(e);
        }
    };

    tracing::info!(
        document_id = %document.id,
        project_id = %project_id,
        mime_type = %format.mime_type,
        size = bytes.len(),
        "Document uploaded"
    );
    audit.notify(
        AuditEvent::new(actor.clone(), actions::DOCUMENT_UPLOADED, "document", document.id)
            .with_change("original_filename", None, Some(document.original_filename.clone())),
    );

    Ok(ImportResult {
        document,
        format,
        job,
    })
}

fn register(conn: &Connection, document: &Document) -> Result<Job, ImportError> {
    let tx = conn.unchecked_transaction().map_err(db::DatabaseError::from)?;
    db::insert_document(&tx, document)?;
    let job = queue::enqueue_extraction(&tx, &document.id)?;
    tx.commit().map_err(db::DatabaseError::from)?;
    Ok(job)
}
