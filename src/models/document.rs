use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::ExtractionStatus;

/// An uploaded specification document and its extraction lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub project_id: String,
    pub original_filename: String,
    pub file_path: String,
    pub mime_type: String,
    pub file_size: i64,
    pub checksum: String,
    pub extraction_status: ExtractionStatus,
    /// Serialized `ExtractionResult`, present only once completed.
    pub extracted_data: Option<String>,
    pub extraction_error: Option<String>,
    pub extraction_provider: Option<String>,
    pub extraction_model: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document waiting for extraction.
    pub fn new_pending(
        project_id: impl Into<String>,
        original_filename: impl Into<String>,
        file_path: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: i64,
        checksum: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            original_filename: original_filename.into(),
            file_path: file_path.into(),
            mime_type: mime_type.into(),
            file_size,
            checksum: checksum.into(),
            extraction_status: ExtractionStatus::Pending,
            extracted_data: None,
            extraction_error: None,
            extraction_provider: None,
            extraction_model: None,
            extracted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
