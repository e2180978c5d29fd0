use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ComplianceStatus, ReviewStatus};

/// One requirement analysed against one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub id: Uuid,
    pub requirement_id: Uuid,
    pub document_id: Uuid,
    #[serde(flatten)]
    pub fields: MatrixFields,
    pub review_status: ReviewStatus,
    pub generation_provider: String,
    pub generation_model: String,
    pub generated_at: DateTime<Utc>,
    pub created_by: String,
    pub last_modified_by: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatrixEntry {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// The analysed content of an entry, as produced by a provider or edited by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixFields {
    pub spec_reference: Option<String>,
    pub supplier_response: Option<String>,
    pub justification: Option<String>,
    pub compliance_status: ComplianceStatus,
    pub test_reference: Option<String>,
    pub risk_assessment: Option<String>,
    pub comments: Option<String>,
    pub confidence_score: Option<f64>,
}

impl Default for MatrixFields {
    fn default() -> Self {
        Self {
            spec_reference: None,
            supplier_response: None,
            justification: None,
            compliance_status: ComplianceStatus::RequiresClarification,
            test_reference: None,
            risk_assessment: None,
            comments: None,
            confidence_score: None,
        }
    }
}

/// Who and what generated an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub provider: String,
    pub model: String,
    pub created_by: String,
}

/// Partial update applied by a user. `None` leaves the field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixEntryPatch {
    pub spec_reference: Option<Option<String>>,
    pub supplier_response: Option<Option<String>>,
    pub justification: Option<Option<String>>,
    pub compliance_status: Option<ComplianceStatus>,
    pub test_reference: Option<Option<String>>,
    pub risk_assessment: Option<Option<String>>,
    pub comments: Option<Option<String>>,
}

/// Old and new value of one edited field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}
