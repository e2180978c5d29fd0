use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ComplianceStatus, MatrixFields, Requirement};

/// Which provider and model produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub provider: String,
    pub model: String,
}

impl ProviderIdentity {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub title: Option<String>,
    pub version: Option<String>,
    pub date: Option<String>,
    pub supplier: Option<String>,
}

/// An image or figure the provider located on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    /// 1-based page number.
    pub index: u32,
    pub markdown: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

/// Provider-agnostic extraction output, stored as the document's `extracted_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_info: DocumentInfo,
    pub pages: Vec<ExtractedPage>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub provider: ProviderIdentity,
}

impl ExtractionResult {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// All pages joined, each preceded by a page marker.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for page in &self.pages {
            out.push_str(&format!("--- Page {} ---\n", page.index));
            out.push_str(page.markdown.trim());
            out.push_str("\n\n");
        }
        out
    }
}

/// What an analysis provider is told about a requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementContext {
    pub id: Uuid,
    pub code: String,
    pub description: String,
    pub category: String,
}

impl From<&Requirement> for RequirementContext {
    fn from(req: &Requirement) -> Self {
        Self {
            id: req.id,
            code: req.code.clone(),
            description: req.description.clone(),
            category: req.category_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub spec_reference: String,
    pub supplier_response: String,
    pub justification: String,
    pub compliance_status: ComplianceStatus,
    pub test_reference: Option<String>,
    pub risk_assessment: Option<String>,
    pub comments: Option<String>,
    /// Clamped to 0..=100.
    pub confidence_score: Option<f64>,
    pub provider: ProviderIdentity,
}

impl AnalysisResult {
    pub fn to_fields(&self) -> MatrixFields {
        fn non_empty(s: &str) -> Option<String> {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        MatrixFields {
            spec_reference: non_empty(&self.spec_reference),
            supplier_response: non_empty(&self.supplier_response),
            justification: non_empty(&self.justification),
            compliance_status: self.compliance_status,
            test_reference: self.test_reference.clone(),
            risk_assessment: self.risk_assessment.clone(),
            comments: self.comments.clone(),
            confidence_score: self.confidence_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub available: bool,
    pub identity: ProviderIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
