//! Prompts and output schemas sent to the AI services.

use serde_json::{json, Value};

use super::{ExtractionResult, RequirementContext};

/// Instruction for verbatim structured extraction of a supplier document.
pub const EXTRACTION_PROMPT: &str = r#"You are a technical documentation specialist performing VERBATIM extraction of a supplier specification document.

Copy every word exactly as written: spelling, punctuation, numbers, units and capitalization.
Do not summarize, interpret, correct or reorder anything. Keep headers, footers, captions,
tables and lists.

Output ONLY valid JSON in this format:
{
  "document_info": {"title": "", "version": "", "date": "", "supplier": ""},
  "sections": [
    {
      "section_number": "1.0",
      "heading": "exact heading",
      "content": "exact paragraph text",
      "page_number": "1",
      "subsections": [
        {"section_number": "1.1", "heading": "", "content": "", "page_number": "1"}
      ],
      "tables": [
        {"caption": "", "headers": ["column"], "rows": [["cell"]]}
      ],
      "lists": ["exact list item"]
    }
  ]
}"#;

/// System role for analysis calls.
pub const ANALYSIS_SYSTEM_PROMPT: &str = "You are an expert validation consultant creating a \
requirements traceability matrix entry. Respond only with a valid JSON object.";

/// Prompt asking for one matrix entry.
pub fn analysis_prompt(requirement: &RequirementContext, extracted: &ExtractionResult) -> String {
    let info = &extracted.document_info;
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());

    format!(
        "USER REQUIREMENT TO VALIDATE:
Code: {code}
Category: {category}
Requirement: {description}

SUPPLIER SPECIFICATION DOCUMENT:
Title: {title}
Version: {version}
Date: {date}
Supplier: {supplier}

{body}
INSTRUCTIONS:
1. Search ALL pages of the supplier document for content addressing this requirement.
2. Cite exact section numbers and quote the supplier text verbatim in supplier_response.
3. If the requirement is not addressed, set spec_reference to \"Not Found\" and
   compliance_status to \"Requires Clarification\".
4. Base the assessment only on explicit statements in the document.
5. compliance_status must be one of: \"Compliant\", \"Non-compliant\", \"Partial\",
   \"Requires Clarification\".
6. confidence_score must be a number between 0 and 100.

Return a JSON object with the keys: spec_reference, supplier_response, justification,
compliance_status, test_reference, risk_assessment, comments, confidence_score.",
        code = requirement.code,
        category = requirement.category,
        description = requirement.description,
        title = field(&info.title),
        version = field(&info.version),
        date = field(&info.date),
        supplier = field(&info.supplier),
        body = extracted.to_markdown(),
    )
}

/// JSON schema for structured analysis output.
pub fn matrix_entry_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "spec_reference",
            "supplier_response",
            "justification",
            "compliance_status",
            "confidence_score"
        ],
        "properties": {
            "spec_reference": {"type": "string"},
            "supplier_response": {"type": "string"},
            "justification": {"type": "string"},
            "compliance_status": {
                "type": "string",
                "enum": ["Compliant", "Non-compliant", "Partial", "Requires Clarification"]
            },
            "test_reference": {"type": "string"},
            "risk_assessment": {"type": "string"},
            "comments": {"type": "string"},
            "confidence_score": {"type": "number", "minimum": 0, "maximum": 100}
        }
    })
}
