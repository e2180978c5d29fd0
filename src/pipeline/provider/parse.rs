//! Shared parsing of model output into analysis results.

use serde::Deserialize;
use serde_json::Value;

use super::{AnalysisResult, ProviderError, ProviderIdentity};
use crate::models::ComplianceStatus;

/// Appended to comments when the model left the core fields blank.
pub const EMPTY_FIELDS_WARNING: &str = "Warning: AI returned empty fields - requires manual completion";

/// Remove a surrounding markdown code fence (```json ... ``` or ``` ... ```).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let after_open = if let Some(idx) = trimmed.find("```json") {
        &trimmed[idx + 7..]
    } else if let Some(idx) = trimmed.find("```") {
        &trimmed[idx + 3..]
    } else {
        return trimmed;
    };
    match after_open.find("```") {
        Some(end) => after_open[..end].trim(),
        None => after_open.trim(),
    }
}

/// The outermost `{ ... }` span of `text`, after fence stripping.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let body = strip_code_fences(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

/// Parse a JSON document out of free-form model output.
pub fn parse_json_lenient<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ProviderError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ProviderError::MalformedResponse("no JSON object in response".into()))?;
    serde_json::from_str(json).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

#[derive(Deserialize)]
struct RawAnalysis {
    spec_reference: Option<Value>,
    supplier_response: Option<Value>,
    justification: Option<Value>,
    compliance_status: Option<Value>,
    test_reference: Option<Value>,
    risk_assessment: Option<Value>,
    comments: Option<Value>,
    confidence_score: Option<Value>,
}

/// Turn a model's analysis answer into an [`AnalysisResult`].
pub fn parse_analysis_response(
    text: &str,
    identity: &ProviderIdentity,
) -> Result<AnalysisResult, ProviderError> {
    let raw: RawAnalysis = parse_json_lenient(text)?;

    let spec_reference = text_of(raw.spec_reference).unwrap_or_default();
    let supplier_response = text_of(raw.supplier_response).unwrap_or_default();
    let mut comments = text_of(raw.comments);

    if spec_reference.is_empty() || supplier_response.is_empty() {
        tracing::warn!(provider = %identity, "Analysis returned empty core fields");
        comments = Some(match comments {
            Some(existing) => format!("{existing} | {EMPTY_FIELDS_WARNING}"),
            None => EMPTY_FIELDS_WARNING.to_string(),
        });
    }

    let compliance_status = text_of(raw.compliance_status)
        .map(|s| ComplianceStatus::normalize(&s))
        .unwrap_or(ComplianceStatus::RequiresClarification);

    Ok(AnalysisResult {
        spec_reference,
        supplier_response,
        justification: text_of(raw.justification).unwrap_or_default(),
        compliance_status,
        test_reference: text_of(raw.test_reference),
        risk_assessment: text_of(raw.risk_assessment),
        comments,
        confidence_score: raw.confidence_score.and_then(|v| number_of(&v)).map(clamp_confidence),
        provider: identity.clone(),
    })
}

pub fn clamp_confidence(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Non-empty trimmed text of a JSON scalar.
fn text_of(value: Option<Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s,
        Value::Null => return None,
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn number_of(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
