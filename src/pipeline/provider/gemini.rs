//! Google Gemini over the `generateContent` REST endpoint.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine as _;
use regex::bytes::Regex;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http;
use super::parse::{parse_analysis_response, parse_json_lenient};
use super::prompt::{analysis_prompt, ANALYSIS_SYSTEM_PROMPT, EXTRACTION_PROMPT};
use super::{
    AnalysisResult, DocumentInfo, ExtractedPage, ExtractionResult, HealthStatus, Provider,
    ProviderError, ProviderIdentity, ProviderRole, RequirementContext,
};
use crate::config::GeminiSettings;

pub const PROVIDER_NAME: &str = "gemini";

/// Inline request payloads above this size are refused by the API.
pub const MAX_INLINE_BYTES: usize = 20 * 1024 * 1024;

static PDF_PAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)/Type\s*/Page\b").expect("page pattern is valid"));

/// Count page objects in a PDF without parsing it.
pub fn count_pdf_pages(bytes: &[u8]) -> usize {
    PDF_PAGE_PATTERN.find_iter(bytes).count()
}

pub struct GeminiProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    extraction_model: String,
    analysis_model: String,
    timeout: Duration,
    max_pages: usize,
    role: ProviderRole,
}

impl GeminiProvider {
    pub fn new(settings: &GeminiSettings, role: ProviderRole) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(settings.timeout)?,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            extraction_model: settings.extraction_model.clone(),
            analysis_model: settings.analysis_model.clone(),
            timeout: settings.timeout,
            max_pages: settings.max_pages,
            role,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("GEMINI_API_KEY is not configured".into()))
    }

    fn generate(&self, model: &str, parts: Vec<Value>, temperature: f32) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": temperature,
            },
        });

        let raw = http::send(
            self.client.post(&url).header("x-goog-api-key", key).json(&body),
            PROVIDER_NAME,
            self.timeout,
        )?;

        let parsed: GenerateResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::MalformedResponse(format!("gemini envelope: {e}")))?;
        parsed.into_text()
    }

    /// Refuse what the API would refuse, before anything leaves the machine.
    fn check_extraction_input(&self, bytes: &[u8], mime_type: &str) -> Result<(), ProviderError> {
        if mime_type == "application/pdf" {
            let pages = count_pdf_pages(bytes);
            if pages > self.max_pages {
                return Err(ProviderError::UnsupportedInput(format!(
                    "document has {pages} pages, gemini accepts at most {}",
                    self.max_pages
                )));
            }
        }
        if bytes.len() > MAX_INLINE_BYTES {
            return Err(ProviderError::UnsupportedInput(format!(
                "document is {} bytes, gemini inline limit is {MAX_INLINE_BYTES}",
                bytes.len()
            )));
        }
        Ok(())
    }
}

impl Provider for GeminiProvider {
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, ProviderError> {
        self.check_extraction_input(bytes, mime_type)?;

        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        let parts = vec![
            json!({"inline_data": {"mime_type": mime_type, "data": data}}),
            json!({"text": EXTRACTION_PROMPT}),
        ];
        let text = self.generate(&self.extraction_model, parts, 0.1)?;
        let raw: GeminiExtraction = parse_json_lenient(&text)?;

        let identity = ProviderIdentity::new(PROVIDER_NAME, &self.extraction_model);
        let result = raw.into_result(identity)?;
        tracing::debug!(pages = result.pages.len(), "Gemini extraction parsed");
        Ok(result)
    }

    fn analyze(
        &self,
        requirement: &RequirementContext,
        extracted: &ExtractionResult,
    ) -> Result<AnalysisResult, ProviderError> {
        let prompt = format!("{ANALYSIS_SYSTEM_PROMPT}\n\n{}", analysis_prompt(requirement, extracted));
        let text = self.generate(&self.analysis_model, vec![json!({"text": prompt})], 0.0)?;
        parse_analysis_response(&text, &ProviderIdentity::new(PROVIDER_NAME, &self.analysis_model))
    }

    fn health_check(&self) -> HealthStatus {
        let identity = self.identity();
        let Ok(key) = self.api_key() else {
            return HealthStatus {
                available: false,
                identity,
                detail: Some("API key not configured".into()),
            };
        };

        let url = format!("{}/v1beta/models", self.base_url);
        match http::send(self.client.get(&url).header("x-goog-api-key", key), PROVIDER_NAME, self.timeout) {
            Ok(_) => HealthStatus { available: true, identity, detail: None },
            Err(e) => HealthStatus {
                available: false,
                identity,
                detail: Some(e.to_string()),
            },
        }
    }

    fn identity(&self) -> ProviderIdentity {
        let model = match self.role {
            ProviderRole::Extraction => &self.extraction_model,
            ProviderRole::Analysis => &self.analysis_model,
        };
        ProviderIdentity::new(PROVIDER_NAME, model)
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String, ProviderError> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("gemini returned no candidates".into()))?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
            return Err(ProviderError::MalformedResponse(format!(
                "gemini returned empty content (finish reason {reason})"
            )));
        }
        Ok(text)
    }
}

/// The JSON shape requested by [`EXTRACTION_PROMPT`].
#[derive(Deserialize, Default)]
struct GeminiExtraction {
    #[serde(default)]
    document_info: RawDocumentInfo,
    #[serde(default)]
    sections: Vec<GeminiSection>,
}

#[derive(Deserialize, Default)]
struct RawDocumentInfo {
    title: Option<Value>,
    version: Option<Value>,
    date: Option<Value>,
    supplier: Option<Value>,
}

#[derive(Deserialize, Default)]
struct GeminiSection {
    section_number: Option<Value>,
    heading: Option<String>,
    content: Option<String>,
    page_number: Option<Value>,
    #[serde(default)]
    subsections: Vec<GeminiSection>,
    #[serde(default)]
    tables: Vec<GeminiTable>,
    #[serde(default)]
    lists: Vec<Value>,
}

#[derive(Deserialize, Default)]
struct GeminiTable {
    caption: Option<String>,
    #[serde(default)]
    headers: Vec<Value>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

impl GeminiExtraction {
    /// An answer without sections means the model ignored the output schema.
    fn into_result(self, provider: ProviderIdentity) -> Result<ExtractionResult, ProviderError> {
        if self.sections.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "extraction response contains no sections".into(),
            ));
        }
        let mut pages: BTreeMap<u32, String> = BTreeMap::new();
        let mut current_page = 1;
        for section in &self.sections {
            render_section(section, 2, &mut current_page, &mut pages);
        }

        let warnings =
            vec!["AI-based extraction is not guaranteed verbatim; verify critical specifications".to_string()];

        Ok(ExtractionResult {
            document_info: DocumentInfo {
                title: scalar(self.document_info.title),
                version: scalar(self.document_info.version),
                date: scalar(self.document_info.date),
                supplier: scalar(self.document_info.supplier),
            },
            pages: pages
                .into_iter()
                .map(|(index, markdown)| ExtractedPage { index, markdown, media: vec![] })
                .collect(),
            warnings,
            provider,
        })
    }
}

fn render_section(
    section: &GeminiSection,
    depth: usize,
    current_page: &mut u32,
    pages: &mut BTreeMap<u32, String>,
) {
    if let Some(page) = section.page_number.clone().and_then(page_of) {
        *current_page = page;
    }
    let out = pages.entry(*current_page).or_default();

    let number = scalar(section.section_number.clone()).unwrap_or_default();
    let heading = section.heading.as_deref().unwrap_or("").trim();
    if !number.is_empty() || !heading.is_empty() {
        let title = format!("{number} {heading}");
        out.push_str(&format!("{} {}\n\n", "#".repeat(depth.min(6)), title.trim()));
    }
    if let Some(content) = section.content.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str(content.trim());
        out.push_str("\n\n");
    }
    for table in &section.tables {
        out.push_str(&render_table(table));
    }
    if !section.lists.is_empty() {
        for item in &section.lists {
            out.push_str(&format!("- {}\n", scalar(Some(item.clone())).unwrap_or_default()));
        }
        out.push('\n');
    }

    for sub in &section.subsections {
        render_section(sub, depth + 1, current_page, pages);
    }
}

fn render_table(table: &GeminiTable) -> String {
    let cell = |v: &Value| scalar(Some(v.clone())).unwrap_or_default().replace('|', "\\|");
    let mut out = String::new();
    if let Some(caption) = table.caption.as_deref().filter(|c| !c.is_empty()) {
        out.push_str(&format!("*{caption}*\n\n"));
    }
    if !table.headers.is_empty() {
        let headers: Vec<String> = table.headers.iter().map(cell).collect();
        out.push_str(&format!("| {} |\n", headers.join(" | ")));
        out.push_str(&format!("|{}\n", " --- |".repeat(headers.len())));
    }
    for row in &table.rows {
        let cells: Vec<String> = row.iter().map(cell).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out.push('\n');
    out
}

fn scalar(value: Option<Value>) -> Option<String> {
    let s = match value? {
        Value::String(s) => s,
        Value::Null => return None,
        other => other.to_string(),
    };
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Leading digits of a page marker such as `"3"`, `3` or `"3-4"`.
fn page_of(value: Value) -> Option<u32> {
    let text = scalar(Some(value))?;
    let digits: String = text.chars().skip_while(|c| !c.is_ascii_digit()).take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GeminiSettings {
        GeminiSettings {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/".into(),
            extraction_model: "gemini-1.5-flash".into(),
            analysis_model: "gemini-1.5-pro".into(),
            timeout: Duration::from_secs(300),
            max_pages: 3,
        }
    }

    fn fake_pdf(pages: usize) -> Vec<u8> {
        let mut pdf = b"%PDF-1.7\n1 0 obj << /Type /Pages /Count 1 >> endobj\n".to_vec();
        for i in 0..pages {
            pdf.extend_from_slice(format!("{} 0 obj << /Type /Page /Parent 1 0 R >> endobj\n", i + 2).as_bytes());
        }
        pdf
    }

    #[test]
    fn page_counter_ignores_pages_tree() {
        assert_eq!(count_pdf_pages(&fake_pdf(0)), 0);
        assert_eq!(count_pdf_pages(&fake_pdf(5)), 5);
        assert_eq!(count_pdf_pages(b"<< /Type/Page >>"), 1);
    }

    #[test]
    fn page_ceiling_rejected_before_network() {
        // No API key configured: reaching the network would yield Auth instead.
        let provider = GeminiProvider::new(&settings(), ProviderRole::Extraction).unwrap();
        let err = provider.extract(&fake_pdf(4), "application/pdf").unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedInput(_)));
    }

    #[test]
    fn missing_key_is_auth_error() {
        let provider = GeminiProvider::new(&settings(), ProviderRole::Extraction).unwrap();
        let err = provider.extract(&fake_pdf(2), "application/pdf").unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        let health = provider.health_check();
        assert!(!health.available);
    }

    #[test]
    fn identity_follows_role() {
        let extraction = GeminiProvider::new(&settings(), ProviderRole::Extraction).unwrap();
        let analysis = GeminiProvider::new(&settings(), ProviderRole::Analysis).unwrap();
        assert_eq!(extraction.identity().model, "gemini-1.5-flash");
        assert_eq!(analysis.identity().model, "gemini-1.5-pro");
        assert_eq!(extraction.base_url, "https://generativelanguage.googleapis.com");
    }

    #[test]
    fn envelope_text_is_joined() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]},"finishReason":"STOP"}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "{\"a\":1}");

        let blocked = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(blocked).unwrap();
        assert!(matches!(parsed.into_text(), Err(ProviderError::MalformedResponse(m)) if m.contains("SAFETY")));
    }

    #[test]
    fn sections_become_pages() {
        let raw = r#"{
            "document_info": {"title": "Controller Spec", "version": 2, "supplier": "Acme"},
            "sections": [
                {"section_number": "1.0", "heading": "Scope", "content": "Applies to X.", "page_number": "1"},
                {"section_number": "2.0", "heading": "Audit", "content": "Logs all changes.", "page_number": 2,
                 "subsections": [{"section_number": "2.1", "heading": "Retention", "content": "10 years"}],
                 "tables": [{"caption": "Limits", "headers": ["Param", "Value"], "rows": [["Temp", "85"]]}],
                 "lists": ["User id", "Timestamp"]},
                {"section_number": "3.0", "heading": "Annex", "content": "See p5", "page_number": "p. 5"}
            ]
        }"#;
        let extraction: GeminiExtraction = serde_json::from_str(raw).unwrap();
        let result = extraction.into_result(ProviderIdentity::new("gemini", "m")).unwrap();

        assert_eq!(result.document_info.title.as_deref(), Some("Controller Spec"));
        assert_eq!(result.document_info.version.as_deref(), Some("2"));
        assert!(result.document_info.date.is_none());

        let indices: Vec<u32> = result.pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 5]);
        let page2 = &result.pages[1].markdown;
        assert!(page2.contains("## 2.0 Audit"));
        assert!(page2.contains("### 2.1 Retention"));
        assert!(page2.contains("| Param | Value |"));
        assert!(page2.contains("| Temp | 85 |"));
        assert!(page2.contains("- User id"));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn extraction_without_sections_is_malformed() {
        let raw = r#"{"document_info": {"title": "Controller Spec"}, "sections": []}"#;
        let extraction: GeminiExtraction = serde_json::from_str(raw).unwrap();
        let err = extraction.into_result(ProviderIdentity::new("gemini", "m")).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(ref m) if m.contains("no sections")));
        assert!(!err.is_retryable());
    }
}
