//! Mistral: OCR endpoint for extraction, chat completions for analysis.

use std::time::Duration;

use base64::Engine as _;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use super::http;
use super::parse::parse_analysis_response;
use super::prompt::{analysis_prompt, ANALYSIS_SYSTEM_PROMPT};
use super::{
    AnalysisResult, DocumentInfo, ExtractedPage, ExtractionResult, HealthStatus, MediaRef, Provider,
    ProviderError, ProviderIdentity, ProviderRole, RequirementContext,
};
use crate::config::MistralSettings;

pub const PROVIDER_NAME: &str = "mistral";

pub struct MistralProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    ocr_model: String,
    chat_model: String,
    timeout: Duration,
    role: ProviderRole,
}

impl MistralProvider {
    pub fn new(settings: &MistralSettings, role: ProviderRole) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(settings.timeout)?,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            ocr_model: settings.ocr_model.clone(),
            chat_model: settings.chat_model.clone(),
            timeout: settings.timeout,
            role,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("MISTRAL_API_KEY is not configured".into()))
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> Result<String, ProviderError> {
        let key = self.api_key()?;
        let url = format!("{}{}", self.base_url, path);
        http::send(
            self.client.post(&url).bearer_auth(key).json(body),
            PROVIDER_NAME,
            self.timeout,
        )
    }
}

/// OCR request document: images go as `image_url`, everything else as `document_url`.
fn ocr_document(bytes: &[u8], mime_type: &str) -> serde_json::Value {
    let data_url = format!(
        "data:{mime_type};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    );
    if mime_type.starts_with("image/") {
        json!({"type": "image_url", "image_url": data_url})
    } else {
        json!({"type": "document_url", "document_url": data_url})
    }
}

impl Provider for MistralProvider {
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, ProviderError> {
        let body = json!({
            "model": self.ocr_model,
            "document": ocr_document(bytes, mime_type),
            "include_image_base64": false,
        });
        let raw = self.post("/v1/ocr", &body)?;
        let response: MistralOcrResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::MalformedResponse(format!("mistral ocr: {e}")))?;

        let result = response.into_result(ProviderIdentity::new(PROVIDER_NAME, &self.ocr_model));
        tracing::debug!(pages = result.pages.len(), "Mistral OCR parsed");
        Ok(result)
    }

    fn analyze(
        &self,
        requirement: &RequirementContext,
        extracted: &ExtractionResult,
    ) -> Result<AnalysisResult, ProviderError> {
        let body = json!({
            "model": self.chat_model,
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": ANALYSIS_SYSTEM_PROMPT},
                {"role": "user", "content": analysis_prompt(requirement, extracted)},
            ],
        });
        let raw = self.post("/v1/chat/completions", &body)?;
        let response: ChatResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::MalformedResponse(format!("mistral chat: {e}")))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse("mistral returned no choices".into()))?;

        parse_analysis_response(&content, &ProviderIdentity::new(PROVIDER_NAME, &self.chat_model))
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

        let url = format!("{}/v1/models", self.base_url);
        match http::send(self.client.get(&url).bearer_auth(key), PROVIDER_NAME, self.timeout) {
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
            ProviderRole::Extraction => &self.ocr_model,
            ProviderRole::Analysis => &self.chat_model,
        };
        ProviderIdentity::new(PROVIDER_NAME, model)
    }
}

#[derive(Deserialize)]
struct MistralOcrResponse {
    #[serde(default)]
    pages: Vec<MistralOcrPage>,
}

#[derive(Deserialize)]
struct MistralOcrPage {
    /// 0-based.
    index: u32,
    #[serde(default)]
    markdown: String,
    #[serde(default)]
    images: Vec<MistralImage>,
}

#[derive(Deserialize)]
struct MistralImage {
    id: String,
    top_left_x: Option<f64>,
    top_left_y: Option<f64>,
    bottom_right_x: Option<f64>,
    bottom_right_y: Option<f64>,
}

impl MistralImage {
    fn into_media(self) -> MediaRef {
        let bbox = match (self.top_left_x, self.top_left_y, self.bottom_right_x, self.bottom_right_y) {
            (Some(x0), Some(y0), Some(x1), Some(y1)) => Some([x0, y0, x1, y1]),
            _ => None,
        };
        MediaRef { id: self.id, bbox }
    }
}

impl MistralOcrResponse {
    fn into_result(self, provider: ProviderIdentity) -> ExtractionResult {
        let mut pages: Vec<ExtractedPage> = self
            .pages
            .into_iter()
            .map(|p| ExtractedPage {
                index: p.index + 1,
                markdown: p.markdown,
                media: p.images.into_iter().map(MistralImage::into_media).collect(),
            })
            .collect();
        pages.sort_by_key(|p| p.index);

        let title = pages.iter().find_map(|p| first_heading(&p.markdown));
        let mut warnings = Vec::new();
        if pages.iter().all(|p| p.markdown.trim().is_empty()) {
            warnings.push("OCR produced no text".to_string());
        }

        ExtractionResult {
            document_info: DocumentInfo {
                title,
                ..DocumentInfo::default()
            },
            pages,
            warnings,
            provider,
        }
    }
}

fn first_heading(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MistralSettings {
        MistralSettings {
            api_key: None,
            base_url: "https://api.mistral.ai".into(),
            ocr_model: "mistral-ocr-latest".into(),
            chat_model: "mistral-large-latest".into(),
            timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn ocr_pages_are_one_based_with_media() {
        let raw = r##"{
            "model": "mistral-ocr-latest",
            "pages": [
                {"index": 1, "markdown": "Second page", "images": []},
                {"index": 0, "markdown": "# Pump Controller Spec\n\nIntro",
                 "images": [{"id": "img-0.jpeg", "top_left_x": 10, "top_left_y": 20,
                             "bottom_right_x": 110, "bottom_right_y": 220}]}
            ],
            "usage_info": {"pages_processed": 2}
        }"##;
        let response: MistralOcrResponse = serde_json::from_str(raw).unwrap();
        let result = response.into_result(ProviderIdentity::new("mistral", "mistral-ocr-latest"));

        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.pages[0].index, 1);
        assert_eq!(result.pages[0].media[0].id, "img-0.jpeg");
        assert_eq!(result.pages[0].media[0].bbox, Some([10.0, 20.0, 110.0, 220.0]));
        assert_eq!(result.document_info.title.as_deref(), Some("Pump Controller Spec"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn blank_ocr_is_flagged() {
        let response: MistralOcrResponse =
            serde_json::from_str(r#"{"pages": [{"index": 0, "markdown": "  "}]}"#).unwrap();
        let result = response.into_result(ProviderIdentity::new("mistral", "m"));
        assert_eq!(result.warnings, vec!["OCR produced no text".to_string()]);
    }

    #[test]
    fn images_use_image_url() {
        let doc = ocr_document(b"\x89PNG", "image/png");
        assert_eq!(doc["type"], "image_url");
        assert!(doc["image_url"].as_str().unwrap().starts_with("data:image/png;base64,"));
        let doc = ocr_document(b"%PDF", "application/pdf");
        assert_eq!(doc["type"], "document_url");
    }

    #[test]
    fn no_page_ceiling_but_key_required() {
        let provider = MistralProvider::new(&settings(), ProviderRole::Extraction).unwrap();
        let mut big = b"%PDF-1.7\n".to_vec();
        for _ in 0..2000 {
            big.extend_from_slice(b"<< /Type /Page >>\n");
        }
        let err = provider.extract(&big, "application/pdf").unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn chat_choice_parses() {
        let raw = r#"{"choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"spec_reference\": \"4.1\"}"}}]}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.choices[0].message.content, "{\"spec_reference\": \"4.1\"}");
    }

    #[test]
    fn identity_follows_role() {
        let analysis = MistralProvider::new(&settings(), ProviderRole::Analysis).unwrap();
        assert_eq!(analysis.identity(), ProviderIdentity::new("mistral", "mistral-large-latest"));
    }
}
