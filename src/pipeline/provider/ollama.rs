use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::http;
use super::parse::parse_analysis_response;
use super::prompt::{analysis_prompt, matrix_entry_schema, ANALYSIS_SYSTEM_PROMPT};
use super::{
    AnalysisResult, DocumentInfo, ExtractedPage, ExtractionResult, HealthStatus, Provider,
    ProviderError, ProviderIdentity, RequirementContext,
};
use crate::config::OllamaSettings;

pub const PROVIDER_NAME: &str = "ollama";

/// Mime types a local text model can take directly.
const TEXT_MIME_TYPES: &[&str] = &["text/plain", "text/markdown", "text/x-markdown"];

/// Ollama HTTP client for local inference.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    num_ctx: u32,
}

impl OllamaProvider {
    pub fn new(settings: &OllamaSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(settings.timeout)?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            timeout: settings.timeout,
            num_ctx: settings.num_ctx,
        })
    }

    pub fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let raw = http::send(self.client.get(&url), PROVIDER_NAME, self.timeout)?;
        let parsed: OllamaTagsResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::MalformedResponse(format!("ollama tags: {e}")))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    format: serde_json::Value,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
    num_ctx: u32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

/// Split plain text into pages on form feeds.
pub fn split_text_pages(text: &str) -> Vec<ExtractedPage> {
    text.split('\u{000C}')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| ExtractedPage {
            index: i as u32 + 1,
            markdown: page.trim().to_string(),
            media: vec![],
        })
        .collect()
}

impl Provider for OllamaProvider {
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, ProviderError> {
        if !TEXT_MIME_TYPES.contains(&mime_type) {
            return Err(ProviderError::UnsupportedInput(format!(
                "ollama extraction only handles plain text and markdown, got {mime_type}"
            )));
        }

        let mut warnings = Vec::new();
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => std::borrow::Cow::Borrowed(text),
            Err(e) => {
                warnings.push(format!(
                    "document is not valid UTF-8 from byte {}; invalid sequences were replaced",
                    e.valid_up_to()
                ));
                String::from_utf8_lossy(bytes)
            }
        };
        let pages = split_text_pages(&text);
        let title = pages
            .first()
            .and_then(|p| p.markdown.lines().next())
            .map(|line| line.trim_start_matches('#').trim().to_string())
            .filter(|t| !t.is_empty());

        if pages.is_empty() {
            warnings.push("document contains no text".to_string());
        }

        Ok(ExtractionResult {
            document_info: DocumentInfo {
                title,
                ..DocumentInfo::default()
            },
            pages,
            warnings,
            provider: self.identity(),
        })
    }

    fn analyze(
        &self,
        requirement: &RequirementContext,
        extracted: &ExtractionResult,
    ) -> Result<AnalysisResult, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);
        let prompt = analysis_prompt(requirement, extracted);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system: ANALYSIS_SYSTEM_PROMPT,
            format: matrix_entry_schema(),
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                top_p: 0.9,
                num_predict: 4096,
                num_ctx: self.num_ctx,
            },
        };

        tracing::debug!(
            requirement = %requirement.code,
            prompt_chars = prompt.len(),
            "Sending analysis to Ollama"
        );
        let raw = http::send(self.client.post(&url).json(&body), PROVIDER_NAME, self.timeout)?;
        let parsed: OllamaGenerateResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::MalformedResponse(format!("ollama generate: {e}")))?;

        parse_analysis_response(&parsed.response, &self.identity())
    }

    fn health_check(&self) -> HealthStatus {
        let identity = self.identity();
        match self.list_models() {
            Ok(models) if !models.is_empty() => HealthStatus { available: true, identity, detail: None },
            Ok(_) => HealthStatus {
                available: false,
                identity,
                detail: Some("no models installed".into()),
            },
            Err(e) => HealthStatus {
                available: false,
                identity,
                detail: Some(e.to_string()),
            },
        }
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new(PROVIDER_NAME, &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OllamaProvider {
        OllamaProvider::new(&OllamaSettings {
            base_url: "http://localhost:11434/".into(),
            model: "llama3.2".into(),
            timeout: Duration::from_secs(300),
            num_ctx: 32768,
        })
        .unwrap()
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(provider().base_url, "http://localhost:11434");
    }

    #[test]
    fn pdf_is_unsupported() {
        let err = provider().extract(b"%PDF-1.7", "application/pdf").unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedInput(_)));
    }

    #[test]
    fn text_split_on_form_feed() {
        let result = provider()
            .extract(b"# Datasheet\nIntro\x0cPage two\x0c\x0cPage four", "text/plain")
            .unwrap();
        let indices: Vec<u32> = result.pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 4]);
        assert_eq!(result.document_info.title.as_deref(), Some("Datasheet"));
        assert_eq!(result.provider, ProviderIdentity::new("ollama", "llama3.2"));
    }

    #[test]
    fn empty_text_warns() {
        let result = provider().extract(b"  \n ", "text/markdown").unwrap();
        assert!(result.pages.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn invalid_utf8_is_flagged() {
        let result = provider()
            .extract(b"Rated 85\xb0C max\nIP67", "text/plain")
            .unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("byte 8"), "{}", result.warnings[0]);
        assert!(result.pages[0].markdown.contains('\u{FFFD}'));

        let clean = provider().extract("Rated 85°C".as_bytes(), "text/plain").unwrap();
        assert!(clean.warnings.is_empty());
    }

    #[test]
    fn generate_request_shape() {
        let body = OllamaGenerateRequest {
            model: "llama3.2",
            prompt: "p",
            system: "s",
            format: matrix_entry_schema(),
            stream: false,
            options: GenerateOptions { temperature: 0.0, top_p: 0.9, num_predict: 4096, num_ctx: 32768 },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["num_ctx"], 32768);
        assert_eq!(value["format"]["type"], "object");
    }
}
