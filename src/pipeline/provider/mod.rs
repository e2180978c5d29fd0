//! Provider abstraction over the external AI services.
//!
//! Orchestrators only ever see `dyn Provider` and the provider-agnostic
//! result types. Which service sits behind each stage is decided once, from
//! configuration, in [`ProviderSet::from_config`].

pub mod gemini;
pub mod http;
pub mod mistral;
pub mod mock;
pub mod ollama;
pub mod parse;
pub mod prompt;
pub mod types;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::AppConfig;

pub use gemini::GeminiProvider;
pub use mistral::MistralProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use types::*;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider rejected credentials: {0}")]
    Auth(String),

    #[error("Provider rate limit hit (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider call timed out: {0}")]
    Timeout(String),

    #[error("Input not supported by provider: {0}")]
    UnsupportedInput(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Stable name used in failure reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::UnsupportedInput(_) => "unsupported_input",
            Self::Unavailable(_) => "unavailable",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Whether another attempt could succeed. Timeouts are further limited
    /// to a single retry by the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// An external extraction and analysis service.
pub trait Provider: Send + Sync {
    /// Convert a raw document into provider-agnostic structured data.
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, ProviderError>;

    /// Assess one requirement against previously extracted data.
    fn analyze(
        &self,
        requirement: &RequirementContext,
        extracted: &ExtractionResult,
    ) -> Result<AnalysisResult, ProviderError>;

    fn health_check(&self) -> HealthStatus;

    fn identity(&self) -> ProviderIdentity;
}

/// Provider identity strings accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gemini,
    Mistral,
    Ollama,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Mistral => "mistral",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "mistral" => Ok(Self::Mistral),
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stage a provider instance serves. Decides which configured model
/// `identity()` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    Extraction,
    Analysis,
}

/// The configured extraction and analysis providers.
#[derive(Clone)]
pub struct ProviderSet {
    pub extraction: Arc<dyn Provider>,
    pub analysis: Arc<dyn Provider>,
}

/// Health of both configured providers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderHealth {
    pub extraction: HealthStatus,
    pub analysis: HealthStatus,
}

impl ProviderSet {
    pub fn new(extraction: Arc<dyn Provider>, analysis: Arc<dyn Provider>) -> Self {
        Self { extraction, analysis }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let extraction = build_provider(config, config.extraction_provider, ProviderRole::Extraction)?;
        let analysis = build_provider(config, config.analysis_provider, ProviderRole::Analysis)?;
        tracing::info!(
            extraction = %extraction.identity(),
            analysis = %analysis.identity(),
            "Providers configured"
        );
        Ok(Self { extraction, analysis })
    }

    pub fn health(&self) -> ProviderHealth {
        ProviderHealth {
            extraction: self.extraction.health_check(),
            analysis: self.analysis.health_check(),
        }
    }
}

fn build_provider(
    config: &AppConfig,
    kind: ProviderKind,
    role: ProviderRole,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(&config.gemini, role)?),
        ProviderKind::Mistral => Arc::new(MistralProvider::new(&config.mistral, role)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(&config.ollama)?),
        ProviderKind::Mock => Arc::new(MockProvider::new()),
    };
    Ok(provider)
}
