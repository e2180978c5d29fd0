use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::provider::ProviderKind;

/// Application-level constants
pub const APP_NAME: &str = "SpecMatrix";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default upload ceiling: 50MB.
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown provider '{0}' (expected gemini, mistral, ollama or mock)")]
    UnknownProvider(String),

    #[error("Cannot determine home directory; set SPECMATRIX_DATA_DIR")]
    NoHomeDir,
}

/// Log filter used when RUST_LOG is not set.
pub fn default_log_filter() -> &'static str {
    "info,specmatrix_lib=debug,reqwest=warn"
}

/// Get the default application data directory (~/SpecMatrix/).
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(APP_NAME))
        .ok_or(ConfigError::NoHomeDir)
}

/// Credentials and limits for the Gemini provider.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub extraction_model: String,
    pub analysis_model: String,
    pub timeout: Duration,
    /// Documents above this page count are rejected before upload.
    pub max_pages: usize,
}

/// Credentials and limits for the Mistral provider.
#[derive(Debug, Clone)]
pub struct MistralSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub ocr_model: String,
    pub chat_model: String,
    pub timeout: Duration,
}

/// Local Ollama instance.
#[derive(Debug, Clone)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub num_ctx: u32,
}

/// Worker pool, retry and recovery tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub analysis_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Longest single wait between attempts; a longer `Retry-After` gives up.
    pub retry_max_delay: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub max_job_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            analysis_concurrency: 5,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(2000),
            retry_max_delay: Duration::from_secs(60),
            stale_after: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_job_attempts: 3,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Full runtime configuration.
///
/// The extraction and analysis providers are independent choices: switching
/// either is a matter of changing one identity string.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub extraction_provider: ProviderKind,
    pub analysis_provider: ProviderKind,
    pub gemini: GeminiSettings,
    pub mistral: MistralSettings,
    pub ollama: OllamaSettings,
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("SPECMATRIX_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let database_path = lookup("SPECMATRIX_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("specmatrix.db"));
        let upload_dir = lookup("SPECMATRIX_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("uploads"));

        let extraction_provider = parse_provider(lookup("SPECMATRIX_EXTRACTION_PROVIDER"), ProviderKind::Gemini)?;
        let analysis_provider = parse_provider(lookup("SPECMATRIX_ANALYSIS_PROVIDER"), ProviderKind::Ollama)?;

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            workers: parse_or(&lookup, "SPECMATRIX_WORKERS", defaults.workers)?.max(1),
            analysis_concurrency: parse_or(&lookup, "SPECMATRIX_ANALYSIS_CONCURRENCY", defaults.analysis_concurrency)?.max(1),
            max_retries: parse_or(&lookup, "SPECMATRIX_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(parse_or(&lookup, "SPECMATRIX_RETRY_BASE_MS", 2000u64)?),
            retry_max_delay: Duration::from_secs(parse_or(&lookup, "SPECMATRIX_RETRY_MAX_DELAY_SECS", 60u64)?),
            stale_after: Duration::from_secs(parse_or(&lookup, "SPECMATRIX_STALE_AFTER_SECS", 1800u64)?),
            sweep_interval: Duration::from_secs(parse_or(&lookup, "SPECMATRIX_SWEEP_INTERVAL_SECS", 300u64)?),
            max_job_attempts: parse_or(&lookup, "SPECMATRIX_MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?.max(1),
            poll_interval: defaults.poll_interval,
        };

        Ok(Self {
            data_dir,
            database_path,
            upload_dir,
            max_upload_bytes: parse_or(&lookup, "SPECMATRIX_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            extraction_provider,
            analysis_provider,
            gemini: GeminiSettings {
                api_key: lookup("GEMINI_API_KEY").filter(|k| !k.is_empty()),
                base_url: lookup("GEMINI_BASE_URL")
                    .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
                extraction_model: lookup("GEMINI_MODEL_EXTRACTION")
                    .unwrap_or_else(|| "gemini-1.5-flash".into()),
                analysis_model: lookup("GEMINI_MODEL_MATRIX")
                    .unwrap_or_else(|| "gemini-1.5-flash".into()),
                timeout: Duration::from_secs(parse_or(&lookup, "GEMINI_EXTRACTION_TIMEOUT", 300u64)?),
                max_pages: parse_or(&lookup, "GEMINI_MAX_PAGES", 1000usize)?,
            },
            mistral: MistralSettings {
                api_key: lookup("MISTRAL_API_KEY").filter(|k| !k.is_empty()),
                base_url: lookup("MISTRAL_BASE_URL")
                    .unwrap_or_else(|| "https://api.mistral.ai".into()),
                ocr_model: lookup("MISTRAL_OCR_MODEL")
                    .unwrap_or_else(|| "mistral-ocr-latest".into()),
                chat_model: lookup("MISTRAL_CHAT_MODEL")
                    .unwrap_or_else(|| "mistral-large-latest".into()),
                timeout: Duration::from_secs(parse_or(&lookup, "MISTRAL_TIMEOUT", 600u64)?),
            },
            ollama: OllamaSettings {
                base_url: lookup("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".into()),
                model: lookup("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2".into()),
                timeout: Duration::from_secs(parse_or(&lookup, "OLLAMA_TIMEOUT", 300u64)?),
                num_ctx: parse_or(&lookup, "OLLAMA_NUM_CTX", 32768u32)?,
            },
            pipeline,
        })
    }
}

fn parse_provider(value: Option<String>, default: ProviderKind) -> Result<ProviderKind, ConfigError> {
    match value {
        Some(v) => ProviderKind::from_str(v.trim()).map_err(|_| ConfigError::UnknownProvider(v)),
        None => Ok(default),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_follow_data_dir() {
        let config = config_from(&[("SPECMATRIX_DATA_DIR", "/tmp/sm")]).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/sm/specmatrix.db"));
        assert_eq!(config.upload_dir, PathBuf::from("/tmp/sm/uploads"));
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.extraction_provider, ProviderKind::Gemini);
        assert_eq!(config.analysis_provider, ProviderKind::Ollama);
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.retry_max_delay, Duration::from_secs(60));
        assert_eq!(config.gemini.max_pages, 1000);
    }

    #[test]
    fn providers_are_independent() {
        let config = config_from(&[
            ("SPECMATRIX_DATA_DIR", "/tmp/sm"),
            ("SPECMATRIX_EXTRACTION_PROVIDER", "mistral"),
            ("SPECMATRIX_ANALYSIS_PROVIDER", "gemini"),
        ])
        .unwrap();
        assert_eq!(config.extraction_provider, ProviderKind::Mistral);
        assert_eq!(config.analysis_provider, ProviderKind::Gemini);
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = config_from(&[
            ("SPECMATRIX_DATA_DIR", "/tmp/sm"),
            ("SPECMATRIX_ANALYSIS_PROVIDER", "gpt-9"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(p) if p == "gpt-9"));
    }

    #[test]
    fn invalid_number_rejected() {
        let err = config_from(&[
            ("SPECMATRIX_DATA_DIR", "/tmp/sm"),
            ("SPECMATRIX_WORKERS", "many"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SPECMATRIX_WORKERS"));
    }

    #[test]
    fn worker_count_has_floor_of_one() {
        let config = config_from(&[
            ("SPECMATRIX_DATA_DIR", "/tmp/sm"),
            ("SPECMATRIX_WORKERS", "0"),
        ])
        .unwrap();
        assert_eq!(config.pipeline.workers, 1);
    }

    #[test]
    fn empty_api_key_treated_as_missing() {
        let config = config_from(&[
            ("SPECMATRIX_DATA_DIR", "/tmp/sm"),
            ("GEMINI_API_KEY", ""),
        ])
        .unwrap();
        assert!(config.gemini.api_key.is_none());
    }

    #[test]
    fn app_name_is_specmatrix() {
        assert_eq!(APP_NAME, "SpecMatrix");
    }
}
