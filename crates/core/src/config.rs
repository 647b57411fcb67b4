use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

pub const AVAILABLE_MODELS: [&str; 3] = ["gpt-3.5-turbo", "gpt-4o-mini", "gpt-4o"];
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_PERSIST_DIR: &str = "db";
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 400;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_RETRIEVAL_K: usize = 4;
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAi,
    /// Offline character n-gram hashing; no network calls.
    Local,
}

impl FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::InvalidValue {
                key: "EMBEDDING_PROVIDER".to_string(),
                details: format!("expected `openai` or `local`, got `{other}`"),
            }),
        }
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub persist_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub temperature: f32,
    pub retrieval_k: usize,
    pub available_models: Vec<String>,
    pub default_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_provider: EmbeddingProvider::OpenAi,
            persist_dir: PathBuf::from(DEFAULT_PERSIST_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            temperature: DEFAULT_TEMPERATURE,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            available_models: AVAILABLE_MODELS.iter().map(|m| m.to_string()).collect(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl Settings {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let openai_base_url = match read("OPENAI_BASE_URL") {
            Some(raw) => Url::parse(&raw)?.as_str().trim_end_matches('/').to_string(),
            None => defaults.openai_base_url,
        };

        let embedding_provider = match read("EMBEDDING_PROVIDER") {
            Some(raw) => raw.parse()?,
            None => defaults.embedding_provider,
        };

        Ok(Self {
            openai_api_key: read("OPENAI_API_KEY"),
            openai_base_url,
            embedding_model: read("OPENAI_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_provider,
            persist_dir: read("PERSIST_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.persist_dir),
            chunk_size: parse_or("CHUNK_SIZE", read("CHUNK_SIZE"), defaults.chunk_size)?,
            chunk_overlap: parse_or("CHUNK_OVERLAP", read("CHUNK_OVERLAP"), defaults.chunk_overlap)?,
            temperature: parse_or("TEMPERATURE", read("TEMPERATURE"), defaults.temperature)?,
            retrieval_k: parse_or("RETRIEVAL_K", read("RETRIEVAL_K"), defaults.retrieval_k)?,
            available_models: defaults.available_models,
            default_model: defaults.default_model,
        })
    }

    /// Fails when a required secret is missing.
    pub fn validate(&self) -> Result<&Self, ConfigError> {
        if self.openai_api_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.chunk_overlap > self.chunk_size {
            return Err(ConfigError::InvalidValue {
                key: "CHUNK_OVERLAP".to_string(),
                details: format!(
                    "overlap {} is larger than chunk size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }
        Ok(self)
    }

    pub fn api_key(&self) -> &str {
        self.openai_api_key.as_deref().unwrap_or_default()
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse().map_err(|error: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            details: format!("`{value}`: {error}"),
        }),
        None => Ok(default),
    }
}
