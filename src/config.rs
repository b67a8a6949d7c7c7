use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the docvault server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which every session gets its own storage namespace.
    pub storage_dir: PathBuf,
    /// Embedding provider settings.
    pub embedding: EmbeddingConfig,
    /// Text splitting settings.
    pub chunking: ChunkingConfig,
    /// Retrieval defaults.
    pub retrieval: RetrievalConfig,
    /// Inactivity sweep settings.
    pub reaper: ReaperConfig,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic in-process hashing embedder.
    Local,
}

/// Embedding provider and batching settings.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Backend used to produce vectors.
    pub provider: EmbeddingProvider,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Dimensionality of the produced vectors.
    pub dimension: usize,
    /// API key for hosted providers.
    pub api_key: Option<String>,
    /// Base URL override for the provider endpoint.
    pub base_url: Option<String>,
    /// Number of chunks sent per provider call.
    pub batch_size: usize,
    /// Retries after the first failed attempt of a provider call.
    pub max_retries: usize,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// Upper bound for a single provider call.
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: "local-hash".into(),
            dimension: 256,
            api_key: None,
            base_url: None,
            batch_size: 50,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Unit used to measure chunk length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthUnit {
    /// Unicode scalar values.
    Characters,
    /// Tokens counted with a `tiktoken` encoding.
    Tokens,
}

/// Text splitter settings.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target upper bound for a chunk.
    pub chunk_size: usize,
    /// Amount of trailing context repeated at the start of the next chunk.
    pub chunk_overlap: usize,
    /// How `chunk_size` and `chunk_overlap` are measured.
    pub length_unit: LengthUnit,
    /// Encoding or model name used when `length_unit` is `Tokens`.
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1600,
            chunk_overlap: 800,
            length_unit: LengthUnit::Characters,
            tokenizer: "cl100k_base".into(),
        }
    }
}

/// Retrieval defaults applied when requests omit them.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Candidate breadth as a multiple of `k` for diversity re-ranking.
    pub fetch_multiplier: usize,
    /// MMR lambda; lower values favor diversity over relevance.
    pub diversity: f32,
    /// Primary result count below which the per-token broadening pass runs.
    pub min_useful_results: usize,
    /// Result count used when a request does not specify `k`.
    pub default_k: usize,
    /// Hard ceiling for `k`.
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fetch_multiplier: 3,
            diversity: 0.3,
            min_useful_results: 3,
            default_k: 10,
            max_k: 50,
        }
    }
}

/// Inactivity sweep settings.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// Time between scheduled sweeps.
    pub interval: Duration,
    /// Sessions idle for longer than this are deleted.
    pub inactivity_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            inactivity_threshold: Duration::from_secs(300),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("session_storage"),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            reaper: ReaperConfig::default(),
            server_port: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let embedding_defaults = EmbeddingConfig::default();
        let provider = match load_env_optional("EMBEDDING_PROVIDER") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))?,
            None => EmbeddingProvider::Local,
        };
        let api_key = load_env_optional("OPENAI_API_KEY");
        if provider == EmbeddingProvider::OpenAI && api_key.is_none() {
            return Err(ConfigError::MissingVariable("OPENAI_API_KEY".to_string()));
        }
        let base_url = match provider {
            EmbeddingProvider::OpenAI => load_env_optional("OPENAI_BASE_URL"),
            EmbeddingProvider::Ollama => load_env_optional("OLLAMA_URL"),
            EmbeddingProvider::Local => None,
        };
        let model = match provider {
            EmbeddingProvider::Local => load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| embedding_defaults.model.clone()),
            _ => load_env("EMBEDDING_MODEL")?,
        };

        let embedding = EmbeddingConfig {
            provider,
            model,
            dimension: parse_or("EMBEDDING_DIMENSION", embedding_defaults.dimension)?,
            api_key,
            base_url,
            batch_size: parse_or("EMBEDDING_BATCH_SIZE", embedding_defaults.batch_size)?.max(1),
            max_retries: parse_or("EMBEDDING_MAX_RETRIES", embedding_defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(parse_or(
                "EMBEDDING_RETRY_BASE_MS",
                embedding_defaults.retry_base_delay.as_millis() as u64,
            )?),
            request_timeout: Duration::from_secs(parse_or(
                "EMBEDDING_TIMEOUT_SECS",
                embedding_defaults.request_timeout.as_secs(),
            )?),
        };
        if embedding.dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()));
        }

        let chunking_defaults = ChunkingConfig::default();
        let length_unit = match load_env_optional("TEXT_SPLITTER_LENGTH_UNIT") {
            Some(value) => value.parse().map_err(|()| {
                ConfigError::InvalidValue("TEXT_SPLITTER_LENGTH_UNIT".to_string())
            })?,
            None => chunking_defaults.length_unit,
        };
        let chunking = ChunkingConfig {
            chunk_size: parse_or("TEXT_SPLITTER_CHUNK_SIZE", chunking_defaults.chunk_size)?,
            chunk_overlap: parse_or(
                "TEXT_SPLITTER_CHUNK_OVERLAP",
                chunking_defaults.chunk_overlap,
            )?,
            length_unit,
            tokenizer: load_env_optional("TEXT_SPLITTER_TOKENIZER")
                .unwrap_or(chunking_defaults.tokenizer),
        };
        if chunking.chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "TEXT_SPLITTER_CHUNK_SIZE".to_string(),
            ));
        }

        let retrieval_defaults = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            fetch_multiplier: parse_or(
                "RETRIEVAL_FETCH_MULTIPLIER",
                retrieval_defaults.fetch_multiplier,
            )?
            .max(1),
            diversity: parse_or("RETRIEVAL_DIVERSITY", retrieval_defaults.diversity)?
                .clamp(0.0, 1.0),
            min_useful_results: parse_or(
                "RETRIEVAL_MIN_RESULTS",
                retrieval_defaults.min_useful_results,
            )?,
            default_k: parse_or("RETRIEVAL_DEFAULT_K", retrieval_defaults.default_k)?.max(1),
            max_k: parse_or("RETRIEVAL_MAX_K", retrieval_defaults.max_k)?.max(1),
        };

        let reaper_defaults = ReaperConfig::default();
        let reaper = ReaperConfig {
            interval: Duration::from_secs(
                parse_or(
                    "SESSION_SWEEP_INTERVAL_SECS",
                    reaper_defaults.interval.as_secs(),
                )?
                .max(1),
            ),
            inactivity_threshold: Duration::from_secs(parse_or(
                "SESSION_INACTIVITY_SECS",
                reaper_defaults.inactivity_threshold.as_secs(),
            )?),
        };

        Ok(Self {
            storage_dir: load_env_optional("SESSION_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("session_storage")),
            embedding,
            chunking,
            retrieval,
            reaper,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "local" | "hash" => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for LengthUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chars" | "characters" => Ok(Self::Characters),
            "tokens" => Ok(Self::Tokens),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment, apply `overrides`, and install the result in
/// the global cache.
pub fn init_config(overrides: impl FnOnce(&mut Config)) {
    dotenvy::dotenv().ok();
    let mut config = Config::from_env().expect("Failed to load config from environment");
    overrides(&mut config);
    tracing::debug!(
        storage_dir = %config.storage_dir.display(),
        server_port = ?config.server_port,
        embedding_provider = ?config.embedding.provider,
        embedding_model = %config.embedding.model,
        chunk_size = config.chunking.chunk_size,
        chunk_overlap = config.chunking.chunk_overlap,
        inactivity_secs = config.reaper.inactivity_threshold.as_secs(),
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_known_names() {
        assert_eq!("OpenAI".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::OpenAI));
        assert_eq!("ollama".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Ollama));
        assert_eq!("hash".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Local));
        assert!("cohere".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn length_unit_parses_aliases() {
        assert_eq!("chars".parse::<LengthUnit>(), Ok(LengthUnit::Characters));
        assert_eq!("TOKENS".parse::<LengthUnit>(), Ok(LengthUnit::Tokens));
        assert!("bytes".parse::<LengthUnit>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let chunking = ChunkingConfig::default();
        assert_eq!(chunking.chunk_size, 1600);
        assert_eq!(chunking.chunk_overlap, 800);
        let embedding = EmbeddingConfig::default();
        assert_eq!(embedding.batch_size, 50);
        let retrieval = RetrievalConfig::default();
        assert_eq!(retrieval.fetch_multiplier, 3);
        assert!(retrieval.diversity < 0.5);
        let reaper = ReaperConfig::default();
        assert_eq!(reaper.inactivity_threshold, Duration::from_secs(300));
    }
}
