//! Service configuration loaded from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::checkpoint::replica::pipeline_url;
use crate::checkpoint::{CheckpointerConfig, DEFAULT_DB_PATH, DEFAULT_SYNC_INTERVAL};

/// Default model identifier on OpenRouter.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
/// Default OpenRouter API base URL.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Default CORS origin (the Astro dev server).
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:4321";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 8000;
/// Default path of the streaming agent endpoint.
pub const DEFAULT_AGENT_PATH: &str = "/copilotkit";

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable holds an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Deployment environment tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    /// Local development.
    #[default]
    Dev,
    /// Production deployment.
    Prod,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dev => "dev",
            Self::Prod => "prod",
        })
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(other.to_string()),
        }
    }
}

/// Language-model settings.
#[derive(Clone)]
pub struct ModelConfig {
    /// Model identifier.
    pub model: String,
    /// API key, if any.
    pub api_key: Option<String>,
    /// API base URL.
    pub base_url: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// Top-level service configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Language-model settings.
    pub model: ModelConfig,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
    /// Checkpoint persistence settings.
    pub checkpointer: CheckpointerConfig,
    /// Deployment environment.
    pub environment: Environment,
    /// Listen port.
    pub port: u16,
    /// Path of the streaming agent endpoint.
    pub agent_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            allowed_origins: split_origins(DEFAULT_ALLOWED_ORIGINS),
            checkpointer: CheckpointerConfig::local(DEFAULT_DB_PATH),
            environment: Environment::Dev,
            port: DEFAULT_PORT,
            agent_path: DEFAULT_AGENT_PATH.to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment, reading `.env`
    /// first when present.
    ///
    /// # Errors
    /// Returns an error if a variable holds an invalid value.
    pub fn from_env() -> ConfigResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    /// Blank values count as unset.
    ///
    /// # Errors
    /// Returns an error if a variable holds an invalid value.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let model = ModelConfig {
            model: get("OPENROUTER_MODEL").unwrap_or(defaults.model.model),
            api_key: get("OPENROUTER_API_KEY"),
            base_url: get("OPENROUTER_BASE_URL").unwrap_or(defaults.model.base_url),
            temperature: parse_or("MODEL_TEMPERATURE", get("MODEL_TEMPERATURE"), DEFAULT_TEMPERATURE)?,
            timeout: Duration::from_secs(parse_or(
                "MODEL_TIMEOUT_SECS",
                get("MODEL_TIMEOUT_SECS"),
                DEFAULT_MODEL_TIMEOUT.as_secs(),
            )?),
        };

        let sync_interval = Duration::from_secs(parse_or(
            "TURSO_SYNC_INTERVAL",
            get("TURSO_SYNC_INTERVAL"),
            DEFAULT_SYNC_INTERVAL.as_secs(),
        )?);
        let mut checkpointer = CheckpointerConfig::local(
            get("KIRA_DB_PATH").map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from),
        )
        .with_remote(get("TURSO_DATABASE_URL"), get("TURSO_AUTH_TOKEN"))
        .with_sync_interval(sync_interval);
        let unusable = checkpointer
            .remote
            .as_ref()
            .and_then(|remote| pipeline_url(&remote.url).err());
        if let Some(err) = unusable {
            warn!(%err, "Ignoring unusable TURSO_DATABASE_URL; checkpoints stay local");
            checkpointer.remote = None;
        }

        let environment = match get("ENVIRONMENT") {
            Some(value) => value.parse::<Environment>().map_err(|value| ConfigError::InvalidValue {
                key: "ENVIRONMENT",
                reason: format!("expected dev or prod, got {value}"),
            })?,
            None => Environment::Dev,
        };

        let config = Self {
            model,
            allowed_origins: get("ALLOWED_ORIGINS")
                .map_or(defaults.allowed_origins, |value| split_origins(&value)),
            checkpointer,
            environment,
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
            agent_path: get("AGENT_PATH").unwrap_or(defaults.agent_path),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        Url::parse(&self.model.base_url)?;

        if !self.model.temperature.is_finite() || self.model.temperature < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "MODEL_TEMPERATURE",
                reason: "must be a non-negative number".to_string(),
            });
        }

        if self.model.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MODEL_TIMEOUT_SECS",
                reason: "must be at least one second".to_string(),
            });
        }

        if !self.agent_path.starts_with('/') || self.agent_path.len() < 2 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_PATH",
                reason: "must start with '/' and name a route".to_string(),
            });
        }

        Ok(())
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> ConfigResult<T>
where
    T::Err: fmt::Display,
{
    value.map_or(Ok(default), |raw| {
        raw.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
        })
    })
}
