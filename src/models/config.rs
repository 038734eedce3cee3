//! Configuration models for stagerun.
//!
//! Every tunable of a run lives here and is resolved from a TOML file.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Top-level configuration for stagerun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model endpoint configuration
    pub client: ClientConfig,

    /// Job scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Checkpoint settings
    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    /// Usage accounting settings
    #[serde(default)]
    pub usage: UsageConfig,

    /// Per-model prices used for cost estimation
    #[serde(default)]
    pub pricing: Vec<ModelPrice>,
}

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key (can also be set via the env var named by `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Model used by the draft pipeline
    pub model: String,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

/// How job progress is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMode {
    /// Live multi-job view, one line per active job
    #[default]
    Interactive,
    /// Flat log lines
    Plain,
    /// Errors only
    Off,
}

impl std::str::FromStr for StatusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "plain" => Ok(Self::Plain),
            "off" => Ok(Self::Off),
            other => Err(format!(
                "unknown status mode '{other}' (expected interactive, plain or off)"
            )),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Progress display mode
    #[serde(default)]
    pub status: StatusMode,
}

fn default_concurrency() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            status: StatusMode::default(),
        }
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root directory; each item gets its own subdirectory
    #[serde(default = "default_checkpoint_root")]
    pub root: PathBuf,
}

fn default_checkpoint_root() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: default_checkpoint_root(),
        }
    }
}

/// Usage accounting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Where the usage summary is written after every finished call
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
}

/// Prices for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Model ID as reported by the provider (e.g. "gpt-4o-mini")
    pub id: String,

    /// Input price per 1M prompt tokens (USD)
    #[serde(default)]
    pub input_price_per_1m: f64,

    /// Price per 1M cached prompt tokens (USD); defaults to the input price
    #[serde(default)]
    pub cached_input_price_per_1m: Option<f64>,

    /// Output price per 1M response tokens (USD)
    #[serde(default)]
    pub output_price_per_1m: f64,

    /// Price per 1M thinking tokens (USD); defaults to the output price
    #[serde(default)]
    pub thinking_price_per_1m: Option<f64>,

    /// Flat price per generated image (USD)
    #[serde(default)]
    pub price_per_image: f64,

    /// Multipliers applied to `price_per_image` keyed by image size ("1K", "2K", ...)
    #[serde(default)]
    pub image_size_multipliers: HashMap<String, f64>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for price in &self.pricing {
            if !seen.insert(price.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pricing entry '{}' is declared more than once",
                    price.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.client.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.client.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.client.api_key_env.clone(),
        })
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors. All of them abort the run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or client.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Example configuration printed by `stagerun example`.
pub const EXAMPLE_CONFIG: &str = r#"# stagerun configuration file

[client]
# api_key = "sk-..."          # or set OPENAI_API_KEY
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
timeout_secs = 180
max_tokens = 2048
temperature = 0.7

[scheduler]
concurrency = 4
status = "interactive"   # interactive | plain | off

[checkpoints]
root = "checkpoints"

[usage]
summary_path = "output/usage.json"

[[pricing]]
id = "gpt-4o-mini"
input_price_per_1m = 0.15
cached_input_price_per_1m = 0.075
output_price_per_1m = 0.60

[[pricing]]
id = "gpt-image-1"
input_price_per_1m = 5.0
output_price_per_1m = 40.0
price_per_image = 0.04
image_size_multipliers = { "1K" = 1.0, "2K" = 2.0 }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.client.model, "gpt-4o-mini");
        assert_eq!(config.scheduler.concurrency, 4);
        assert_eq!(config.scheduler.status, StatusMode::Interactive);
        assert_eq!(config.pricing.len(), 2);
        assert_eq!(
            config.pricing[1].image_size_multipliers.get("2K").copied(),
            Some(2.0)
        );
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str("[client]\nmodel = \"m\"\n").unwrap();
        assert_eq!(config.scheduler.concurrency, 4);
        assert_eq!(config.checkpoints.root, PathBuf::from("checkpoints"));
        assert!(config.usage.summary_path.is_none());
        assert!(config.pricing.is_empty());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config: Config = toml::from_str("[client]\nmodel = \"m\"\n").unwrap();
        config.scheduler.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_pricing_rejected() {
        let toml_str = r#"
[client]
model = "m"

[[pricing]]
id = "m"

[[pricing]]
id = "m"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_api_key() {
        let mut config: Config = toml::from_str("[client]\nmodel = \"m\"\n").unwrap();
        config.client.api_key_env = "STAGERUN_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(
            config.resolve_api_key(),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let mut config: Config = toml::from_str("[client]\nmodel = \"m\"\n").unwrap();
        config.client.api_key = Some("sk-inline".to_string());
        assert_eq!(config.resolve_api_key().unwrap(), "sk-inline");
    }

    #[test]
    fn test_status_mode_from_str() {
        assert_eq!("Plain".parse::<StatusMode>().unwrap(), StatusMode::Plain);
        assert_eq!("off".parse::<StatusMode>().unwrap(), StatusMode::Off);
        assert!("loud".parse::<StatusMode>().is_err());
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholders() {
        assert_eq!(
            expand_env_vars("${STAGERUN_UNSET_VAR_FOR_TEST}"),
            "${STAGERUN_UNSET_VAR_FOR_TEST}"
        );
    }
}
