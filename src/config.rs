use std::{fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_CONFIG_FILENAME: &str = "harbinger.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads from an explicit path, falling back to `harbinger.toml` in the
    /// working directory, falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
        if default_path.exists() {
            return Self::from_path(default_path);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Base directory holding the metadata database and the archive blobs.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.path.join("requests.db")
    }

    pub fn blob_path(&self) -> PathBuf {
        self.path.join("blobs")
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("harbinger-data")
}

#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_primary_model")]
    pub primary_model: String,
    #[serde(default = "default_llm_fallback_model")]
    pub fallback_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_candidates")]
    pub max_candidates: usize,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_api_url(),
            api_key: String::new(),
            primary_model: default_llm_primary_model(),
            fallback_model: default_llm_fallback_model(),
            timeout_secs: default_llm_timeout_secs(),
            max_candidates: default_llm_max_candidates(),
        }
    }
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_owned()
}

fn default_llm_primary_model() -> String {
    "o3-mini".to_owned()
}

fn default_llm_fallback_model() -> String {
    "gpt-4o".to_owned()
}

fn default_llm_timeout_secs() -> u64 {
    10
}

fn default_llm_max_candidates() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Case-insensitive substrings matched against the target host.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_executor_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
            blocked_domains: Vec::new(),
        }
    }
}

fn default_executor_timeout_secs() -> u64 {
    30
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_capture_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_capture_timeout_secs(),
            blocked_domains: Vec::new(),
        }
    }
}

fn default_capture_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
