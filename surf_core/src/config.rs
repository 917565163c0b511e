use crate::property::DEFAULT_AUTOCOMPLETE_PATH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the service under test lives.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides `http://{host}:{port}` for the HTTP properties.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_autocomplete_path")]
    pub autocomplete_path: String,
    /// Send the autocomplete `q` value unencoded.
    #[serde(default)]
    pub raw_query: bool,
}

pub fn default_host() -> String {
    "localhost".to_string()
}
pub fn default_port() -> u16 {
    5001
}
fn default_autocomplete_path() -> String {
    DEFAULT_AUTOCOMPLETE_PATH.to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            autocomplete_path: default_autocomplete_path(),
            raw_query: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_trials")]
    pub trials: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub findings_dir: Option<PathBuf>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

pub fn default_trials() -> u64 {
    100
}
pub fn default_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    3000
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_socket_timeout_ms() -> u64 {
    2000
}
pub fn default_workers() -> usize {
    1
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            delay_ms: default_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            deadline_secs: None,
            seed: None,
            workers: default_workers(),
            fail_fast: false,
            findings_dir: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub run: RunSettings,
}

impl RunConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks the invariants the harness relies on. Parsing alone accepts
    /// values such as zero trials or a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }

        if self.target.host.trim().is_empty() {
            return invalid("target.host must not be empty");
        }
        if self.target.port == 0 {
            return invalid("target.port must be non-zero");
        }
        if let Some(url) = &self.target.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "target.base-url must start with http:// or https://, got {url:?}"
                )));
            }
        }
        if !self.target.autocomplete_path.starts_with('/') {
            return invalid("target.autocomplete-path must start with '/'");
        }
        if self.run.trials == 0 {
            return invalid("run.trials must be at least 1");
        }
        if self.run.workers == 0 {
            return invalid("run.workers must be at least 1");
        }
        if self.run.request_timeout_ms == 0
            || self.run.connect_timeout_ms == 0
            || self.run.socket_timeout_ms == 0
        {
            return invalid("timeouts must be non-zero");
        }
        if self.run.deadline_secs == Some(0) {
            return invalid("run.deadline-secs must be non-zero when set");
        }
        if self.run.max_body_bytes == 0 {
            return invalid("run.max-body-bytes must be non-zero");
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        match &self.target.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.target.host, self.target.port),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.run.delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.run.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.run.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.run.socket_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.run.deadline_secs.map(Duration::from_secs)
    }
}
