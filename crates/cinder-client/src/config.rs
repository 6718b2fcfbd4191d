//! Client configuration.
//!
//! Options can be built in code, read from a TOML file, or read from
//! `CINDER_*` environment variables. Every path ends in
//! [`ClientOptions::validate`], which rejects configurations the connection
//! pool cannot serve.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cinder_client_api::TlsMaterial;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::backoff::BackoffStrategy;
use crate::backoff::ExponentialBackoff;
use crate::constants::ENV_PREFIX;
use crate::error::ClientError;

/// Default values for configuration
mod defaults {
    use crate::constants::DEFAULT_BACKOFF_INITIAL;
    use crate::constants::DEFAULT_BACKOFF_MAX;
    use crate::constants::DEFAULT_BACKOFF_RANDOM;

    pub fn retry() -> bool { true }

    pub fn backoff_initial_ms() -> u64 { DEFAULT_BACKOFF_INITIAL.as_millis() as u64 }
    pub fn backoff_max_ms() -> u64 { DEFAULT_BACKOFF_MAX.as_millis() as u64 }
    pub fn backoff_random() -> u32 { DEFAULT_BACKOFF_RANDOM }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue { key: String, value: String, reason: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Configuration(err.to_string())
    }
}

/// Username and password used to obtain an auth token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOptions {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOptions")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "defaults::backoff_initial_ms")]
    pub initial_ms: u64,
    /// Largest retry delay in milliseconds.
    #[serde(default = "defaults::backoff_max_ms")]
    pub max_ms: u64,
    /// Jitter bound, in doubling steps.
    #[serde(default = "defaults::backoff_random")]
    pub random: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: defaults::backoff_initial_ms(),
            max_ms: defaults::backoff_max_ms(),
            random: defaults::backoff_random(),
        }
    }
}

impl BackoffConfig {
    pub fn strategy(&self) -> Arc<dyn BackoffStrategy> {
        Arc::new(ExponentialBackoff::new(
            Duration::from_millis(self.initial_ms),
            Duration::from_millis(self.max_ms),
            self.random,
        ))
    }
}

/// Options for constructing a [`crate::Client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Store hosts, optionally prefixed with `http://` or `https://`.
    pub hosts: Vec<String>,
    /// Explicit TLS material. Implies TLS for every host.
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub auth: Option<AuthOptions>,
    /// Retry transport failures against another host.
    #[serde(default = "defaults::retry")]
    pub retry: bool,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl ClientOptions {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            tls: None,
            auth: None,
            retry: defaults::retry(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(AuthOptions {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the options the connection pool depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "hosts".to_string(),
                hint: "Cannot construct a client with no hosts specified".to_string(),
            });
        }
        let secure = self.hosts.iter().filter(|h| h.starts_with("https://")).count();
        if secure > 0 && secure < self.hosts.len() {
            return Err(ConfigError::InvalidValue {
                key: "hosts".to_string(),
                value: self.hosts.join(","),
                reason: "cannot be configured with a mix of secure and insecure hosts".to_string(),
            });
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ConfigError::InvalidValue {
                key: "backoff".to_string(),
                value: format!("initial={}ms max={}ms", self.backoff.initial_ms, self.backoff.max_ms),
                reason: "initial delay must be positive and no larger than the max delay".to_string(),
            });
        }
        Ok(())
    }

    /// Whether every host asks for TLS.
    pub fn has_secure_hosts(&self) -> bool {
        !self.hosts.is_empty() && self.hosts.iter().all(|h| h.starts_with("https://"))
    }

    /// Load options from `CINDER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load options from any key lookup using the environment variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let hosts: Vec<String> = var("HOSTS")
            .ok_or_else(|| ConfigError::MissingRequired {
                key: format!("{ENV_PREFIX}HOSTS"),
                hint: "Set it to a comma separated list of store addresses".to_string(),
            })?
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
            .collect();

        let retry = parse_var(&var, "RETRY", defaults::retry(), "must be true or false")?;
        let backoff = BackoffConfig {
            initial_ms: parse_var(&var, "BACKOFF_INITIAL_MS", defaults::backoff_initial_ms(), "must be milliseconds")?,
            max_ms: parse_var(&var, "BACKOFF_MAX_MS", defaults::backoff_max_ms(), "must be milliseconds")?,
            random: parse_var(&var, "BACKOFF_RANDOM", defaults::backoff_random(), "must be a small integer")?,
        };

        let auth = match (var("USERNAME"), var("PASSWORD")) {
            (Some(username), Some(password)) => Some(AuthOptions { username, password }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::MissingRequired {
                    key: format!("{ENV_PREFIX}PASSWORD"),
                    hint: "A username was given without a password".to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingRequired {
                    key: format!("{ENV_PREFIX}USERNAME"),
                    hint: "A password was given without a username".to_string(),
                });
            }
        };

        let options = Self {
            hosts,
            tls: None,
            auth,
            retry,
            backoff,
        };
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: path.as_ref().display().to_string(),
            reason: format!("Failed to read file: {}", e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(contents).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: String::new(),
            reason: format!("Failed to parse TOML: {}", e),
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file if it exists, otherwise from the environment.
    pub fn load_with_optional_file(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        if let Some(path) = path
            && path.as_ref().exists()
        {
            tracing::info!("Loading client configuration from file: {}", path.as_ref().display());
            return Self::from_toml_file(path);
        }

        tracing::info!("Loading client configuration from environment variables");
        Self::from_env()
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    reason: &str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value: raw.clone(),
            reason: format!("{reason}: {e}"),
        }),
    }
}
