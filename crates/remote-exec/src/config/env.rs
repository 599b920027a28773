//! Environment-based configuration overrides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::NodeConfig;

/// Environment variable prefix.
pub const DEFAULT_PREFIX: &str = "REMOTE_EXEC";

/// Common variable names (without prefix).
pub mod vars {
    /// Directory searched for private keys given by bare name.
    pub const KEYS_DIR: &str = "KEYS_DIR";
    /// Maximum concurrently open channels per node.
    pub const MAX_SESSIONS: &str = "MAX_SESSIONS";
    /// Default synchronous command timeout, in seconds.
    pub const EXEC_TIMEOUT: &str = "EXEC_TIMEOUT";
    /// Log filter directive.
    pub const LOG: &str = "LOG";
}

/// Reader for prefixed environment variables.
///
/// Values are captured once at construction so that a config built from
/// them is stable even if the process environment changes later.
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    prefix: String,
    values: HashMap<String, String>,
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::from_env(DEFAULT_PREFIX)
    }
}

impl EnvOverrides {
    /// Capture all process variables carrying `prefix`.
    #[must_use]
    pub fn from_env(prefix: impl Into<String>) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Build from an explicit set of variables.
    #[must_use]
    pub fn from_vars<I, K, V>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let prefix = prefix.into();
        let head = format!("{}_", prefix.to_uppercase());
        let values = vars
            .into_iter()
            .filter_map(|(k, v)| {
                let k = k.into();
                k.strip_prefix(&head).map(|name| (name.to_string(), v.into()))
            })
            .collect();
        Self { prefix, values }
    }

    /// Full variable name for `name`.
    #[must_use]
    pub fn var_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name.to_uppercase())
    }

    /// Get a string value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_uppercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Get a parsed value.
    #[must_use]
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Get a duration in seconds.
    #[must_use]
    pub fn duration_secs(&self, name: &str) -> Option<Duration> {
        self.parse::<u64>(name).map(Duration::from_secs)
    }

    /// Apply the recognised overrides to `config`.
    ///
    /// The keys directory only fills in a missing value; session limit and
    /// timeout replace whatever the config carried.
    pub fn apply(&self, config: &mut NodeConfig) {
        if config.keys_dir.is_none() {
            config.keys_dir = self.get(vars::KEYS_DIR).map(PathBuf::from);
        }
        if let Some(max) = self.parse::<usize>(vars::MAX_SESSIONS).filter(|m| *m > 0) {
            config.max_sessions = max;
        }
        if let Some(timeout) = self.duration_secs(vars::EXEC_TIMEOUT) {
            config.exec_timeout = timeout;
        }
    }
}

/// Get the current user.
#[must_use]
pub fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
}
