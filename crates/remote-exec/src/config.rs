//! Target and credential configuration for a remote node.
//!
//! A [`NodeConfig`] describes one host: where it lives, how to log in, how
//! many channels may be open on it at once and the fixed intervals used by
//! the retry and polling loops. It can be built in code, parsed from a
//! `[user@]host[:port]` target string, or loaded from TOML.

pub mod env;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default number of concurrently open channels per connection.
pub const DEFAULT_MAX_SESSIONS: usize = 7;

/// Default timeout for a synchronous command (5 minutes).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Credential used to log in.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Private key authentication.
    PrivateKey {
        /// Resolved key file path.
        path: PathBuf,
        /// Passphrase for an encrypted key.
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Check if this is password auth.
    #[must_use]
    pub const fn is_password(&self) -> bool {
        matches!(self, Self::Password(_))
    }

    /// Check if this is private key auth.
    #[must_use]
    pub const fn is_private_key(&self) -> bool {
        matches!(self, Self::PrivateKey { .. })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Host key verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only accept keys already present in `known_hosts`.
    KnownHosts,
    /// Accept and record unknown keys, reject keys that changed.
    #[default]
    TrustOnFirstUse,
}

/// Fixed intervals and sizes used by the connection, execution and
/// polling loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Sleep between connection attempts.
    #[serde(with = "millis")]
    pub connect_retry_interval: Duration,
    /// Attempts to open and issue a command channel.
    pub channel_attempts: u32,
    /// Sleep between channel open attempts.
    #[serde(with = "millis")]
    pub channel_retry_interval: Duration,
    /// Pause after issuing a command so the remote prompt can appear.
    #[serde(with = "millis")]
    pub prompt_settle: Duration,
    /// Pause before each line of interactive input.
    #[serde(with = "millis")]
    pub input_pause: Duration,
    /// Extra pause before a raw control character.
    #[serde(with = "millis")]
    pub control_char_pause: Duration,
    /// Timeout of the zero-length liveness probe command.
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    /// Interval of the polled session loop.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Maximum bytes read per poll iteration.
    pub poll_buffer_size: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_retry_interval: Duration::from_secs(2),
            channel_attempts: 3,
            channel_retry_interval: Duration::from_millis(100),
            prompt_settle: Duration::from_millis(100),
            input_pause: Duration::from_millis(100),
            control_char_pause: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            poll_buffer_size: 65536,
        }
    }
}

impl Timings {
    /// Timings with every pause scaled down, for fast tests against local
    /// or in-memory transports.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            connect_retry_interval: Duration::from_millis(10),
            channel_retry_interval: Duration::from_millis(5),
            prompt_settle: Duration::from_millis(5),
            input_pause: Duration::from_millis(5),
            control_char_pause: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Configuration of one remote node.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// IP address or resolvable host name.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: Option<String>,
    /// Private key file. Relative names are also looked up in `keys_dir`.
    pub private_key: Option<PathBuf>,
    /// Passphrase for an encrypted private key.
    pub key_passphrase: Option<String>,
    /// Password fed to sudo. Defaults to `password`.
    pub root_password: Option<String>,
    /// Display name used in logs instead of `host`.
    pub hostname: Option<String>,
    /// Maximum concurrently open channels.
    pub max_sessions: usize,
    /// Default timeout for synchronous commands.
    #[serde(with = "secs")]
    pub exec_timeout: Duration,
    /// Directory searched for private keys given by bare name.
    pub keys_dir: Option<PathBuf>,
    /// Host key verification policy.
    pub host_key_policy: HostKeyPolicy,
    /// Loop intervals.
    pub timings: Timings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: env::current_user().unwrap_or_else(|| "root".to_string()),
            password: None,
            private_key: None,
            key_passphrase: None,
            root_password: None,
            hostname: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            keys_dir: None,
            host_key_policy: HostKeyPolicy::default(),
            timings: Timings::default(),
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("NodeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("private_key", &self.private_key)
            .field("root_password", &redact(&self.root_password))
            .field("hostname", &self.hostname)
            .field("max_sessions", &self.max_sessions)
            .field("exec_timeout", &self.exec_timeout)
            .field("keys_dir", &self.keys_dir)
            .field("host_key_policy", &self.host_key_policy)
            .finish_non_exhaustive()
    }
}

impl NodeConfig {
    /// Create new config for a host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Create a config from a `[user@]host[:port]` target string.
    #[must_use]
    pub fn parse_target(target: &str) -> Self {
        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some((_, rest)) => (None, rest),
            None => (None, target),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // [v6-address]:port
            match bracketed.split_once(']') {
                Some((addr, tail)) => (
                    addr,
                    tail.strip_prefix(':')
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(DEFAULT_PORT),
                ),
                None => (rest, DEFAULT_PORT),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => match port.parse() {
                    Ok(port) => (host, port),
                    Err(_) => (rest, DEFAULT_PORT),
                },
                _ => (rest, DEFAULT_PORT),
            }
        };

        let mut config = Self::new(host).port(port);
        if let Some(user) = user {
            config.username = user.to_string();
        }
        config
    }

    /// Load a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RemoteError::config(format!("invalid node config: {e}")))
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RemoteError::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }

    /// Set port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set username.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set login password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set private key file.
    #[must_use]
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Set the passphrase of the private key.
    #[must_use]
    pub fn key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.key_passphrase = Some(passphrase.into());
        self
    }

    /// Set the password fed to sudo.
    #[must_use]
    pub fn root_password(mut self, password: impl Into<String>) -> Self {
        self.root_password = Some(password.into());
        self
    }

    /// Set the display name used in logs.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the maximum number of concurrently open channels.
    #[must_use]
    pub const fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the default synchronous command timeout.
    #[must_use]
    pub const fn exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    /// Set the directory searched for private keys.
    #[must_use]
    pub fn keys_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keys_dir = Some(dir.into());
        self
    }

    /// Set host key verification policy.
    #[must_use]
    pub const fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Set loop timings.
    #[must_use]
    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Name used in log events: the display hostname if set, else the host.
    #[must_use]
    pub fn label(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.host)
    }

    /// `host:port`, with IPv6 hosts in brackets.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether commands already run as root and never need escalation.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.username == "root"
    }

    /// Password to feed to sudo, if any non-empty one is configured.
    #[must_use]
    pub fn privilege_password(&self) -> Option<&str> {
        self.root_password
            .as_deref()
            .or(self.password.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Resolve the login credential.
    ///
    /// A private key takes precedence over a password. A key path that does
    /// not exist as given is looked up in `keys_dir`.
    pub fn credential(&self) -> Result<Credential> {
        if let Some(key) = self.private_key.as_ref().filter(|k| !k.as_os_str().is_empty()) {
            let path = self.resolve_key(key)?;
            return Ok(Credential::PrivateKey {
                path,
                passphrase: self.key_passphrase.clone(),
            });
        }

        match self.password.as_deref() {
            Some(password) if !password.trim().is_empty() => {
                Ok(Credential::Password(password.to_string()))
            }
            _ => Err(RemoteError::config(format!(
                "{}: both password and private key are empty",
                self.label()
            ))),
        }
    }

    fn resolve_key(&self, key: &Path) -> Result<PathBuf> {
        if key.is_file() {
            return Ok(key.to_path_buf());
        }
        if let Some(candidate) = self.keys_dir.as_ref().map(|dir| dir.join(key)) {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(RemoteError::config(format!(
            "{}: private key {} not found{}",
            self.label(),
            key.display(),
            self.keys_dir
                .as_ref()
                .map(|d| format!(" (also searched {})", d.display()))
                .unwrap_or_default()
        )))
    }

    /// Check the config is usable before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RemoteError::config("host must not be empty"));
        }
        if self.max_sessions == 0 {
            return Err(RemoteError::config(format!(
                "{}: max_sessions must be at least 1",
                self.label()
            )));
        }
        self.credential().map(|_| ())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NodeConfig::new("10.0.0.5");
        assert_eq!(config.port, 22);
        assert_eq!(config.max_sessions, 7);
        assert_eq!(config.exec_timeout, Duration::from_secs(300));
        assert_eq!(config.timings.connect_retry_interval, Duration::from_secs(2));
        assert_eq!(config.timings.poll_buffer_size, 65536);
        assert_eq!(config.label(), "10.0.0.5");
    }

    #[test]
    fn parse_target_full() {
        let config = NodeConfig::parse_target("admin@server.com:2222");
        assert_eq!(config.username, "admin");
        assert_eq!(config.host, "server.com");
        assert_eq!(config.port, 2222);
        assert_eq!(config.address(), "server.com:2222");
    }

    #[test]
    fn parse_target_simple() {
        let config = NodeConfig::parse_target("server.com");
        assert_eq!(config.host, "server.com");
        assert_eq!(config.port, 22);
    }

    #[test]
    fn parse_target_ipv6() {
        let config = NodeConfig::parse_target("ops@[fe80::1]:2200");
        assert_eq!(config.username, "ops");
        assert_eq!(config.host, "fe80::1");
        assert_eq!(config.port, 2200);

        assert_eq!(config.address(), "[fe80::1]:2200");

        let bare = NodeConfig::parse_target("fe80::1");
        assert_eq!(bare.host, "fe80::1");
        assert_eq!(bare.port, 22);
    }

    #[test]
    fn credential_requires_password_or_key() {
        let err = NodeConfig::new("h").username("u").credential().unwrap_err();
        assert!(matches!(err, RemoteError::Config { .. }));

        let blank = NodeConfig::new("h").password("   ").credential();
        assert!(blank.is_err());

        let ok = NodeConfig::new("h").password("secret").credential().unwrap();
        assert!(ok.is_password());
    }

    #[test]
    fn key_resolved_from_keys_dir() {
        let dir = std::env::temp_dir().join(format!("remote-exec-keys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("lab_rsa"), "not really a key").unwrap();

        let config = NodeConfig::new("h")
            .password("pw")
            .private_key("lab_rsa")
            .keys_dir(&dir);
        match config.credential().unwrap() {
            Credential::PrivateKey { path, .. } => assert_eq!(path, dir.join("lab_rsa")),
            other => panic!("expected key credential, got {other:?}"),
        }

        let missing = NodeConfig::new("h").private_key("nope_rsa").keys_dir(&dir);
        assert!(missing.credential().is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn privilege_password_falls_back_to_login_password() {
        let config = NodeConfig::new("h").password("login");
        assert_eq!(config.privilege_password(), Some("login"));

        let config = config.root_password("rootpw");
        assert_eq!(config.privilege_password(), Some("rootpw"));

        let empty = NodeConfig::new("h").root_password("");
        assert_eq!(empty.privilege_password(), None);
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = NodeConfig::new("h").password("hunter2").root_password("toor");
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("toor"));
        assert!(shown.contains("<redacted>"));

        let cred = Credential::Password("hunter2".to_string());
        assert!(!format!("{cred:?}").contains("hunter2"));
    }

    #[test]
    fn load_from_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            host = "192.168.1.20"
            port = 2022
            username = "tester"
            password = "pw"
            hostname = "dut-1"
            max_sessions = 3
            exec_timeout = 60
            host_key_policy = "known-hosts"

            [timings]
            poll_interval = 50
            channel_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "192.168.1.20");
        assert_eq!(config.port, 2022);
        assert_eq!(config.label(), "dut-1");
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.exec_timeout, Duration::from_secs(60));
        assert_eq!(config.host_key_policy, HostKeyPolicy::KnownHosts);
        assert_eq!(config.timings.poll_interval, Duration::from_millis(50));
        assert_eq!(config.timings.channel_attempts, 5);
        // untouched fields keep their defaults
        assert_eq!(config.timings.prompt_settle, Duration::from_millis(100));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = NodeConfig::from_toml_str("port = \"twenty-two\"").unwrap_err();
        assert!(matches!(err, RemoteError::Config { .. }));
    }

    #[test]
    fn validate_rejects_zero_sessions() {
        let config = NodeConfig::new("h").password("pw").max_sessions(0);
        assert!(config.validate().is_err());
        assert!(NodeConfig::new("h").password("pw").validate().is_ok());
        assert!(NodeConfig::new("").password("pw").validate().is_err());
    }
}
