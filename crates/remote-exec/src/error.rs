//! Error types for remote-exec.
//!
//! Only connectivity and channel failures are errors. A nonzero remote exit
//! status is data and is returned to the caller inside a
//! [`CommandResult`](crate::exec::CommandResult); a poll timeout is a terminal
//! [`PollState`](crate::poll::PollState), not an error.

use std::time::Duration;

use thiserror::Error;

/// The main error type for remote-exec operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server rejected the credentials. Never retried.
    #[error("authentication failed for user '{user}' on {host}: {reason}")]
    Authentication {
        /// The user that failed to authenticate.
        user: String,
        /// The host that rejected the login.
        host: String,
        /// The reason reported by the transport.
        reason: String,
    },

    /// A network or protocol failure while establishing the connection.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connection {
        /// The host that could not be reached.
        host: String,
        /// The port that was used.
        port: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// The server presented a host key that could not be verified.
    #[error("host key verification failed for {host}: {reason}")]
    HostKey {
        /// The host whose key was rejected.
        host: String,
        /// The reason for the rejection.
        reason: String,
    },

    /// A command channel could not be opened or used.
    #[error("channel error on {host}: {reason}")]
    Channel {
        /// The host the channel belongs to.
        host: String,
        /// The reason for the channel failure.
        reason: String,
    },

    /// A synchronous command did not finish within its channel timeout.
    #[error("command on {host} timed out after {duration:?}: {command}")]
    Timeout {
        /// The host the command ran on.
        host: String,
        /// The command text as issued.
        command: String,
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// Escalating a `bash ...` wrapper through sudo is not supported.
    #[error("executing sudo commands with a nested bash invocation is not supported: {command}")]
    UnsupportedEscalation {
        /// The rejected command.
        command: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// Local I/O failure (sink files, key files, config files).
    #[error("{context}: {source}")]
    Io {
        /// What operation was being performed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for remote-exec operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

impl RemoteError {
    /// Create an authentication error.
    pub fn authentication(
        user: impl Into<String>,
        host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Authentication {
            user: user.into(),
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// Create a host key error.
    pub fn host_key(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HostKey {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a channel error.
    pub fn channel(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Channel {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether a connection attempt that failed with this error may be retried.
    ///
    /// Authentication, host key and configuration problems will not go away
    /// by trying again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Channel { .. } | Self::Timeout { .. }
        )
    }

    /// Check if this is an authentication failure.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Check if this is a synchronous command timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
