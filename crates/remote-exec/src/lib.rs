//! remote-exec: command execution on remote hosts over SSH
//!
//! This crate drives one logical SSH connection per host and runs commands
//! on it in three ways: to completion, in the background on a standing
//! shell, or as a polled session that streams output to a file while it
//! runs.
//!
//! # Features
//!
//! - **Lazy, self-healing connections** with bounded retries and a liveness probe
//! - **Session limiting**: at most `max_sessions` channels open per host
//! - **Privilege escalation** through `sudo -S` with the password fed on stdin
//! - **Interactive input** for prompts, including raw control characters
//! - **Polled sessions** with timeout, cancellation and incremental output
//! - **SSH backend** via russh (feature: `ssh`, on by default)
//! - **Mock backend** for testing (feature: `mock`)
//!
//! # Example
//!
//! ```ignore
//! use remote_exec::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RemoteError> {
//!     remote_exec::logging::init();
//!
//!     let config = NodeConfig::parse_target("admin@10.0.0.5").password("secret");
//!     let node = RemoteNode::ssh(config)?;
//!
//!     let result = node.execute("uname -r", CommandOptions::new()).await?;
//!     println!("{} (exit {})", result.stdout, result.exit_status);
//!
//!     let result = node
//!         .execute("sudo systemctl restart sshd", CommandOptions::new().timeout(Duration::from_secs(30)))
//!         .await?;
//!     assert!(result.success());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod exec;
pub mod limiter;
pub mod logging;
pub mod node;
pub mod poll;
pub mod prelude;
pub mod retry;
pub mod shell;
pub mod transport;

/// Scripted in-memory transport for tests.
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{Credential, HostKeyPolicy, NodeConfig, Timings};
pub use connection::ConnectionManager;
pub use error::{RemoteError, Result};
pub use exec::{CommandExecutor, CommandOptions, CommandResult};
pub use limiter::{LimiterStats, SessionLimiter, SessionPermit};
pub use node::RemoteNode;
pub use poll::{PollHandle, PollOutcome, PollRequest, PollState, PolledSessionRunner};
pub use shell::{AsyncShellHandle, AsyncShellRunner};
pub use transport::{RemoteChannel, Transport};

#[cfg(feature = "ssh")]
pub use transport::ssh::SshTransport;

/// Re-export of the cancellation token accepted by polled sessions.
pub use tokio_util::sync::CancellationToken;
