//! Convenient re-exports for common remote-exec usage.
//!
//! ```ignore
//! use remote_exec::prelude::*;
//! ```

pub use std::time::Duration;

// Configuration
pub use crate::config::{HostKeyPolicy, NodeConfig, Timings};
pub use crate::config::env::EnvOverrides;

// Error handling
pub use crate::error::{RemoteError, Result};

// Node and per-call types
pub use crate::exec::{CommandOptions, CommandResult};
pub use crate::node::RemoteNode;
pub use crate::poll::{PollHandle, PollOutcome, PollRequest, PollState};

// Transport seam
pub use crate::transport::{RemoteChannel, Transport};

#[cfg(feature = "ssh")]
pub use crate::transport::ssh::SshTransport;

pub use tokio_util::sync::CancellationToken;
