//! One remote host and everything that runs on it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::exec::{CommandExecutor, CommandOptions, CommandResult};
use crate::limiter::{LimiterStats, SessionLimiter};
use crate::poll::{PollHandle, PollOutcome, PollRequest, PolledSessionRunner};
use crate::shell::AsyncShellRunner;
use crate::transport::Transport;

/// A remote host reached over one connection.
///
/// All methods take `&self`; share the node between tasks with an [`Arc`].
/// The connection is opened lazily by the first command, or explicitly with
/// [`connect`](Self::connect).
pub struct RemoteNode<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    limiter: Arc<SessionLimiter>,
    executor: CommandExecutor<T>,
    shell: AsyncShellRunner<T>,
    poller: PolledSessionRunner<T>,
}

impl<T: Transport> std::fmt::Debug for RemoteNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("connection", &self.connection)
            .field("sessions", &self.limiter.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "ssh")]
impl RemoteNode<crate::transport::ssh::SshTransport> {
    /// Create a node reached over SSH.
    pub fn ssh(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config, crate::transport::ssh::SshTransport::new()))
    }
}

impl<T: Transport> RemoteNode<T> {
    /// Create a node on top of `transport`.
    pub fn new(config: NodeConfig, transport: T) -> Self {
        let limiter = Arc::new(SessionLimiter::new(config.max_sessions));
        let connection = Arc::new(ConnectionManager::new(
            config,
            Arc::new(transport),
            Arc::clone(&limiter),
        ));
        Self {
            executor: CommandExecutor::new(Arc::clone(&connection), Arc::clone(&limiter)),
            shell: AsyncShellRunner::new(Arc::clone(&connection), Arc::clone(&limiter)),
            poller: PolledSessionRunner::new(Arc::clone(&connection), Arc::clone(&limiter)),
            connection,
            limiter,
        }
    }

    /// Snapshot of the node configuration.
    pub fn config(&self) -> NodeConfig {
        self.connection.config()
    }

    /// Name used in log events.
    pub fn label(&self) -> String {
        self.connection.label()
    }

    /// Connect, trying up to `retries` times with `timeout` per attempt.
    pub async fn connect(&self, retries: u32, timeout: Duration) -> Result<()> {
        self.connection.connect(retries, timeout).await
    }

    /// Whether the connection is usable right now.
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Close the standing shell, then the connection.
    pub async fn disconnect(&self) {
        self.shell.close_async().await;
        self.connection.disconnect().await;
    }

    /// Disconnect and use `port` from the next connection on.
    pub async fn change_port(&self, port: u16) {
        self.shell.close_async().await;
        self.connection.change_port(port).await;
    }

    /// Run a command to completion.
    pub async fn execute(&self, command: &str, options: CommandOptions) -> Result<CommandResult> {
        self.executor.execute(command, options).await
    }

    /// Send commands to the standing background shell.
    pub async fn execute_async<S: AsRef<str>>(&self, commands: &[S], timeout: Duration) -> Result<()> {
        self.shell.execute_async(commands, timeout).await
    }

    /// Close the standing background shell.
    pub async fn close_async(&self) {
        self.shell.close_async().await;
    }

    /// Run a polled session observed through `handle`.
    pub async fn run_polled(&self, request: PollRequest, handle: &PollHandle) -> Result<PollOutcome> {
        self.poller.run(request, handle).await
    }

    /// Run a polled session that stops when `parent` is cancelled.
    pub async fn run_polled_with_cancel(
        &self,
        request: PollRequest,
        parent: &CancellationToken,
    ) -> Result<PollOutcome> {
        self.poller.run_with_cancel(request, parent).await
    }

    /// Last command passed to [`execute`](Self::execute).
    pub fn last_command(&self) -> Option<String> {
        self.executor.diagnostics().last_command
    }

    /// Exit status of the last finished [`execute`](Self::execute) call.
    ///
    /// Concurrent callers overwrite each other; use the returned
    /// [`CommandResult`] for anything that matters.
    pub fn last_exit_status(&self) -> Option<i32> {
        self.executor.diagnostics().last_exit_status
    }

    /// Session slot usage.
    pub fn session_stats(&self) -> LimiterStats {
        self.limiter.stats()
    }

    /// Successful reconnects since the first connection.
    pub fn reconnect_count(&self) -> u32 {
        self.connection.reconnect_count()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        self.connection.transport()
    }
}
