//! Fire-and-forget commands on a standing shell.
//!
//! The first [`AsyncShellRunner::execute_async`] call opens an interactive
//! PTY shell and keeps it, with its session permit, until
//! [`AsyncShellRunner::close_async`]. Commands are backgrounded with `&` and
//! their output is never read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::connection::ConnectionManager;
use crate::error::{RemoteError, Result};
use crate::limiter::{SessionLimiter, SessionPermit};
use crate::transport::{PtyRequest, RemoteChannel, Transport};

/// The standing shell channel and the permit it holds.
#[derive(Debug)]
pub struct AsyncShellHandle<C: RemoteChannel> {
    channel: C,
    /// Reconnect count of the connection the shell was opened on.
    generation: u32,
    _permit: SessionPermit,
}

impl<C: RemoteChannel> AsyncShellHandle<C> {
    /// Send one command, backgrounded.
    async fn send_command(&mut self, command: &str) -> Result<()> {
        self.channel
            .send(format!("{command}& \n").as_bytes())
            .await
    }

    /// Close the channel and release the permit.
    pub async fn close(mut self) {
        self.channel.close().await;
    }
}

type ShellSlot<C> = Option<AsyncShellHandle<C>>;

/// Runs background commands on one standing shell per connection.
pub struct AsyncShellRunner<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    limiter: Arc<SessionLimiter>,
    shell: Mutex<ShellSlot<T::Channel>>,
}

impl<T: Transport> std::fmt::Debug for AsyncShellRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncShellRunner")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> AsyncShellRunner<T> {
    /// Create a runner with no shell open.
    pub fn new(connection: Arc<ConnectionManager<T>>, limiter: Arc<SessionLimiter>) -> Self {
        Self {
            connection,
            limiter,
            shell: Mutex::new(None),
        }
    }

    /// Whether a standing shell is open.
    pub async fn is_open(&self) -> bool {
        self.shell.lock().await.is_some()
    }

    /// Send `commands` to the standing shell, opening it if needed.
    ///
    /// A shell left over from before a reconnect is replaced. A failed write
    /// closes the shell and the remaining commands go to a fresh one; a second
    /// failure is returned. Does nothing for an empty list.
    pub async fn execute_async<S: AsRef<str>>(&self, commands: &[S], timeout: Duration) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let label = self.connection.label();
        self.connection.ensure_connected(timeout).await?;

        let mut next = 0;
        let mut reopened = false;
        loop {
            let mut slot = self.standing_shell().await?;
            let failure = match slot.as_mut() {
                Some(shell) => {
                    let mut failure = None;
                    for command in &commands[next..] {
                        let command = command.as_ref();
                        tracing::info!(host = %label, command = %command, "executing in background");
                        if let Err(e) = shell.send_command(command).await {
                            failure = Some(e);
                            break;
                        }
                        next += 1;
                    }
                    failure
                }
                None => Some(RemoteError::channel(&label, "standing shell went away")),
            };
            let Some(error) = failure else {
                return Ok(());
            };

            if let Some(shell) = slot.take() {
                shell.close().await;
            }
            drop(slot);
            if reopened {
                tracing::error!(host = %label, error = %error, "standing shell write failed again");
                return Err(error);
            }
            tracing::warn!(host = %label, error = %error, "standing shell write failed, reopening it");
            reopened = true;
            self.connection.ensure_connected(timeout).await?;
        }
    }

    /// Lock the slot holding a shell on the current connection.
    ///
    /// Waiting for a permit and opening the channel happen without the slot
    /// lock, so `close_async` never queues behind a full limiter.
    async fn standing_shell(&self) -> Result<MutexGuard<'_, ShellSlot<T::Channel>>> {
        let generation = self.connection.reconnect_count();
        let stale = {
            let mut slot = self.shell.lock().await;
            match slot.as_ref().map(|shell| shell.generation == generation) {
                Some(true) => return Ok(slot),
                Some(false) => slot.take(),
                None => None,
            }
        };
        if let Some(stale) = stale {
            tracing::debug!(host = %self.connection.label(), "replacing shell from before reconnect");
            stale.close().await;
        }

        let fresh = self.open_shell(generation).await?;
        let mut slot = self.shell.lock().await;
        if slot.is_some() {
            // another caller got there first
            fresh.close().await;
        } else {
            *slot = Some(fresh);
        }
        Ok(slot)
    }

    async fn open_shell(&self, generation: u32) -> Result<AsyncShellHandle<T::Channel>> {
        let permit = self.limiter.acquire().await?;
        let mut channel = self.connection.transport().open_channel().await?;
        let started = async {
            channel.request_pty(&PtyRequest::default()).await?;
            channel.request_shell().await
        }
        .await;
        if let Err(e) = started {
            channel.close().await;
            return Err(e);
        }
        tracing::debug!(host = %self.connection.label(), "opened standing shell");
        Ok(AsyncShellHandle {
            channel,
            generation,
            _permit: permit,
        })
    }

    /// Close the standing shell if one is open.
    pub async fn close_async(&self) {
        let shell = self.shell.lock().await.take();
        if let Some(shell) = shell {
            shell.close().await;
            tracing::debug!(host = %self.connection.label(), "closed standing shell");
        }
    }
}
