//! Scripted in-memory transport.
//!
//! [`MockTransport`] stands in for a real SSH server in tests. Connection
//! attempts follow a script of [`ConnectOutcome`]s, commands are matched by
//! substring against registered [`CommandBehavior`]s, and every opened
//! channel leaves a [`ChannelRecord`] behind for assertions. Time is read
//! from `tokio::time`, so tests can run with a paused clock.
//!
//! Clones share state: keep one clone in the test and hand the other to the
//! node.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{RemoteError, Result};
use crate::transport::{ChannelOutput, ConnectRequest, PtyRequest, RemoteChannel, Transport};

/// Result of one scripted connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The attempt succeeds.
    Succeed,
    /// The attempt fails with a transient network error.
    Fail,
    /// The server rejects the credentials.
    RejectAuth,
}

/// How a command behaves once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBehavior {
    /// Output available as soon as the command starts.
    pub stdout: String,
    /// Error output available as soon as the command starts.
    pub stderr: String,
    /// Exit status reported on completion.
    pub exit_status: i32,
    /// Time until the command exits; `None` means it never does.
    pub runtime: Option<Duration>,
    /// Whether bytes written to stdin come back on stdout.
    pub echo_input: bool,
}

impl Default for CommandBehavior {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_status: 0,
            runtime: Some(Duration::ZERO),
            echo_input: false,
        }
    }
}

impl CommandBehavior {
    /// A command that prints `stdout` and exits 0.
    #[must_use]
    pub fn output(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A command that prints nothing and exits with `status`.
    #[must_use]
    pub fn exit(status: i32) -> Self {
        Self {
            exit_status: status,
            ..Self::default()
        }
    }

    /// A command that never exits.
    #[must_use]
    pub fn hang() -> Self {
        Self {
            runtime: None,
            ..Self::default()
        }
    }

    /// Set error output.
    #[must_use]
    pub fn stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Set exit status.
    #[must_use]
    pub const fn exit_status(mut self, status: i32) -> Self {
        self.exit_status = status;
        self
    }

    /// Set the time until exit.
    #[must_use]
    pub const fn runtime(mut self, runtime: Duration) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Echo stdin back on stdout.
    #[must_use]
    pub const fn echo_input(mut self) -> Self {
        self.echo_input = true;
        self
    }
}

/// What happened on one opened channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Command issued with `exec`, if any.
    pub command: Option<String>,
    /// Whether a PTY was requested.
    pub pty: bool,
    /// Whether an interactive shell was requested.
    pub shell: bool,
    /// Everything written to stdin.
    pub written: Vec<u8>,
    /// Whether the channel has been closed.
    pub closed: bool,
}

impl ChannelRecord {
    /// Written bytes as text.
    #[must_use]
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

#[derive(Debug, Default)]
struct MockState {
    connect_script: VecDeque<ConnectOutcome>,
    connect_attempts: u32,
    closes: u32,
    active: bool,
    probe_fails: bool,
    channel_failures: u32,
    write_failures: u32,
    generation: u32,
    commands: Vec<(String, CommandBehavior)>,
    records: Vec<ChannelRecord>,
    open_channels: usize,
    max_open_channels: usize,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted transport.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport whose connection attempts all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next connection attempts. Attempts beyond the
    /// script succeed.
    #[must_use]
    pub fn with_connect_script(self, outcomes: impl IntoIterator<Item = ConnectOutcome>) -> Self {
        lock(&self.state).connect_script.extend(outcomes);
        self
    }

    /// Register the behaviour of commands containing `pattern`. Earlier
    /// registrations win.
    #[must_use]
    pub fn with_command(self, pattern: impl Into<String>, behavior: CommandBehavior) -> Self {
        lock(&self.state).commands.push((pattern.into(), behavior));
        self
    }

    /// Make the next `count` channel opens fail.
    pub fn fail_next_channels(&self, count: u32) {
        lock(&self.state).channel_failures = count;
    }

    /// Make the next `count` channel writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        lock(&self.state).write_failures = count;
    }

    /// Make keepalives and the probe command fail.
    pub fn set_probe_fails(&self, fails: bool) {
        lock(&self.state).probe_fails = fails;
    }

    /// Simulate the network dropping the connection.
    pub fn drop_connection(&self) {
        lock(&self.state).active = false;
    }

    /// Connection attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Times `close` was called.
    #[must_use]
    pub fn closes(&self) -> u32 {
        lock(&self.state).closes
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        lock(&self.state).open_channels
    }

    /// Highest number of channels that were open at the same time.
    #[must_use]
    pub fn max_open_channels(&self) -> usize {
        lock(&self.state).max_open_channels
    }

    /// Records of every channel opened so far, in order.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelRecord> {
        lock(&self.state).records.clone()
    }

    /// Records of channels that issued a non-empty command.
    #[must_use]
    pub fn commands(&self) -> Vec<ChannelRecord> {
        self.channels()
            .into_iter()
            .filter(|r| r.command.as_deref().is_some_and(|c| !c.is_empty()))
            .collect()
    }
}

impl Transport for MockTransport {
    type Channel = MockChannel;

    async fn connect(&self, request: ConnectRequest<'_>) -> Result<()> {
        let config = request.config;
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        match state.connect_script.pop_front().unwrap_or(ConnectOutcome::Succeed) {
            ConnectOutcome::Succeed => {
                state.active = true;
                state.generation += 1;
                Ok(())
            }
            ConnectOutcome::Fail => {
                state.active = false;
                Err(RemoteError::connection(
                    &config.host,
                    config.port,
                    "connection refused",
                ))
            }
            ConnectOutcome::RejectAuth => {
                state.active = false;
                Err(RemoteError::authentication(
                    &config.username,
                    &config.host,
                    "credentials rejected by server",
                ))
            }
        }
    }

    fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    async fn send_keepalive(&self) -> Result<()> {
        let state = lock(&self.state);
        if state.active && !state.probe_fails {
            Ok(())
        } else {
            Err(RemoteError::channel("mock", "keepalive failed"))
        }
    }

    async fn open_channel(&self) -> Result<MockChannel> {
        let mut state = lock(&self.state);
        if !state.active {
            return Err(RemoteError::channel("mock", "not connected"));
        }
        if state.channel_failures > 0 {
            state.channel_failures -= 1;
            return Err(RemoteError::channel("mock", "channel open failed"));
        }
        state.open_channels += 1;
        state.max_open_channels = state.max_open_channels.max(state.open_channels);
        state.records.push(ChannelRecord::default());
        let index = state.records.len() - 1;
        let generation = state.generation;
        drop(state);

        Ok(MockChannel {
            state: Arc::clone(&self.state),
            index,
            generation,
            behavior: None,
            started: None,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            combine_stderr: false,
            closed: false,
        })
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.active = false;
        state.closes += 1;
    }
}

/// Channel opened by [`MockTransport`].
#[derive(Debug)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
    index: usize,
    /// Connection the channel was opened on.
    generation: u32,
    behavior: Option<CommandBehavior>,
    started: Option<Instant>,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    combine_stderr: bool,
    closed: bool,
}

impl MockChannel {
    fn update(&self, f: impl FnOnce(&mut ChannelRecord)) {
        if let Some(record) = lock(&self.state).records.get_mut(self.index) {
            f(record);
        }
    }

    fn start(&mut self, behavior: CommandBehavior) {
        self.stdout.extend(behavior.stdout.as_bytes());
        if self.combine_stderr {
            self.stdout.extend(behavior.stderr.as_bytes());
        } else {
            self.stderr.extend(behavior.stderr.as_bytes());
        }
        self.started = Some(Instant::now());
        self.behavior = Some(behavior);
    }

    fn finished(&self) -> bool {
        match (&self.behavior, self.started) {
            (Some(behavior), Some(started)) => behavior
                .runtime
                .is_some_and(|runtime| started.elapsed() >= runtime),
            _ => false,
        }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = lock(&self.state);
            state.open_channels = state.open_channels.saturating_sub(1);
            if let Some(record) = state.records.get_mut(self.index) {
                record.closed = true;
            }
        }
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.release();
    }
}

impl RemoteChannel for MockChannel {
    async fn request_pty(&mut self, _pty: &PtyRequest) -> Result<()> {
        self.update(|r| r.pty = true);
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.update(|r| r.command = Some(command.to_string()));
        let behavior = {
            let state = lock(&self.state);
            if command.is_empty() && state.probe_fails {
                return Err(RemoteError::channel("mock", "probe command failed"));
            }
            state
                .commands
                .iter()
                .find(|(pattern, _)| !command.is_empty() && command.contains(pattern.as_str()))
                .map(|(_, behavior)| behavior.clone())
                .unwrap_or_default()
        };
        self.start(behavior);
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.update(|r| r.shell = true);
        self.start(CommandBehavior::hang());
        Ok(())
    }

    fn set_combine_stderr(&mut self, combine: bool) {
        self.combine_stderr = combine;
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RemoteError::channel("mock", "channel is closed"));
        }
        {
            let mut state = lock(&self.state);
            if !state.active || state.generation != self.generation {
                return Err(RemoteError::channel("mock", "connection is gone"));
            }
            if state.write_failures > 0 {
                state.write_failures -= 1;
                return Err(RemoteError::channel("mock", "write failed"));
            }
        }
        self.update(|r| r.written.extend_from_slice(data));
        if self.behavior.as_ref().is_some_and(|b| b.echo_input) {
            self.stdout.extend(data);
        }
        Ok(())
    }

    fn try_recv(&mut self, max: usize) -> Option<Vec<u8>> {
        if self.stdout.is_empty() {
            return None;
        }
        let len = max.min(self.stdout.len());
        Some(self.stdout.drain(..len).collect())
    }

    fn send_ready(&self) -> bool {
        !self.closed
    }

    fn exit_status_ready(&mut self) -> bool {
        self.closed || self.finished()
    }

    fn exit_status(&self) -> Option<i32> {
        if self.finished() {
            self.behavior.as_ref().map(|b| b.exit_status)
        } else {
            None
        }
    }

    async fn drain(&mut self) -> Result<ChannelOutput> {
        let deadline = match (&self.behavior, self.started) {
            (Some(behavior), Some(started)) => behavior.runtime.map(|runtime| started + runtime),
            _ => Some(Instant::now()),
        };
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
        Ok(ChannelOutput {
            stdout: self.stdout.drain(..).collect(),
            stderr: self.stderr.drain(..).collect(),
            exit_status: self.behavior.as_ref().map_or(0, |b| b.exit_status),
        })
    }

    async fn close(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    async fn connect(transport: &MockTransport) -> Result<()> {
        let config = NodeConfig::new("mock-host").password("pw");
        let credential = config.credential()?;
        transport
            .connect(ConnectRequest {
                config: &config,
                credential: &credential,
                timeout: Duration::from_secs(1),
            })
            .await
    }

    #[tokio::test]
    async fn connect_follows_script() {
        let transport = MockTransport::new()
            .with_connect_script([ConnectOutcome::Fail, ConnectOutcome::RejectAuth]);

        assert!(connect(&transport).await.unwrap_err().is_retryable());
        assert!(connect(&transport).await.unwrap_err().is_authentication());
        connect(&transport).await.unwrap();
        assert!(transport.is_active());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn command_output_and_runtime() {
        let transport = MockTransport::new().with_command(
            "uptime",
            CommandBehavior::output("up 3 days")
                .stderr("warn")
                .exit_status(2)
                .runtime(Duration::from_secs(1)),
        );
        connect(&transport).await.unwrap();

        let mut channel = transport.open_channel().await.unwrap();
        channel.exec("uptime").await.unwrap();
        assert!(!channel.exit_status_ready());
        assert_eq!(channel.exit_status(), None);

        let output = channel.drain().await.unwrap();
        assert_eq!(output.stdout, b"up 3 days");
        assert_eq!(output.stderr, b"warn");
        assert_eq!(output.exit_status, 2);
        assert!(channel.exit_status_ready());
    }

    #[tokio::test]
    async fn channel_count_tracks_close_and_drop() {
        let transport = MockTransport::new();
        connect(&transport).await.unwrap();

        let mut a = transport.open_channel().await.unwrap();
        let b = transport.open_channel().await.unwrap();
        assert_eq!(transport.open_channels(), 2);

        a.close().await;
        a.close().await;
        drop(b);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(transport.max_open_channels(), 2);
        assert!(transport.channels().iter().all(|r| r.closed));
    }

    #[tokio::test]
    async fn echo_and_combined_stderr() {
        let transport = MockTransport::new()
            .with_command("prompt", CommandBehavior::hang().stderr("err:").echo_input());
        connect(&transport).await.unwrap();

        let mut channel = transport.open_channel().await.unwrap();
        channel.set_combine_stderr(true);
        channel.exec("prompt").await.unwrap();
        channel.send(b"yes\n").await.unwrap();

        assert_eq!(channel.try_recv(1024).unwrap(), b"err:yes\n");
        assert!(channel.try_recv(1024).is_none());
        assert_eq!(transport.channels()[0].written_text(), "yes\n");
    }
}
