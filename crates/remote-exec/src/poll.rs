//! Polled sessions for long-running or interactive commands.
//!
//! A polled run opens a PTY session with stderr merged into stdout, issues
//! one command, and then wakes every `poll_interval` to pick up whatever
//! output has arrived without ever waiting on the network. Output goes to
//! three places: the full buffer, the incremental buffer (cleared by
//! [`PollHandle::prune`]) and an append-mode sink file.
//!
//! ```text
//! Starting -> Polling -> Completed | TimedOut | Stopped
//! ```
//!
//! Queued input lines are sent one at a time, right after a read, when the
//! channel accepts writes. This is a heuristic: output arriving usually
//! means the remote side is waiting at a prompt, but nothing guarantees it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::error::{RemoteError, Result};
use crate::limiter::SessionLimiter;
use crate::transport::{PtyRequest, RemoteChannel, Transport, UNKNOWN_EXIT_STATUS};

/// What to run and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Command to issue.
    pub command: String,
    /// Give up after this long; zero means never.
    pub timeout: Duration,
    /// File the output is appended to.
    pub sink: PathBuf,
    /// Lines sent to the command as it prompts.
    pub inputs: Vec<String>,
}

impl PollRequest {
    /// Create a request with no timeout and no input.
    #[must_use]
    pub fn new(command: impl Into<String>, sink: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::ZERO,
            sink: sink.into(),
            inputs: Vec::new(),
        }
    }

    /// Set the timeout. Zero disables it.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Queue one input line.
    #[must_use]
    pub fn input(mut self, line: impl Into<String>) -> Self {
        self.inputs.push(line.into());
        self
    }

    /// Queue input given as one string.
    ///
    /// Lines are separated by real newlines or by the two-character escape
    /// `\n`. A single trailing separator does not add an empty line.
    #[must_use]
    pub fn input_data(mut self, data: &str) -> Self {
        let text = data.replace("\\n", "\n");
        let text = text.strip_suffix('\n').unwrap_or(&text);
        if !text.is_empty() {
            self.inputs.extend(text.split('\n').map(str::to_string));
        }
        self
    }
}

/// Lifecycle state of a polled run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PollState {
    /// Acquiring a permit, connecting and opening the session.
    #[default]
    Starting,
    /// Reading output.
    Polling,
    /// The command exited.
    Completed,
    /// The timeout elapsed before the command exited.
    TimedOut,
    /// The run was stopped through its handle or a parent token.
    Stopped,
}

impl PollState {
    /// Check if the run is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Stopped)
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of a polled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Terminal state.
    pub state: PollState,
    /// Exit status, reported only when the command completed.
    pub exit_status: Option<i32>,
    /// Everything the command printed.
    pub output: String,
}

#[derive(Debug, Default)]
struct Buffers {
    full: Vec<u8>,
    incremental: Vec<u8>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PollState>,
    buffers: Mutex<Buffers>,
    cancel: CancellationToken,
}

/// Caller's view of a polled run in progress.
///
/// Clones refer to the same run.
#[derive(Debug, Clone)]
pub struct PollHandle {
    shared: Arc<Shared>,
}

impl Default for PollHandle {
    fn default() -> Self {
        Self::with_token(CancellationToken::new())
    }
}

impl PollHandle {
    /// Create a handle that is only stopped through [`stop`](Self::stop).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that is also stopped when `parent` is cancelled.
    #[must_use]
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PollState::Starting),
                buffers: Mutex::new(Buffers::default()),
                cancel,
            }),
        }
    }

    /// Ask the run to stop at the next poll boundary.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Check if a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PollState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All output so far.
    #[must_use]
    pub fn output(&self) -> String {
        let buffers = self.buffers();
        String::from_utf8_lossy(&buffers.full).into_owned()
    }

    /// Output since the last [`prune`](Self::prune).
    #[must_use]
    pub fn incremental_output(&self) -> String {
        let buffers = self.buffers();
        String::from_utf8_lossy(&buffers.incremental).into_owned()
    }

    /// Clear the incremental buffer. The full buffer is untouched.
    pub fn prune(&self) {
        self.buffers().incremental.clear();
    }

    fn buffers(&self) -> std::sync::MutexGuard<'_, Buffers> {
        self.shared
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, data: &[u8]) {
        let mut buffers = self.buffers();
        buffers.full.extend_from_slice(data);
        buffers.incremental.extend_from_slice(data);
    }

    fn set_state(&self, state: PollState) {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn cancelled(&self) {
        self.shared.cancel.cancelled().await;
    }
}

/// Runs polled sessions on a node.
pub struct PolledSessionRunner<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    limiter: Arc<SessionLimiter>,
}

impl<T: Transport> std::fmt::Debug for PolledSessionRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledSessionRunner")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> PolledSessionRunner<T> {
    /// Create a runner.
    pub fn new(connection: Arc<ConnectionManager<T>>, limiter: Arc<SessionLimiter>) -> Self {
        Self {
            connection,
            limiter,
        }
    }

    /// Run `request` under a fresh handle that stops when `parent` is
    /// cancelled.
    pub async fn run_with_cancel(
        &self,
        request: PollRequest,
        parent: &CancellationToken,
    ) -> Result<PollOutcome> {
        self.run(request, &PollHandle::child_of(parent)).await
    }

    /// Run `request` until it completes, times out or `handle` is stopped.
    ///
    /// Reaching a timeout or a stop is a normal outcome. Errors are only
    /// returned when the session could not be started or the sink could not
    /// be written.
    pub async fn run(&self, request: PollRequest, handle: &PollHandle) -> Result<PollOutcome> {
        let config = self.connection.config();
        let label = config.label().to_string();
        let timings = config.timings.clone();
        handle.set_state(PollState::Starting);

        let _permit = self.limiter.acquire().await?;
        let connect_timeout = if request.timeout.is_zero() {
            config.exec_timeout
        } else {
            request.timeout
        };
        self.connection.ensure_connected(connect_timeout).await?;

        let mut sink = open_sink(&request.sink).await?;
        let mut channel = self.connection.transport().open_channel().await?;
        channel.set_combine_stderr(true);
        let started = async {
            channel.request_pty(&PtyRequest::default()).await?;
            channel.exec(&request.command).await
        }
        .await;
        if let Err(e) = started {
            channel.close().await;
            tracing::error!(host = %label, command = %request.command, error = %e, "failed to start polled session");
            return Err(e);
        }

        tracing::info!(
            host = %label,
            command = %request.command,
            timeout = ?request.timeout,
            sink = %request.sink.display(),
            "polling session started"
        );
        handle.set_state(PollState::Polling);

        let started_at = Instant::now();
        let mut inputs: VecDeque<String> = request.inputs.into();
        let mut sink_result = Ok(());

        let state = loop {
            if handle.is_stopped() {
                break PollState::Stopped;
            }

            if let Some(data) = channel.try_recv(timings.poll_buffer_size) {
                handle.append(&data);
                sink_result = write_sink(&mut sink, &data, &request.sink).await;
                if sink_result.is_err() {
                    break PollState::Stopped;
                }
                if channel.send_ready() {
                    if let Some(line) = inputs.pop_front() {
                        if let Err(e) = channel.send(format!("{line}\n").as_bytes()).await {
                            tracing::warn!(host = %label, error = %e, "failed to send input line");
                        }
                    }
                }
            }

            if channel.exit_status_ready() {
                break PollState::Completed;
            }
            if !request.timeout.is_zero() && started_at.elapsed() > request.timeout {
                break PollState::TimedOut;
            }

            tokio::select! {
                () = handle.cancelled() => {}
                () = tokio::time::sleep(timings.poll_interval) => {}
            }
        };

        while sink_result.is_ok() {
            let Some(data) = channel.try_recv(timings.poll_buffer_size) else {
                break;
            };
            handle.append(&data);
            sink_result = write_sink(&mut sink, &data, &request.sink).await;
        }

        let exit_status = (state == PollState::Completed)
            .then(|| channel.exit_status().unwrap_or(UNKNOWN_EXIT_STATUS));
        channel.close().await;
        drop(sink);
        handle.set_state(state);
        sink_result?;

        match state {
            PollState::TimedOut => tracing::warn!(
                host = %label,
                command = %request.command,
                elapsed = ?started_at.elapsed(),
                "polled session timed out, closed"
            ),
            _ => tracing::info!(
                host = %label,
                command = %request.command,
                state = %state,
                exit_status = ?exit_status,
                "polling session finished"
            ),
        }

        Ok(PollOutcome {
            state,
            exit_status,
            output: handle.output(),
        })
    }
}

async fn open_sink(path: &std::path::Path) -> Result<File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| RemoteError::io(format!("opening output file {}", path.display()), e))
}

async fn write_sink(sink: &mut File, data: &[u8], path: &std::path::Path) -> Result<()> {
    let written = match sink.write_all(data).await {
        Ok(()) => sink.flush().await,
        Err(e) => Err(e),
    };
    written.map_err(|e| RemoteError::io(format!("writing {}", path.display()), e))
}
