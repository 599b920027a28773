//! Synchronous command execution.
//!
//! A command runs on its own PTY-backed channel while the caller holds a
//! session permit. Commands that need root are wrapped in
//! `sudo -k -S -p '' bash -c "..."` and the privilege password is written to
//! stdin, followed by any interactive input the caller supplied. The call
//! returns once the remote command has exited and its output is drained.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::{NodeConfig, Timings};
use crate::connection::ConnectionManager;
use crate::error::{RemoteError, Result};
use crate::limiter::SessionLimiter;
use crate::retry::RetryPolicy;
use crate::transport::{ChannelOutput, PtyRequest, RemoteChannel, Transport};

/// Per-call options for [`CommandExecutor::execute`].
#[derive(Clone, Default)]
pub struct CommandOptions {
    /// Values written to stdin after the command starts, in order.
    pub input_values: Vec<String>,
    /// Bound on waiting for the command. Defaults to the node's
    /// `exec_timeout`.
    pub timeout: Option<Duration>,
    /// Run with root privileges.
    pub sudo: bool,
    /// Log output at debug instead of info.
    pub quiet: bool,
}

impl std::fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandOptions")
            .field("input_values", &self.input_values.len())
            .field("timeout", &self.timeout)
            .field("sudo", &self.sudo)
            .field("quiet", &self.quiet)
            .finish()
    }
}

impl CommandOptions {
    /// Create default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one input value.
    #[must_use]
    pub fn input(mut self, value: impl Into<String>) -> Self {
        self.input_values.push(value.into());
        self
    }

    /// Add several input values.
    #[must_use]
    pub fn inputs<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_values.extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run with root privileges.
    #[must_use]
    pub const fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Log output at debug level.
    #[must_use]
    pub const fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

/// Output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Standard output, trimmed.
    pub stdout: String,
    /// Standard error, trimmed.
    pub stderr: String,
    /// Exit status; `-1` if the remote side never reported one.
    pub exit_status: i32,
}

impl CommandResult {
    /// Check if the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_status == 0
    }
}

impl From<ChannelOutput> for CommandResult {
    fn from(output: ChannelOutput) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_status: output.exit_status,
        }
    }
}

/// A command ready to be issued on a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    /// Text passed to `exec`.
    pub text: String,
    /// Whether the command was wrapped for privilege escalation.
    pub escalated: bool,
    /// Password written to stdin before any other input.
    pub password: Option<String>,
}

impl std::fmt::Debug for PreparedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCommand")
            .field("text", &self.text)
            .field("escalated", &self.escalated)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Strip a leading `sudo` word, returning the rest of the command.
#[must_use]
pub fn strip_sudo(command: &str) -> Option<&str> {
    let rest = command.trim_start().strip_prefix("sudo")?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// Escape `command` for use inside a double-quoted `bash -c` argument.
#[must_use]
pub fn escape_double_quoted(command: &str) -> String {
    command.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Turn a caller's command into what is sent to the remote side.
///
/// A leading `sudo` word is removed and forces escalation. Escalation is
/// skipped for root logins. Nested `bash ` invocations cannot be escalated.
pub fn prepare_command(command: &str, sudo: bool, config: &NodeConfig) -> Result<PreparedCommand> {
    let (command, sudo) = match strip_sudo(command) {
        Some(rest) => (rest, true),
        None => (command, sudo),
    };

    if !sudo || config.is_root() {
        return Ok(PreparedCommand {
            text: command.to_string(),
            escalated: false,
            password: None,
        });
    }

    if command.contains("bash ") {
        return Err(RemoteError::UnsupportedEscalation {
            command: command.to_string(),
        });
    }

    Ok(PreparedCommand {
        text: format!(
            "sudo -k -S -p '' bash -c \"{}\"",
            escape_double_quoted(command)
        ),
        escalated: true,
        password: config.privilege_password().map(str::to_string),
    })
}

/// One interactive input value, framed for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    /// A single control character, sent raw.
    Control(u8),
    /// A line, sent with a trailing newline.
    Line(String),
}

impl InputFrame {
    /// Frame a caller-supplied value.
    #[must_use]
    pub fn new(value: &str) -> Self {
        match value.as_bytes() {
            [byte] if *byte < 0x20 => Self::Control(*byte),
            _ => Self::Line(value.to_string()),
        }
    }

    /// Bytes written to the channel.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Self::Control(byte) => vec![*byte],
            Self::Line(line) => format!("{line}\n").into_bytes(),
        }
    }

    /// Pause before writing this frame.
    #[must_use]
    pub fn pause(&self, timings: &Timings) -> Duration {
        match self {
            Self::Control(_) => timings.input_pause + timings.control_char_pause,
            Self::Line(_) => timings.input_pause,
        }
    }
}

/// Non-authoritative record of the most recent command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecDiagnostics {
    /// Last command issued.
    pub last_command: Option<String>,
    /// Exit status of the last command that finished.
    pub last_exit_status: Option<i32>,
}

/// Runs commands to completion on a node.
pub struct CommandExecutor<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    limiter: Arc<SessionLimiter>,
    diagnostics: Mutex<ExecDiagnostics>,
}

impl<T: Transport> std::fmt::Debug for CommandExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("connection", &self.connection)
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

impl<T: Transport> CommandExecutor<T> {
    /// Create an executor.
    pub fn new(connection: Arc<ConnectionManager<T>>, limiter: Arc<SessionLimiter>) -> Self {
        Self {
            connection,
            limiter,
            diagnostics: Mutex::new(ExecDiagnostics::default()),
        }
    }

    /// Snapshot of the last command and its exit status.
    pub fn diagnostics(&self) -> ExecDiagnostics {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `command` and wait for it to exit.
    ///
    /// A nonzero exit status is returned in the result, not as an error.
    pub async fn execute(&self, command: &str, options: CommandOptions) -> Result<CommandResult> {
        let config = self.connection.config();
        let label = config.label().to_string();
        let timeout = options.timeout.unwrap_or(config.exec_timeout);
        let prepared = prepare_command(command, options.sudo, &config).inspect_err(|e| {
            tracing::error!(host = %label, error = %e, "refusing to run command");
        })?;

        let _permit = self.limiter.acquire().await?;
        self.connection.ensure_connected(timeout).await?;

        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_command = Some(command.to_string());
        tracing::debug!(host = %label, command = %command, sudo = prepared.escalated, "executing");

        let mut channel = self.open_command_channel(&prepared.text, &config).await?;
        tokio::time::sleep(config.timings.prompt_settle).await;
        feed_input(
            &mut channel,
            prepared.password.as_deref(),
            &options.input_values,
            &config.timings,
            &label,
        )
        .await;

        let output = match tokio::time::timeout(timeout, channel.drain()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                channel.close().await;
                tracing::error!(host = %label, command = %command, error = %e, "reading output failed");
                return Err(e);
            }
            Err(_) => {
                channel.close().await;
                tracing::error!(host = %label, command = %command, ?timeout, "command timed out");
                return Err(RemoteError::Timeout {
                    host: label,
                    command: command.to_string(),
                    duration: timeout,
                });
            }
        };
        channel.close().await;

        let result = CommandResult::from(output);
        log_result(&label, command, &result, options.quiet);
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_exit_status = Some(result.exit_status);
        Ok(result)
    }

    async fn open_command_channel(&self, text: &str, config: &NodeConfig) -> Result<T::Channel> {
        let label = config.label();
        let mut retry = RetryPolicy::fixed(
            config.timings.channel_attempts,
            config.timings.channel_retry_interval,
        )
        .start();

        loop {
            retry.record_attempt();
            let error = match self.connection.transport().open_channel().await {
                Ok(mut channel) => match start_command(&mut channel, text).await {
                    Ok(()) => return Ok(channel),
                    Err(e) => {
                        channel.close().await;
                        e
                    }
                },
                Err(e) => e,
            };

            if retry.should_retry() {
                tracing::warn!(
                    host = %label,
                    attempt = retry.attempt(),
                    error = %error,
                    "opening command channel failed, retrying"
                );
                retry.backoff().await;
            } else {
                self.connection.mark_unhealthy();
                tracing::error!(
                    host = %label,
                    attempts = retry.attempt(),
                    error = %error,
                    "could not open command channel"
                );
                return Err(RemoteError::channel(
                    label,
                    format!("giving up after {} attempts: {error}", retry.attempt()),
                ));
            }
        }
    }
}

async fn start_command<C: RemoteChannel>(channel: &mut C, text: &str) -> Result<()> {
    channel.request_pty(&PtyRequest::default()).await?;
    channel.exec(text).await
}

async fn feed_input<C: RemoteChannel>(
    channel: &mut C,
    password: Option<&str>,
    inputs: &[String],
    timings: &Timings,
    label: &str,
) {
    if let Some(password) = password {
        if let Err(e) = channel.send(format!("{password}\n").as_bytes()).await {
            tracing::warn!(host = %label, error = %e, "failed to send sudo password");
        }
    }

    for (index, value) in inputs.iter().enumerate() {
        let frame = InputFrame::new(value);
        tokio::time::sleep(frame.pause(timings)).await;
        if let Err(e) = channel.send(&frame.bytes()).await {
            tracing::warn!(
                host = %label,
                input = index,
                error = %e,
                "failed to send input, dropping the rest"
            );
            return;
        }
    }
}

fn log_result(label: &str, command: &str, result: &CommandResult, quiet: bool) {
    if quiet {
        tracing::debug!(
            host = %label,
            command = %command,
            exit_status = result.exit_status,
            stdout = %result.stdout,
            "command finished"
        );
    } else {
        tracing::info!(
            host = %label,
            command = %command,
            exit_status = result.exit_status,
            stdout = %result.stdout,
            "command finished"
        );
    }

    if result.stderr.is_empty() {
        return;
    }
    if result.success() {
        tracing::debug!(host = %label, stderr = %result.stderr, "command stderr");
    } else {
        tracing::info!(host = %label, stderr = %result.stderr, "command stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::mock::{CommandBehavior, MockTransport};
    use proptest::prelude::*;

    fn config() -> NodeConfig {
        NodeConfig::new("10.2.0.1")
            .username("tester")
            .password("loginpw")
            .timings(Timings::fast())
    }

    fn executor(transport: &MockTransport, config: NodeConfig) -> CommandExecutor<MockTransport> {
        let limiter = Arc::new(SessionLimiter::new(config.max_sessions));
        let connection = Arc::new(ConnectionManager::new(
            config,
            Arc::new(transport.clone()),
            Arc::clone(&limiter),
        ));
        CommandExecutor::new(connection, limiter)
    }

    fn unescape(text: &str) -> String {
        let mut out = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn strip_sudo_needs_word_boundary() {
        assert_eq!(strip_sudo("sudo ls -l"), Some("ls -l"));
        assert_eq!(strip_sudo("  sudo   reboot"), Some("reboot"));
        assert_eq!(strip_sudo("sudo"), Some(""));
        assert_eq!(strip_sudo("sudoedit /etc/hosts"), None);
        assert_eq!(strip_sudo("ls"), None);
    }

    #[test]
    fn sudo_wrap_and_password() {
        let prepared = prepare_command("cat /etc/shadow", true, &config()).unwrap();
        assert_eq!(prepared.text, "sudo -k -S -p '' bash -c \"cat /etc/shadow\"");
        assert!(prepared.escalated);
        assert_eq!(prepared.password.as_deref(), Some("loginpw"));

        let with_root = config().root_password("rootpw");
        let prepared = prepare_command("sudo id", false, &with_root).unwrap();
        assert_eq!(prepared.password.as_deref(), Some("rootpw"));
        assert!(!format!("{prepared:?}").contains("rootpw"));
    }

    #[test]
    fn root_login_is_not_wrapped() {
        let root = config().username("root");
        let prepared = prepare_command("sudo id", false, &root).unwrap();
        assert_eq!(prepared.text, "id");
        assert!(!prepared.escalated);
        assert!(prepared.password.is_none());
    }

    #[test]
    fn nested_bash_is_rejected() {
        let err = prepare_command("bash -c 'id'", true, &config()).unwrap_err();
        assert!(matches!(err, RemoteError::UnsupportedEscalation { .. }));
        // fine without escalation
        assert!(prepare_command("bash -c 'id'", false, &config()).is_ok());
    }

    #[test]
    fn quotes_and_backslashes_are_escaped() {
        let prepared = prepare_command(r#"echo "a\b" > /tmp/x"#, true, &config()).unwrap();
        assert_eq!(
            prepared.text,
            r#"sudo -k -S -p '' bash -c "echo \"a\\b\" > /tmp/x""#
        );
    }

    #[test]
    fn input_framing() {
        let ctrl_c = InputFrame::new("\u{3}");
        assert_eq!(ctrl_c, InputFrame::Control(3));
        assert_eq!(ctrl_c.bytes(), vec![3]);

        let line = InputFrame::new("yes");
        assert_eq!(line.bytes(), b"yes\n".to_vec());

        // more than one character is always a line
        assert!(matches!(InputFrame::new("\u{3}\u{3}"), InputFrame::Line(_)));
        assert!(matches!(InputFrame::new(" "), InputFrame::Line(_)));

        let timings = Timings::default();
        assert_eq!(ctrl_c.pause(&timings), Duration::from_millis(1100));
        assert_eq!(line.pause(&timings), Duration::from_millis(100));
    }

    #[test]
    fn options_builder() {
        let options = CommandOptions::new()
            .input("y")
            .inputs(["a", "b"])
            .timeout(Duration::from_secs(9))
            .sudo(true)
            .quiet(true);
        assert_eq!(options.input_values, vec!["y", "a", "b"]);
        assert_eq!(options.timeout, Some(Duration::from_secs(9)));
        assert!(options.sudo && options.quiet);
    }

    proptest! {
        #[test]
        fn sudo_prefix_equals_sudo_flag(command in "[a-z][a-z0-9 ./=\"\\\\-]{0,40}") {
            prop_assume!(strip_sudo(&command).is_none());
            let cfg = config();
            let prefixed = prepare_command(&format!("sudo {command}"), false, &cfg);
            let flagged = prepare_command(&command, true, &cfg);
            prop_assert_eq!(prefixed.is_err(), flagged.is_err());
            prop_assert_eq!(prefixed.ok(), flagged.ok());
        }

        #[test]
        fn escaping_round_trips(command in "[ -~]{0,60}") {
            prop_assume!(!command.contains("bash ") && strip_sudo(&command).is_none());
            let prepared = prepare_command(&command, true, &config()).unwrap();
            let inner = prepared
                .text
                .strip_prefix("sudo -k -S -p '' bash -c \"")
                .and_then(|rest| rest.strip_suffix('"'))
                .unwrap();
            prop_assert_eq!(unescape(inner), command);
        }
    }

    #[tokio::test]
    async fn false_gives_empty_stdout_and_status_one() {
        let transport = MockTransport::new().with_command("false", CommandBehavior::exit(1));
        let exec = executor(&transport, config());

        let result = exec.execute("false", CommandOptions::new()).await.unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.exit_status, 1);
        assert!(!result.success());
        assert_eq!(exec.diagnostics().last_exit_status, Some(1));
        assert_eq!(exec.diagnostics().last_command.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn output_is_trimmed_and_channel_closed() {
        let transport = MockTransport::new().with_command(
            "hostname",
            CommandBehavior::output("  node-7\r\n").stderr("\nnote\n"),
        );
        let exec = executor(&transport, config());

        let result = exec.execute("hostname", CommandOptions::new()).await.unwrap();
        assert_eq!(result.stdout, "node-7");
        assert_eq!(result.stderr, "note");
        assert_eq!(transport.open_channels(), 0);

        let record = transport.commands().pop().unwrap();
        assert!(record.pty);
        assert!(record.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn sudo_feeds_password_then_inputs() {
        let transport = MockTransport::new();
        let exec = executor(&transport, config());

        exec.execute(
            "sudo apt-get remove pkg",
            CommandOptions::new().inputs(["y", "\u{3}"]),
        )
        .await
        .unwrap();

        let record = transport.commands().pop().unwrap();
        assert_eq!(
            record.command.as_deref(),
            Some("sudo -k -S -p '' bash -c \"apt-get remove pkg\"")
        );
        assert_eq!(record.written, b"loginpw\ny\n\x03".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn inputs_follow_a_failed_password_write() {
        let transport = MockTransport::new();
        let exec = executor(&transport, config());
        exec.execute("true", CommandOptions::new()).await.unwrap();

        transport.fail_next_writes(1);
        exec.execute("sudo fdisk /dev/sdb", CommandOptions::new().inputs(["p", "q"]))
            .await
            .unwrap();

        let record = transport.commands().pop().unwrap();
        assert_eq!(record.written, b"p\nq\n".to_vec());
    }

    #[tokio::test]
    async fn rejected_escalation_runs_nothing() {
        let transport = MockTransport::new();
        let exec = executor(&transport, config());

        let err = exec
            .execute("sudo bash -c 'id'", CommandOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::UnsupportedEscalation { .. }));
        assert!(transport.channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_open_is_retried() {
        let transport = MockTransport::new().with_command("ls", CommandBehavior::output("a b"));
        let exec = executor(&transport, config());
        exec.execute("true", CommandOptions::new()).await.unwrap();

        transport.fail_next_channels(2);
        let result = exec.execute("ls", CommandOptions::new()).await;
        assert_eq!(result.unwrap().stdout, "a b");
    }

    #[tokio::test(start_paused = true)]
    async fn channel_exhaustion_is_a_channel_error() {
        let transport = MockTransport::new();
        let exec = executor(&transport, config());
        exec.execute("true", CommandOptions::new()).await.unwrap();

        // the liveness probe takes one failure, the command channel the rest
        transport.fail_next_channels(1 + 3);
        let err = exec.execute("ls", CommandOptions::new()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Channel { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_closes_channel() {
        let transport = MockTransport::new().with_command("tail -f", CommandBehavior::hang());
        let exec = executor(&transport, config());

        let err = exec
            .execute(
                "tail -f /var/log/syslog",
                CommandOptions::new().timeout(Duration::from_secs(3)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(transport.open_channels(), 0);
    }
}
