//! Transport abstraction.
//!
//! A [`Transport`] owns the network connection to one host and opens
//! [`RemoteChannel`]s on it. The engine above only talks to these traits,
//! so the russh backend (feature `ssh`) and the in-memory mock used by the
//! tests are interchangeable.
//!
//! Channel reads come in two flavours: [`RemoteChannel::try_recv`] and
//! [`RemoteChannel::exit_status_ready`] never wait on the network and are
//! what the polling runner uses; [`RemoteChannel::drain`] waits for the
//! remote command to finish and is used by synchronous execution.

use std::future::Future;
use std::time::Duration;

use crate::config::{Credential, NodeConfig};
use crate::error::Result;

#[cfg(feature = "ssh")]
pub mod ssh;

/// Exit status reported when a channel closed without sending one.
pub const UNKNOWN_EXIT_STATUS: i32 = -1;

/// Parameters for establishing a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest<'a> {
    /// Node configuration.
    pub config: &'a NodeConfig,
    /// Resolved login credential.
    pub credential: &'a Credential,
    /// Timeout of this single attempt.
    pub timeout: Duration,
}

/// PTY parameters requested for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type.
    pub term: String,
    /// Columns.
    pub cols: u32,
    /// Rows.
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "vt100".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Everything a channel produced once the remote command finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOutput {
    /// Bytes received on the data stream.
    pub stdout: Vec<u8>,
    /// Bytes received on the extended (stderr) stream.
    pub stderr: Vec<u8>,
    /// Exit status, or [`UNKNOWN_EXIT_STATUS`].
    pub exit_status: i32,
}

/// Network connection to one host.
pub trait Transport: Send + Sync + 'static {
    /// Channel type opened by this transport.
    type Channel: RemoteChannel;

    /// Establish and authenticate the connection, replacing any previous one.
    fn connect(&self, request: ConnectRequest<'_>) -> impl Future<Output = Result<()>> + Send;

    /// Whether the underlying connection is still open.
    fn is_active(&self) -> bool;

    /// Send a keepalive probe.
    fn send_keepalive(&self) -> impl Future<Output = Result<()>> + Send;

    /// Open a new session channel.
    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel>> + Send;

    /// Close the connection. Calling it on a closed transport does nothing.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// One session channel on a [`Transport`].
pub trait RemoteChannel: Send + 'static {
    /// Request a pseudo-terminal.
    fn request_pty(&mut self, pty: &PtyRequest) -> impl Future<Output = Result<()>> + Send;

    /// Start `command` on the channel.
    fn exec(&mut self, command: &str) -> impl Future<Output = Result<()>> + Send;

    /// Start an interactive login shell on the channel.
    fn request_shell(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Route stderr into the data stream seen by [`try_recv`](Self::try_recv).
    fn set_combine_stderr(&mut self, combine: bool);

    /// Write bytes to the remote stdin.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Take up to `max` bytes that have already arrived, without waiting.
    fn try_recv(&mut self, max: usize) -> Option<Vec<u8>>;

    /// Whether the remote side may currently accept writes.
    fn send_ready(&self) -> bool;

    /// Whether the remote command has finished, without waiting.
    fn exit_status_ready(&mut self) -> bool;

    /// Exit status if one has been received.
    fn exit_status(&self) -> Option<i32>;

    /// Wait for the remote command to finish and collect everything it sent.
    fn drain(&mut self) -> impl Future<Output = Result<ChannelOutput>> + Send;

    /// Close the channel.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
