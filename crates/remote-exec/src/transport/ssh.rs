//! russh-backed transport.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use russh::client::{self, Handle, Msg};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};

use super::{ChannelOutput, ConnectRequest, PtyRequest, RemoteChannel, Transport};
use crate::config::{Credential, HostKeyPolicy};
use crate::error::{RemoteError, Result};

/// Client handler that verifies the server host key.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known_hosts = known_hosts_path();
        let verdict = lookup_known_host(&known_hosts, &self.host, self.port, server_public_key);

        Ok(match (verdict, self.policy) {
            (KnownHost::Match, _) => true,
            (KnownHost::Mismatch, _) => {
                tracing::error!(
                    host = %self.host,
                    path = %known_hosts.display(),
                    "host key changed, refusing to connect"
                );
                false
            }
            (KnownHost::Unknown, HostKeyPolicy::KnownHosts) => {
                tracing::warn!(host = %self.host, "host not found in known_hosts");
                false
            }
            (KnownHost::Unknown, HostKeyPolicy::TrustOnFirstUse) => {
                remember_host(&known_hosts, &self.host, self.port, server_public_key);
                true
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownHost {
    Match,
    Mismatch,
    Unknown,
}

fn known_hosts_path() -> PathBuf {
    if let Ok(path) = std::env::var("SSH_KNOWN_HOSTS") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ssh").join("known_hosts")
}

fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn lookup_known_host(path: &Path, host: &str, port: u16, key: &PublicKey) -> KnownHost {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return KnownHost::Unknown;
    };
    let pattern = host_pattern(host, port);

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_data)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !hosts.split(',').any(|h| h == pattern) {
            continue;
        }
        if let Ok(stored) = russh::keys::parse_public_key_base64(key_data) {
            return if stored.fingerprint(HashAlg::Sha256) == key.fingerprint(HashAlg::Sha256) {
                KnownHost::Match
            } else {
                KnownHost::Mismatch
            };
        }
    }
    KnownHost::Unknown
}

fn remember_host(path: &Path, host: &str, port: u16, key: &PublicKey) {
    use std::io::Write;

    let Ok(encoded) = key.to_openssh() else {
        tracing::warn!(host = %host, "could not encode host key, accepting without saving");
        return;
    };
    let key_str = encoded.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    let line = format!("{} {key_str}\n", host_pattern(host, port));

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()));

    match written {
        Ok(()) => tracing::info!(host = %host, path = %path.display(), "added host key to known_hosts"),
        Err(e) => tracing::warn!(
            host = %host,
            error = %e,
            "failed to write known_hosts, accepting key without saving"
        ),
    }
}

async fn load_private_key(
    path: &Path,
    passphrase: Option<&str>,
) -> std::result::Result<Arc<PrivateKey>, String> {
    let key_data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("failed to read key file {}: {e}", path.display()))?;

    let key = russh::keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        if passphrase.is_none() && e.to_string().contains("encrypted") {
            format!(
                "key {} appears to be encrypted but no passphrase was configured",
                path.display()
            )
        } else {
            format!("failed to decode key {}: {e}", path.display())
        }
    })?;
    Ok(Arc::new(key))
}

/// SSH connection to one host.
#[derive(Default)]
pub struct SshTransport {
    handle: Mutex<Option<Arc<Handle<ClientHandler>>>>,
    label: Mutex<String>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("active", &self.is_active())
            .finish()
    }
}

impl SshTransport {
    /// Create a transport with no connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<Arc<Handle<ClientHandler>>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn label(&self) -> String {
        self.label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn not_connected(&self) -> RemoteError {
        RemoteError::channel(self.label(), "not connected")
    }
}

impl Transport for SshTransport {
    type Channel = SshChannel;

    async fn connect(&self, request: ConnectRequest<'_>) -> Result<()> {
        let config = request.config;
        let host = config.host.clone();
        let port = config.port;
        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = config.label().to_string();

        let handler = ClientHandler {
            host: host.clone(),
            port,
            policy: config.host_key_policy,
        };
        let client_config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(
            request.timeout,
            client::connect(client_config, (host.as_str(), port), handler),
        )
        .await
        .map_err(|_| {
            RemoteError::connection(&host, port, format!("timed out after {:?}", request.timeout))
        })?
        .map_err(|e| match e {
            russh::Error::UnknownKey => RemoteError::host_key(&host, "server key rejected"),
            other => RemoteError::connection(&host, port, other.to_string()),
        })?;

        let user = config.username.as_str();
        let auth = match request.credential {
            Credential::Password(password) => handle.authenticate_password(user, password).await,
            Credential::PrivateKey { path, passphrase } => {
                let key = load_private_key(path, passphrase.as_deref())
                    .await
                    .map_err(|reason| RemoteError::authentication(user, &host, reason))?;
                let rsa_hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, rsa_hash))
                    .await
            }
        }
        .map_err(|e| RemoteError::connection(&host, port, e.to_string()))?;

        if !auth.success() {
            return Err(RemoteError::authentication(
                user,
                &host,
                "credentials rejected by server",
            ));
        }

        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(handle));
        if let Some(previous) = previous {
            let _ = previous
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.current().is_some_and(|h| !h.is_closed())
    }

    async fn send_keepalive(&self) -> Result<()> {
        let handle = self.current().ok_or_else(|| self.not_connected())?;
        handle
            .send_keepalive(true)
            .await
            .map_err(|e| RemoteError::channel(self.label(), format!("keepalive failed: {e}")))
    }

    async fn open_channel(&self) -> Result<SshChannel> {
        let handle = self.current().ok_or_else(|| self.not_connected())?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::channel(self.label(), e.to_string()))?;
        Ok(SshChannel::new(channel, self.label()))
    }

    async fn close(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

/// Session channel on an [`SshTransport`].
pub struct SshChannel {
    channel: Channel<Msg>,
    host: String,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    combine_stderr: bool,
    exit_status: Option<i32>,
    eof_received: bool,
    closed: bool,
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("host", &self.host)
            .field("buffered", &(self.stdout.len() + self.stderr.len()))
            .field("exit_status", &self.exit_status)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SshChannel {
    fn new(channel: Channel<Msg>, host: String) -> Self {
        Self {
            channel,
            host,
            stdout: VecDeque::with_capacity(32768),
            stderr: VecDeque::new(),
            combine_stderr: false,
            exit_status: None,
            eof_received: false,
            closed: false,
        }
    }

    fn error(&self, what: &str, e: &russh::Error) -> RemoteError {
        RemoteError::channel(&self.host, format!("{what}: {e}"))
    }

    fn absorb(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend(data.iter()),
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 && !self.combine_stderr {
                    self.stderr.extend(data.iter());
                } else {
                    self.stdout.extend(data.iter());
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_status = Some(i32::try_from(exit_status).unwrap_or(i32::MAX));
            }
            ChannelMsg::Eof => self.eof_received = true,
            ChannelMsg::Close => self.closed = true,
            _ => {}
        }
    }

    /// Move every message that already arrived into the local buffers.
    fn pump(&mut self) {
        while !self.closed {
            match self.channel.wait().now_or_never() {
                Some(Some(msg)) => self.absorb(msg),
                Some(None) => self.closed = true,
                None => break,
            }
        }
    }
}

impl RemoteChannel for SshChannel {
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<()> {
        self.channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| self.error("PTY request failed", &e))
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.channel
            .exec(false, command)
            .await
            .map_err(|e| self.error("exec request failed", &e))
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.channel
            .request_shell(false)
            .await
            .map_err(|e| self.error("shell request failed", &e))
    }

    fn set_combine_stderr(&mut self, combine: bool) {
        self.combine_stderr = combine;
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RemoteError::channel(&self.host, "channel is closed"));
        }
        self.channel
            .data(data)
            .await
            .map_err(|e| self.error("data send failed", &e))
    }

    fn try_recv(&mut self, max: usize) -> Option<Vec<u8>> {
        self.pump();
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
        self.pump();
        self.exit_status.is_some() || self.closed
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    async fn drain(&mut self) -> Result<ChannelOutput> {
        while !self.closed {
            match self.channel.wait().await {
                Some(msg) => self.absorb(msg),
                None => self.closed = true,
            }
        }
        Ok(ChannelOutput {
            stdout: self.stdout.drain(..).collect(),
            stderr: self.stderr.drain(..).collect(),
            exit_status: self.exit_status.unwrap_or(super::UNKNOWN_EXIT_STATUS),
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.channel.close().await;
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pattern_uses_brackets_for_custom_ports() {
        assert_eq!(host_pattern("db01", 22), "db01");
        assert_eq!(host_pattern("db01", 2222), "[db01]:2222");
    }

    #[test]
    fn transport_starts_inactive() {
        let transport = SshTransport::new();
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn open_channel_without_connection_fails() {
        let transport = SshTransport::new();
        let err = transport.open_channel().await.unwrap_err();
        assert!(matches!(err, RemoteError::Channel { .. }));
        transport.close().await;
        assert!(!transport.is_active());
    }
}
