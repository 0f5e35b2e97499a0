//! SSH transport and SFTP session implementation using russh.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::config::{AuthMethod, HostKeyVerification, SshConfig, TransferOptions};
use super::pattern::{RemotePattern, join_remote};
use super::{CommandResult, RemoteEntry, SessionFactory, SessionResult, TransferResult, TransferSession};
use crate::config::SshSettings;
use crate::device::Device;
use crate::error::{SessionError, TransportError};

/// Copy buffer size for rate-limited transfers.
const CHUNK_SIZE: usize = 32 * 1024;

/// SSH transport wrapping a russh client handle.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,

    /// Configuration used for this connection.
    config: SshConfig,
}

impl SshTransport {
    /// Connect to the SSH server and authenticate.
    pub async fn connect(config: SshConfig) -> Result<Self, TransportError> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(config.timeout),
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification,
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        debug!("Connecting to {}", config.socket_addr());
        let mut session = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(|e| {
            // Prefer the detailed host-key error over russh's generic one.
            let detailed = host_key_error.lock().ok().and_then(|mut slot| slot.take());
            detailed.unwrap_or_else(|| match e {
                russh::Error::IO(source) => TransportError::ConnectionFailed {
                    host: config.host.clone(),
                    port: config.port,
                    source,
                },
                other => TransportError::Ssh(other),
            })
        })?;

        Self::authenticate(&mut session, &config).await?;

        Ok(Self { session, config })
    }

    /// Start the SFTP subsystem on a new channel.
    pub async fn open_sftp(&self) -> Result<SftpSession, TransportError> {
        let channel = self.session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Subsystem(e.to_string()))
    }

    /// Run a command on its own exec channel and collect its output.
    ///
    /// If the channel stays silent past the configured timeout, the result
    /// carries no exit status.
    pub async fn exec(&self, command: &str) -> Result<CommandResult, TransportError> {
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(self.config.timeout, collect).await.is_err() {
            debug!(
                "Command `{command}` on {} produced no exit status within {:?}",
                self.config.host, self.config.timeout
            );
        }

        Ok(CommandResult {
            command: command.to_string(),
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Authenticate with the server.
    async fn authenticate(
        session: &mut Handle<SshHandler>,
        config: &SshConfig,
    ) -> Result<(), TransportError> {
        let success = match &config.auth {
            AuthMethod::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await?
                .success(),
            AuthMethod::PrivateKey { path } => {
                let key =
                    load_secret_key(path, None).map_err(|e| TransportError::Key(e.to_string()))?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session.best_supported_rsa_hash().await?.flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await?
                    .success()
            }
        };

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            });
        }

        Ok(())
    }

    /// Close the connection.
    pub async fn close(self) -> Result<(), TransportError> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(TransportError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> Result<bool, TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> Result<(), TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => {
                warn!(
                    "Accepting host key for {}:{} without verification",
                    self.host, self.port
                );
                Ok(true)
            }

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    // Unknown host, learn the key
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }
}

/// Opens [`SftpTransfer`] sessions using shared SSH settings.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    settings: SshSettings,
}

impl SftpConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

impl SessionFactory for SftpConnector {
    type Session = SftpTransfer;

    async fn open(&self, device: &Device) -> SessionResult<SftpTransfer> {
        let config = SshConfig::for_device(device, &self.settings);
        let transport = SshTransport::connect(config).await?;

        let sftp = match transport.open_sftp().await {
            Ok(sftp) => sftp,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("{}: disconnect after failed subsystem start: {close_err}", device.name);
                }
                return Err(e.into());
            }
        };

        Ok(SftpTransfer {
            device: device.name.clone(),
            transport,
            sftp,
        })
    }
}

/// SFTP session to one device, plus its SSH connection for exec.
pub struct SftpTransfer {
    device: String,
    transport: SshTransport,
    sftp: SftpSession,
}

impl SftpTransfer {
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
        result: &mut TransferResult,
    ) {
        let outcome = async {
            let mut source = self.sftp.open(remote).await.map_err(|e| e.to_string())?;
            let mut target = tokio::fs::File::create(local)
                .await
                .map_err(|e| format!("{}: {e}", local.display()))?;
            copy_limited(&mut source, &mut target, options.rate_limit)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match outcome {
            Ok(bytes) => {
                debug!("{}: {remote} -> {} ({bytes} bytes)", self.device, local.display());
                result.push_ok(remote);
            }
            Err(message) => result.push_failure(remote, message),
        }
    }

    /// Remove a directory and everything below it.
    async fn remove_tree(&self, root: &str, result: &mut TransferResult) {
        let mut pending = vec![root.to_string()];
        let mut dirs = Vec::new();

        while let Some(dir) = pending.pop() {
            let entries = match self.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    result.push_failure(&dir, e);
                    continue;
                }
            };
            for entry in entries {
                let path = join_remote(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(path);
                } else {
                    match self.sftp.remove_file(&path).await {
                        Ok(()) => result.push_ok(path),
                        Err(e) => result.push_failure(path, e),
                    }
                }
            }
            dirs.push(dir);
        }

        // Children were pushed after their parents.
        for dir in dirs.into_iter().rev() {
            match self.sftp.remove_dir(&dir).await {
                Ok(()) => result.push_ok(dir),
                Err(e) => result.push_failure(dir, e),
            }
        }
    }

    async fn read_dir(&self, dir: &str) -> SessionResult<Vec<RemoteEntry>> {
        let entries = self
            .sftp
            .read_dir(dir)
            .await
            .map_err(SessionError::sftp(dir))?;

        Ok(entries
            .filter(|entry| !matches!(entry.file_name().as_str(), "." | ".."))
            .map(|entry| RemoteEntry {
                is_dir: entry.file_type().is_dir(),
                name: entry.file_name(),
            })
            .collect())
    }
}

impl TransferSession for SftpTransfer {
    async fn list(&mut self, remote_dir: &str) -> SessionResult<Vec<RemoteEntry>> {
        self.read_dir(remote_dir).await
    }

    async fn get(
        &mut self,
        remote_pattern: &str,
        local_dir: &Path,
        options: &TransferOptions,
    ) -> SessionResult<TransferResult> {
        let pattern = RemotePattern::parse(remote_pattern);
        let mut result = TransferResult::new(remote_pattern);

        // (remote directory, local directory) pairs still to walk
        let mut pending: Vec<(String, PathBuf)> = Vec::new();

        for entry in self.read_dir(&pattern.dir).await? {
            if !pattern.matches(&entry.name) {
                continue;
            }
            let remote = pattern.entry_path(&entry.name);
            if entry.is_dir {
                pending.push((remote, subdir(local_dir, &entry.name, options)));
            } else {
                self.download(&remote, &local_dir.join(&entry.name), options, &mut result)
                    .await;
            }
        }

        while let Some((remote_dir, local)) = pending.pop() {
            if let Err(e) = tokio::fs::create_dir_all(&local).await {
                result.push_failure(&remote_dir, format!("{}: {e}", local.display()));
                continue;
            }
            let entries = match self.read_dir(&remote_dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    result.push_failure(&remote_dir, e);
                    continue;
                }
            };
            for entry in entries {
                let remote = join_remote(&remote_dir, &entry.name);
                if entry.is_dir {
                    pending.push((remote, subdir(&local, &entry.name, options)));
                } else {
                    self.download(&remote, &local.join(&entry.name), options, &mut result)
                        .await;
                }
            }
        }

        Ok(result)
    }

    async fn put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        options: &TransferOptions,
    ) -> SessionResult<TransferResult> {
        let mut result = TransferResult::new(remote_path);

        let outcome = async {
            let mut source = tokio::fs::File::open(local_path)
                .await
                .map_err(|e| format!("{}: {e}", local_path.display()))?;
            let mut target = self.sftp.create(remote_path).await.map_err(|e| e.to_string())?;
            copy_limited(&mut source, &mut target, options.rate_limit)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match outcome {
            Ok(bytes) => {
                debug!(
                    "{}: {} -> {remote_path} ({bytes} bytes)",
                    self.device,
                    local_path.display()
                );
                result.push_ok(remote_path);
            }
            Err(message) => result.push_failure(remote_path, message),
        }
        Ok(result)
    }

    async fn remove(&mut self, remote_pattern: &str) -> SessionResult<TransferResult> {
        let pattern = RemotePattern::parse(remote_pattern);
        let mut result = TransferResult::new(remote_pattern);

        let mut matched = false;
        for entry in self.read_dir(&pattern.dir).await? {
            if !pattern.matches(&entry.name) {
                continue;
            }
            matched = true;
            let path = pattern.entry_path(&entry.name);
            if entry.is_dir {
                self.remove_tree(&path, &mut result).await;
            } else {
                match self.sftp.remove_file(&path).await {
                    Ok(()) => result.push_ok(path),
                    Err(e) => result.push_failure(path, e),
                }
            }
        }

        if !matched && !pattern.is_wildcard() {
            result.push_failure(remote_pattern, "no such file");
        }
        Ok(result)
    }

    async fn exec(&mut self, command: &str) -> SessionResult<CommandResult> {
        self.transport
            .exec(command)
            .await
            .map_err(|e| SessionError::command(command, e.to_string()))
    }

    async fn close(self) -> SessionResult<()> {
        if let Err(e) = self.sftp.close().await {
            debug!("{}: sftp close: {e}", self.device);
        }
        self.transport.close().await?;
        Ok(())
    }
}

fn subdir(local: &Path, name: &str, options: &TransferOptions) -> PathBuf {
    if options.preserve_structure {
        local.join(name)
    } else {
        local.to_path_buf()
    }
}

/// Copy `reader` into `writer`, holding the average rate at or below
/// `rate_limit` bytes per second. Zero means unlimited.
async fn copy_limited<R, W>(reader: &mut R, writer: &mut W, rate_limit: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if rate_limit == 0 {
        let copied = tokio::io::copy(reader, writer).await?;
        writer.shutdown().await?;
        return Ok(copied);
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    let start = Instant::now();
    let mut copied: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;

        let due = Duration::from_secs_f64(copied as f64 / rate_limit as f64);
        let elapsed = start.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }

    writer.shutdown().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_unlimited() {
        let data = vec![7u8; 100_000];
        let mut reader = data.as_slice();
        let mut writer = Vec::new();
        let copied = copy_limited(&mut reader, &mut writer, 0).await.unwrap();
        assert_eq!(copied, 100_000);
        assert_eq!(writer, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_rate_limited() {
        let data = vec![1u8; 3 * CHUNK_SIZE];
        let mut reader = data.as_slice();
        let mut writer = Vec::new();

        let started = Instant::now();
        let copied = copy_limited(&mut reader, &mut writer, CHUNK_SIZE as u64)
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(writer, data);
        // Three chunks at one chunk per second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");
    }

    #[test]
    fn test_subdir_flattening() {
        let flat = TransferOptions {
            preserve_structure: false,
            ..Default::default()
        };
        assert_eq!(
            subdir(Path::new("/out"), "archive", &TransferOptions::default()),
            PathBuf::from("/out/archive")
        );
        assert_eq!(subdir(Path::new("/out"), "archive", &flat), PathBuf::from("/out"));
    }
}
