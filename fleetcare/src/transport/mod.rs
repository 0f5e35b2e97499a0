//! Remote file-transfer sessions.
//!
//! The executor only sees the [`SessionFactory`] and [`TransferSession`]
//! traits. [`SftpConnector`] implements them over SSH (russh + russh-sftp);
//! tests use an in-memory fleet.

pub mod config;
pub mod pattern;
mod ssh;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{AuthMethod, HostKeyVerification, SshConfig, TransferMode, TransferOptions};
pub use ssh::{SftpConnector, SftpTransfer, SshTransport};

use std::future::Future;
use std::path::Path;

use crate::device::Device;
use crate::error::{SessionError, TransferFailure};

/// Result type for device-scoped session calls.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Opens one session per device.
pub trait SessionFactory: Send + Sync {
    /// Session type produced by this factory.
    type Session: TransferSession;

    /// Establish an authenticated session to a device.
    fn open(&self, device: &Device) -> impl Future<Output = SessionResult<Self::Session>> + Send;
}

/// An open file-transfer session to one device.
///
/// Sessions are never shared between devices. Whoever opens a session
/// must call [`close`](TransferSession::close) on every path, including
/// errors.
pub trait TransferSession: Send {
    /// List a remote directory. `.` and `..` are never returned.
    fn list(&mut self, remote_dir: &str)
    -> impl Future<Output = SessionResult<Vec<RemoteEntry>>> + Send;

    /// Download every entry matching `remote_pattern` into `local_dir`,
    /// recursing into matched directories.
    fn get(
        &mut self,
        remote_pattern: &str,
        local_dir: &Path,
        options: &TransferOptions,
    ) -> impl Future<Output = SessionResult<TransferResult>> + Send;

    /// Upload one local file, overwriting the remote path.
    fn put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        options: &TransferOptions,
    ) -> impl Future<Output = SessionResult<TransferResult>> + Send;

    /// Remove every entry matching `remote_pattern`. Directories are removed
    /// with their contents.
    fn remove(&mut self, remote_pattern: &str)
    -> impl Future<Output = SessionResult<TransferResult>> + Send;

    /// Run a shell command on the device.
    fn exec(&mut self, command: &str) -> impl Future<Output = SessionResult<CommandResult>> + Send;

    /// Close the session.
    fn close(self) -> impl Future<Output = SessionResult<()>> + Send;
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// File name without directory.
    pub name: String,

    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
        }
    }
}

/// Per-file outcome of a get, put or remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferResult {
    /// Pattern or path the transfer was asked for.
    pub pattern: String,

    /// Paths handled successfully.
    pub transferred: Vec<String>,

    /// Paths that failed.
    pub failures: Vec<TransferFailure>,
}

impl TransferResult {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    /// Record a handled path.
    pub fn push_ok(&mut self, path: impl Into<String>) {
        self.transferred.push(path.into());
    }

    /// Record a failed path.
    pub fn push_failure(&mut self, path: impl Into<String>, message: impl ToString) {
        self.failures.push(TransferFailure::new(path, message));
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn any recorded failure into a [`SessionError::Transfer`].
    pub fn check(self) -> SessionResult<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(SessionError::Transfer {
                pattern: self.pattern,
                failures: self.failures,
            })
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// The command that was run.
    pub command: String,

    /// Exit status; `None` if the channel closed before reporting one.
    pub exit_status: Option<u32>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl CommandResult {
    /// Whether the command reported exit status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Require exit status 0.
    pub fn check(self) -> SessionResult<Self> {
        match self.exit_status {
            Some(0) => Ok(self),
            Some(code) => Err(SessionError::command(
                self.command,
                format!("exit status {code}: {}", self.stderr.trim()),
            )),
            None => Err(SessionError::command(
                self.command,
                "channel closed without exit status",
            )),
        }
    }

    /// Accept a missing exit status, reject a non-zero one.
    ///
    /// Used for commands that take the connection down with them.
    pub fn check_sent(self) -> SessionResult<Self> {
        match self.exit_status {
            Some(code) if code != 0 => Err(SessionError::command(
                self.command,
                format!("exit status {code}: {}", self.stderr.trim()),
            )),
            _ => Ok(self),
        }
    }
}
