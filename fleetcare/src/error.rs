//! Error types for fleetcare.
//!
//! Errors are split by blast radius. [`SessionError`] belongs to one device
//! and ends up inside the batch result; [`ValidationError`],
//! [`PreconditionError`] and [`ConfigError`] stop a whole run.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::rules::OperationKind;

/// Main error type for fleetcare operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Errors raised inside one device session
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Requested operation set violates the rule set
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Run-scoped precondition failed
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Configuration or device file problems
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The background worker went away without reporting
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Transport layer errors (SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host is not present in known_hosts (strict mode)
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key differs from the one recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// SFTP subsystem could not be started
    #[error("SFTP subsystem error: {0}")]
    Subsystem(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Device-scoped errors. One of these marks a single device as failed for
/// the current operation and never stops the rest of the batch.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session could not be opened
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),

    /// One or more files in a transfer failed
    #[error("transfer of {pattern} failed: {}", summarize(.failures))]
    Transfer {
        pattern: String,
        failures: Vec<TransferFailure>,
    },

    /// Remote command exited unsuccessfully
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// SFTP request failed
    #[error("sftp request on {path} failed: {source}")]
    Sftp {
        path: String,
        #[source]
        source: russh_sftp::client::error::Error,
    },

    /// Local filesystem error
    #[error("local I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Local demo data file is missing
    #[error("local demo file {} does not exist", .0.display())]
    MissingDemoFile(PathBuf),

    /// Post-update listing does not match the master set
    #[error("payload verification failed (missing: {missing:?}, unexpected: {unexpected:?})")]
    Verification {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

impl SessionError {
    /// Wrap a local I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> SessionError {
        let path = path.into();
        move |source| SessionError::Io { path, source }
    }

    /// Wrap an SFTP error with the remote path it happened on.
    pub fn sftp(
        path: impl Into<String>,
    ) -> impl FnOnce(russh_sftp::client::error::Error) -> SessionError {
        let path = path.into();
        move |source| SessionError::Sftp { path, source }
    }

    /// Build a command failure.
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether the session never opened.
    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Connection(_))
    }
}

/// A single file that failed inside a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    /// Remote or local path of the file.
    pub path: String,
    /// Human readable reason.
    pub message: String,
}

impl TransferFailure {
    pub fn new(path: impl Into<String>, message: impl ToString) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

fn summarize(failures: &[TransferFailure]) -> String {
    match failures {
        [] => "no files matched".to_string(),
        [only] => format!("{}: {}", only.path, only.message),
        [first, rest @ ..] => format!("{}: {} (+{} more)", first.path, first.message, rest.len()),
    }
}

/// Operation selection errors. Raised before any device work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No operation was selected
    #[error("No operation selected")]
    NothingSelected,

    /// Two selected operations exclude each other
    #[error("Operation '{operation}' cannot be selected with {}", join(.conflicting))]
    MutualExclusion {
        operation: OperationKind,
        conflicting: Vec<OperationKind>,
    },

    /// A selected operation requires another one that is not selected
    #[error("Operation '{operation}' requires {} to be selected", join(.missing))]
    MissingDependency {
        operation: OperationKind,
        missing: Vec<OperationKind>,
    },

    /// The rule set has no entry for a selected operation
    #[error("No rule defined for operation '{0}'")]
    MissingRule(OperationKind),
}

fn join(kinds: &[OperationKind]) -> String {
    kinds
        .iter()
        .map(|k| format!("'{k}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run-scoped failures that no device can work around.
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// Master payload folder cannot be read
    #[error("master payload folder {} is unreadable: {source}", .path.display())]
    MasterFolder {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Archive folder for downloads cannot be created
    #[error("cannot create archive folder under {}: {source}", .path.display())]
    ArchiveFolder {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Configuration and device-file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File is not valid TOML for the expected shape
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A device entry is incomplete
    #[error("device [{device}] is missing required field '{field}'")]
    MissingField { device: String, field: &'static str },

    /// Two devices share a name
    #[error("device [{0}] is defined more than once")]
    DuplicateDevice(String),
}

/// Result type alias using fleetcare's Error.
pub type Result<T> = std::result::Result<T, Error>;
