//! SSH connection and transfer configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::SshSettings;
use crate::device::Device;

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    AcceptNew,

    /// Accept all keys without checking. This is what the fleet has always
    /// done; devices get re-imaged and their keys change.
    #[default]
    Disabled,
}

/// SSH connection configuration for one device.
#[derive(Debug)]
pub struct SshConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// SSH port (default: 22).
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Authentication method.
    pub auth: AuthMethod,

    /// Connection and inactivity timeout.
    pub timeout: Duration,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,
}

impl SshConfig {
    /// Build the connection settings for a device.
    pub fn for_device(device: &Device, settings: &SshSettings) -> Self {
        Self {
            host: device.host.clone(),
            port: device.port.unwrap_or(settings.port),
            username: device.username.clone(),
            auth: AuthMethod::for_device(device),
            timeout: settings.timeout(),
            host_key_verification: settings.host_key_verification,
            known_hosts_path: settings.known_hosts_path.clone(),
        }
    }

    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authentication method for SSH connections.
#[derive(Debug)]
pub enum AuthMethod {
    /// Password authentication.
    Password(SecretString),

    /// Private key authentication with an unencrypted key.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
    },
}

impl AuthMethod {
    /// Key authentication when the device names an identity file,
    /// password authentication otherwise.
    fn for_device(device: &Device) -> Self {
        match &device.identity_file {
            Some(path) => AuthMethod::PrivateKey { path: path.clone() },
            None => AuthMethod::Password(SecretString::from(
                device.password.expose_secret().to_owned(),
            )),
        }
    }
}

/// How file contents are moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// Bytes are copied unchanged.
    #[default]
    Binary,
}

/// Options applied to every get and put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Transfer mode.
    pub mode: TransferMode,

    /// Recreate remote sub-directories locally on recursive gets.
    pub preserve_structure: bool,

    /// Bytes per second, 0 for unlimited.
    pub rate_limit: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            mode: TransferMode::Binary,
            preserve_structure: true,
            rate_limit: 0,
        }
    }
}
