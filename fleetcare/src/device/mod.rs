//! Managed devices and the registry that resolves them by name.

mod registry;

pub use registry::{DeviceRegistry, Resolution};

use std::fmt;
use std::path::PathBuf;

use secrecy::SecretString;

/// One embedded unit reachable over SSH.
///
/// Devices are read-only for the duration of a run. The name is unique
/// within a registry and doubles as the local archive folder name.
pub struct Device {
    /// Unique device name.
    pub name: String,

    /// Hostname or IP address.
    pub host: String,

    /// Port override; the SSH settings port is used when `None`.
    pub port: Option<u16>,

    /// Login user.
    pub username: String,

    /// Login password.
    pub password: SecretString,

    /// Private key used instead of the password when set.
    pub identity_file: Option<PathBuf>,
}

impl Device {
    /// Create a device with password authentication.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: None,
            username: username.into(),
            password: SecretString::from(password.into()),
            identity_file: None,
        }
    }

    /// Override the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticate with a private key file.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.username, self.host)
    }
}
