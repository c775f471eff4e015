//! Tunnel endpoints and the credentials for the SSH hop.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use tether_core::config::TunnelSection;

use crate::error::{Result, TunnelError};

/// How the SSH hop authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Opaque credential reference carried alongside a [`TunnelAddress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub auth: AuthMethod,
    /// Expected server key fingerprint (`SHA256:...`). `None` accepts any key.
    pub host_key_fingerprint: Option<String>,
}

/// Immutable identity of one tunnel: the service behind the SSH server and
/// the SSH server itself. Equality and hashing ignore the credentials.
#[derive(Clone)]
pub struct TunnelAddress {
    service_host: String,
    service_port: u16,
    ssh_host: String,
    ssh_port: u16,
    credentials: Arc<Credentials>,
}

impl TunnelAddress {
    pub fn new(
        service_host: impl Into<String>,
        service_port: u16,
        ssh_host: impl Into<String>,
        ssh_port: u16,
        credentials: Credentials,
    ) -> Self {
        Self {
            service_host: service_host.into(),
            service_port,
            ssh_host: ssh_host.into(),
            ssh_port,
            credentials: Arc::new(credentials),
        }
    }

    /// Build an address from the `[tunnel]` config section.
    pub fn from_config(section: &TunnelSection) -> Result<Self> {
        let auth = match (&section.password, &section.key_path) {
            (Some(password), None) => AuthMethod::Password(password.clone()),
            (None, Some(path)) => AuthMethod::KeyFile {
                path: path.clone(),
                passphrase: section.passphrase.clone(),
            },
            (None, None) => {
                return Err(TunnelError::Config(
                    "tunnel needs either a password or a key_path".into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(TunnelError::Config(
                    "tunnel.password and tunnel.key_path are mutually exclusive".into(),
                ));
            }
        };
        Ok(Self::new(
            section.service_host.clone(),
            section.service_port,
            section.ssh_host.clone(),
            section.ssh_port,
            Credentials {
                username: section.username.clone(),
                auth,
                host_key_fingerprint: section.host_key_fingerprint.clone(),
            },
        ))
    }

    pub fn service_host(&self) -> &str {
        &self.service_host
    }

    pub const fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub const fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl PartialEq for TunnelAddress {
    fn eq(&self, other: &Self) -> bool {
        self.service_host == other.service_host
            && self.service_port == other.service_port
            && self.ssh_host == other.ssh_host
            && self.ssh_port == other.ssh_port
    }
}

impl Eq for TunnelAddress {}

impl Hash for TunnelAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_host.hash(state);
        self.service_port.hash(state);
        self.ssh_host.hash(state);
        self.ssh_port.hash(state);
    }
}

/// Renders without credentials, safe for logs.
impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel://{}:{} via {}:{}",
            self.service_host, self.service_port, self.ssh_host, self.ssh_port
        )
    }
}

impl fmt::Debug for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelAddress")
            .field("service", &format_args!("{}:{}", self.service_host, self.service_port))
            .field("ssh", &format_args!("{}:{}", self.ssh_host, self.ssh_port))
            .field("username", &self.credentials.username)
            .finish_non_exhaustive()
    }
}
