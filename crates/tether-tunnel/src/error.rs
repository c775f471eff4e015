//! Tunnel transport error types.

use crate::state::ConnectionState;

/// Result type alias using [`TunnelError`].
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced by the tunnel transport.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Connection error: {0}")]
    Connect(String),

    /// The channel is not in a state that allows `op`.
    #[error("Cannot {op} in state {state}")]
    IllegalState {
        op: &'static str,
        state: ConnectionState,
    },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        Self::Ssh(format!("key error: {err}"))
    }
}

impl From<tether_core::Error> for TunnelError {
    fn from(err: tether_core::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl TunnelError {
    /// Whether this error means the transport underneath the channel is gone,
    /// as opposed to a caller-side misuse.
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Ssh(_)
                | Self::Connect(_)
                | Self::Io(_)
                | Self::Codec(_)
                | Self::FrameTooLarge { .. }
        )
    }
}
