//! Tether tunnel transport.
//!
//! Carries a framed message protocol through an SSH local port forward and
//! keeps a long-lived handle usable across transport failures:
//!
//! - [`pump`]: paired byte copiers with exactly-once teardown of the shared socket
//! - [`state`]: connection state register with timed waits
//! - [`forward`]: lazily dialed port forward over an [`ssh::SessionProvider`]
//! - [`channel`]: typed message channel with checked I/O
//! - [`reconnect`]: swappable-delegate handle driven by a reconnection policy

pub mod address;
pub mod channel;
pub mod codec;
pub mod error;
pub mod forward;
pub mod pump;
pub mod reconnect;
pub mod ssh;
pub mod state;

pub use address::{AuthMethod, Credentials, TunnelAddress};
pub use channel::{ChannelEvent, CloseInitiator, ConnectOptions, MessageChannel};
pub use error::{Result, TunnelError};
pub use forward::PortForward;
pub use reconnect::{
    BackoffPolicy, BackoffReconnector, ChannelFactory, HandleOptions, MessageConnection,
    ReconnectEvent, ReconnectPolicy, ReconnectingHandle, SwapEvent, TunnelChannelFactory,
};
pub use state::{ConnectionState, StateMachine, StateSet};
