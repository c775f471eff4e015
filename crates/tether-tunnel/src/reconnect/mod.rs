//! Reconnection: a stable handle over a replaceable channel.
//!
//! [`ReconnectingHandle`] routes every call through its current delegate and
//! swaps that delegate when a [`ReconnectPolicy`] delivers a fresh one. The
//! policy owns all retry timing; [`BackoffReconnector`] is the stock policy.

mod backoff;
mod handle;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::address::TunnelAddress;
use crate::channel::{ChannelEvent, ConnectOptions, Message, MessageChannel};
use crate::error::Result;
use crate::ssh::SessionProvider;
use crate::state::ConnectionState;

pub use backoff::{BackoffPolicy, BackoffReconnector, ReconnectEvent};
pub use handle::{HandleOptions, ReconnectingHandle, SwapEvent};

/// The operations a handle forwards to its delegate.
#[async_trait]
pub trait MessageConnection<M>: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<()>;
    async fn read_message(&self) -> Result<M>;
    async fn write_message(&self, message: &M) -> Result<()>;
    async fn close(&self);
    fn connection_id(&self) -> String;
    fn state(&self) -> ConnectionState;
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[async_trait]
impl<M: Message> MessageConnection<M> for MessageChannel<M> {
    async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        Self::connect(self, options).await
    }

    async fn read_message(&self) -> Result<M> {
        Self::read_message(self).await
    }

    async fn write_message(&self, message: &M) -> Result<()> {
        Self::write_message(self, message).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }

    fn connection_id(&self) -> String {
        Self::connection_id(self)
    }

    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        Self::events(self)
    }
}

/// Builds connected delegates for an address.
#[async_trait]
pub trait ChannelFactory<M>: Send + Sync {
    async fn build(&self, address: &TunnelAddress) -> Result<Arc<dyn MessageConnection<M>>>;
}

/// Called by a policy with the delegate it built.
pub type OnReconnected<M> = Box<dyn FnOnce(Arc<dyn MessageConnection<M>>) + Send>;

/// Decides when and how often to retry a lost tunnel.
///
/// `schedule_reconnect` must return promptly; the callback may run later on
/// any task, or never if the policy gives up.
pub trait ReconnectPolicy<M>: Send + Sync {
    fn schedule_reconnect(&self, address: TunnelAddress, on_success: OnReconnected<M>);
}

/// Builds [`MessageChannel`]s over an SSH session provider.
pub struct TunnelChannelFactory {
    provider: Arc<dyn SessionProvider>,
    options: ConnectOptions,
}

impl TunnelChannelFactory {
    pub fn new(provider: Arc<dyn SessionProvider>, options: ConnectOptions) -> Self {
        Self { provider, options }
    }
}

#[async_trait]
impl<M: Message> ChannelFactory<M> for TunnelChannelFactory {
    async fn build(&self, address: &TunnelAddress) -> Result<Arc<dyn MessageConnection<M>>> {
        let channel = MessageChannel::<M>::new(address.clone(), Arc::clone(&self.provider));
        if let Err(e) = channel.connect(&self.options).await {
            channel.close().await;
            return Err(e);
        }
        let channel: Arc<dyn MessageConnection<M>> = Arc::new(channel);
        Ok(channel)
    }
}
