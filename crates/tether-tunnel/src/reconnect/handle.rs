use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{ChannelFactory, MessageConnection, ReconnectPolicy};
use crate::address::TunnelAddress;
use crate::channel::{ChannelEvent, CloseInitiator, ConnectOptions, Message};
use crate::error::Result;
use crate::state::{ConnectionState, StateSet};

const SWAP_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    /// Treat a clean close by the peer as a failure and reconnect.
    pub reconnect_on_close: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            reconnect_on_close: true,
        }
    }
}

/// Published after each delegate replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEvent {
    /// Number of swaps so far, starting at 1.
    pub generation: u64,
    pub connection_id: String,
}

/// Long-lived connection whose delegate is replaced after failures.
///
/// Clones share the same slot. No call captures a delegate beyond its own
/// duration, so a clone taken before a swap talks to the new delegate after.
pub struct ReconnectingHandle<M> {
    inner: Arc<HandleInner<M>>,
}

impl<M> Clone for ReconnectingHandle<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HandleInner<M> {
    address: TunnelAddress,
    /// Locked only to clone or replace the `Arc`.
    current: RwLock<Arc<dyn MessageConnection<M>>>,
    policy: Arc<dyn ReconnectPolicy<M>>,
    options: HandleOptions,
    generation: AtomicU64,
    pending: AtomicBool,
    closed: AtomicBool,
    swaps: broadcast::Sender<SwapEvent>,
}

impl<M: Message> ReconnectingHandle<M> {
    pub fn new(
        address: TunnelAddress,
        initial: Arc<dyn MessageConnection<M>>,
        policy: Arc<dyn ReconnectPolicy<M>>,
        options: HandleOptions,
    ) -> Self {
        let (swaps, _) = broadcast::channel(SWAP_CAPACITY);
        let inner = Arc::new(HandleInner {
            address,
            current: RwLock::new(Arc::clone(&initial)),
            policy,
            options,
            generation: AtomicU64::new(0),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            swaps,
        });
        watch_delegate(&inner, &initial, 0);
        Self { inner }
    }

    /// Build the first delegate with `factory`, then wrap it.
    pub async fn establish(
        address: TunnelAddress,
        factory: &dyn ChannelFactory<M>,
        policy: Arc<dyn ReconnectPolicy<M>>,
        options: HandleOptions,
    ) -> Result<Self> {
        let initial = factory.build(&address).await?;
        Ok(Self::new(address, initial, policy, options))
    }

    /// Stable across every swap.
    pub fn address(&self) -> &TunnelAddress {
        &self.inner.address
    }

    /// The delegate in the slot right now.
    pub fn current(&self) -> Arc<dyn MessageConnection<M>> {
        Arc::clone(&self.inner.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscribe_swaps(&self) -> broadcast::Receiver<SwapEvent> {
        self.inner.swaps.subscribe()
    }

    pub async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        self.current().connect(options).await
    }

    pub async fn read_message(&self) -> Result<M> {
        self.current().read_message().await
    }

    pub async fn write_message(&self, message: &M) -> Result<()> {
        self.current().write_message(message).await
    }

    pub fn connection_id(&self) -> String {
        self.current().connection_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.current().state()
    }

    /// Stop reconnecting and close the current delegate. Idempotent.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(address = %self.inner.address, "reconnecting handle closed");
        }
        self.current().close().await;
    }
}

/// Listen for the delegate installed at `generation` going down.
fn watch_delegate<M: Message>(
    inner: &Arc<HandleInner<M>>,
    delegate: &Arc<dyn MessageConnection<M>>,
    generation: u64,
) {
    // Subscribe before sampling the state so a failure in between is seen
    // by one of the two.
    let mut events = delegate.events();
    let already_down = delegate.state().is_in(StateSet::TERMINAL);
    let reconnect_on_close = inner.options.reconnect_on_close;
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        if already_down {
            trigger(&weak, generation, "delegate was already down".to_string());
            return;
        }
        loop {
            let reason = match events.recv().await {
                Ok(ChannelEvent::Failed { reason }) => reason,
                Ok(ChannelEvent::Closed {
                    initiator: CloseInitiator::Peer,
                }) if reconnect_on_close => "peer closed the channel".to_string(),
                Ok(ChannelEvent::Closed { .. }) | Err(RecvError::Closed) => return,
                Ok(ChannelEvent::Connected { .. }) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "delegate event stream lagged");
                    continue;
                }
            };
            trigger(&weak, generation, reason);
            return;
        }
    });
}

/// Hand the address to the policy unless the signal is stale or redundant.
fn trigger<M: Message>(weak: &Weak<HandleInner<M>>, generation: u64, reason: String) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.closed.load(Ordering::Acquire) {
        return;
    }
    if inner.generation.load(Ordering::Acquire) != generation {
        debug!(address = %inner.address, generation, "ignoring failure of superseded delegate");
        return;
    }
    if inner.pending.swap(true, Ordering::AcqRel) {
        debug!(address = %inner.address, "reconnect already pending");
        return;
    }

    warn!(
        address = %inner.address,
        generation,
        reason = %reason,
        "delegate lost, scheduling reconnect"
    );
    let install_into = Arc::downgrade(&inner);
    inner.policy.schedule_reconnect(
        inner.address.clone(),
        Box::new(move |fresh| install(&install_into, fresh)),
    );
}

fn install<M: Message>(weak: &Weak<HandleInner<M>>, fresh: Arc<dyn MessageConnection<M>>) {
    let Some(inner) = weak.upgrade() else {
        close_detached(fresh);
        return;
    };
    if inner.closed.load(Ordering::Acquire) {
        close_detached(fresh);
        return;
    }

    let previous = std::mem::replace(&mut *inner.current.write(), Arc::clone(&fresh));
    let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
    inner.pending.store(false, Ordering::Release);
    watch_delegate(&inner, &fresh, generation);

    let connection_id = fresh.connection_id();
    info!(
        address = %inner.address,
        generation,
        connection_id = %connection_id,
        "delegate replaced"
    );
    let _ = inner.swaps.send(SwapEvent {
        generation,
        connection_id,
    });
    close_detached(previous);

    // close() may have run between the check above and the swap.
    if inner.closed.load(Ordering::Acquire) {
        close_detached(fresh);
    }
}

fn close_detached<M: Message>(delegate: Arc<dyn MessageConnection<M>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { delegate.close().await });
        }
        Err(_) => warn!("no runtime available; dropping delegate without closing it"),
    }
}
