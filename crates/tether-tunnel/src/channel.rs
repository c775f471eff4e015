//! Typed message channel over a tunneled byte stream.
//!
//! A [`MessageChannel`] is single-use: it connects once, carries framed
//! messages while `CONNECTED`, and is discarded after [`MessageChannel::close`].
//! Reads and writes are checked against the state machine first; a channel
//! that does not reach `CONNECTED` within the connect timeout is closed and
//! the call fails with [`TunnelError::IllegalState`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_core::config::ChannelSection;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::TunnelAddress;
use crate::codec::{DEFAULT_MAX_FRAME, FrameWriter, MessageCodec};
use crate::error::{Result, TunnelError};
use crate::forward::{ForwardStreams, PortForward};
use crate::pump::{BoxedReader, BoxedWriter, PumpStatsSnapshot};
use crate::ssh::{CloseSignal, SessionProvider};
use crate::state::{ConnectionState, StateMachine};

/// Option key for the connect timeout, in milliseconds.
pub const CONNECT_TIMEOUT_KEY: &str = "tether.client.connected.state.timeout";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Reported by [`MessageChannel::connection_id`] until the channel connects.
pub const UNCONNECTED_ID: &str = "Uninitialized tunnel connection";

const EVENT_CAPACITY: usize = 16;
/// How long `close` lets buffered bytes drain before dropping the writer.
const WRITER_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Anything that can travel over a channel.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bound on how long I/O waits for `CONNECTED`.
    pub connect_timeout: Duration,
    pub max_frame: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ConnectOptions {
    /// Read options from a string environment; unknown keys are ignored.
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(raw) = env.get(CONNECT_TIMEOUT_KEY) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                TunnelError::Config(format!(
                    "{CONNECT_TIMEOUT_KEY} must be milliseconds, got {raw:?}"
                ))
            })?;
            options.connect_timeout = Duration::from_millis(ms);
        }
        Ok(options)
    }
}

impl From<&ChannelSection> for ConnectOptions {
    fn from(section: &ChannelSection) -> Self {
        Self {
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            max_frame: section.max_frame_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// `close()` was called on the channel.
    Caller,
    /// The remote end finished the stream.
    Peer,
}

/// Lifecycle notifications, one per transition that matters to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { connection_id: String },
    Failed { reason: String },
    Closed { initiator: CloseInitiator },
}

enum Cause {
    Caller,
    Peer,
    Fault(String),
}

pub struct MessageChannel<M> {
    inner: Arc<ChannelInner<M>>,
}

impl<M> Clone for MessageChannel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ChannelInner<M> {
    address: TunnelAddress,
    forward: PortForward,
    state: StateMachine,
    connect_timeout: parking_lot::Mutex<Duration>,
    reader: Mutex<Option<FramedRead<BoxedReader, MessageCodec<M>>>>,
    writer: Mutex<Option<FrameWriter<BoxedWriter, M>>>,
    closing: CancellationToken,
    events: broadcast::Sender<ChannelEvent>,
    identity: String,
}

impl<M: Message> MessageChannel<M> {
    pub fn new(address: TunnelAddress, provider: Arc<dyn SessionProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                forward: PortForward::new(address.clone(), provider),
                address,
                state: StateMachine::new(),
                connect_timeout: parking_lot::Mutex::new(DEFAULT_CONNECT_TIMEOUT),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                closing: CancellationToken::new(),
                events,
                identity: format!("pid {} {}", std::process::id(), Uuid::new_v4()),
            }),
        }
    }

    pub fn address(&self) -> &TunnelAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn forward_stats(&self) -> Option<PumpStatsSnapshot> {
        self.inner.forward.stats()
    }

    /// Dial the tunnel and switch to `CONNECTED`.
    ///
    /// The dial and any concurrent caller's wait are both bounded by the
    /// connect timeout; a dial that overruns it fails the channel. Connecting
    /// an already connected channel is a no-op.
    pub async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        *self.inner.connect_timeout.lock() = options.connect_timeout;
        match self.inner.state.advance(ConnectionState::Connecting) {
            Ok(_) => self.establish(options).await,
            Err(ConnectionState::Connected) => Ok(()),
            Err(ConnectionState::Connecting) => self.await_concurrent_connect(options).await,
            Err(state) => Err(TunnelError::IllegalState {
                op: "connect",
                state,
            }),
        }
    }

    async fn await_concurrent_connect(&self, options: &ConnectOptions) -> Result<()> {
        use ConnectionState::{Connected, Failed, Terminated};
        match self
            .inner
            .state
            .wait_for_state(options.connect_timeout, Connected | Failed | Terminated)
            .await
        {
            Connected => Ok(()),
            Failed => Err(TunnelError::Connect(format!(
                "concurrent connect to {} failed",
                self.inner.address
            ))),
            ConnectionState::Connecting => Err(TunnelError::Timeout(format!(
                "connect to {} still in progress after {:?}",
                self.inner.address, options.connect_timeout
            ))),
            state => Err(TunnelError::IllegalState {
                op: "connect",
                state,
            }),
        }
    }

    async fn establish(&self, options: &ConnectOptions) -> Result<()> {
        let opened = tokio::time::timeout(options.connect_timeout, self.inner.forward.open()).await;
        let ForwardStreams {
            reader,
            writer,
            closed,
        } = match opened {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                warn!(address = %self.inner.address, error = %e, "tunnel setup failed");
                self.inner.fault(format!("tunnel setup failed: {e}")).await;
                return Err(e);
            }
            Err(_) => {
                let timeout = options.connect_timeout;
                warn!(
                    address = %self.inner.address,
                    timeout_ms = timeout.as_millis(),
                    "tunnel setup timed out"
                );
                self.inner
                    .fault(format!("tunnel setup exceeded {timeout:?}"))
                    .await;
                return Err(TunnelError::Timeout(format!(
                    "connect to {} after {timeout:?}",
                    self.inner.address
                )));
            }
        };

        *self.inner.reader.lock().await =
            Some(FramedRead::new(reader, MessageCodec::new(options.max_frame)));
        *self.inner.writer.lock().await =
            Some(FrameWriter::new(writer, MessageCodec::new(options.max_frame)));

        if let Err(state) = self.inner.state.advance(ConnectionState::Connected) {
            debug!(address = %self.inner.address, %state, "channel closed while connecting");
            self.inner.release().await;
            return Err(TunnelError::IllegalState {
                op: "connect",
                state,
            });
        }

        let connection_id = self.connection_id();
        info!(connection_id = %connection_id, "message channel connected");
        let _ = self.inner.events.send(ChannelEvent::Connected { connection_id });
        watch_for_loss(Arc::downgrade(&self.inner), closed);
        Ok(())
    }

    /// Gate for every read and write.
    async fn check_state(&self, op: &'static str) -> Result<()> {
        use ConnectionState::{Connected, Failed, Terminated};
        match self.inner.state.current() {
            Connected => return Ok(()),
            Terminated => return Err(TunnelError::IllegalState { op, state: Terminated }),
            // FAILED can never become CONNECTED; skip the wait.
            Failed => {
                self.inner.shut(Cause::Caller).await;
                return Err(TunnelError::IllegalState { op, state: Failed });
            }
            ConnectionState::Unconnected | ConnectionState::Connecting => {}
        }

        let timeout = *self.inner.connect_timeout.lock();
        let observed = self
            .inner
            .state
            .wait_for_state(timeout, Connected | Failed | Terminated)
            .await;
        match observed {
            Connected => return Ok(()),
            Failed | Terminated => {
                self.inner.shut(Cause::Caller).await;
                return Err(TunnelError::IllegalState { op, state: observed });
            }
            ConnectionState::Unconnected | ConnectionState::Connecting => {}
        }
        warn!(
            address = %self.inner.address,
            op,
            state = %observed,
            timeout_ms = timeout.as_millis(),
            "channel not connected in time"
        );
        self.inner
            .shut(Cause::Fault(format!("not connected within {timeout:?}")))
            .await;
        Err(TunnelError::IllegalState { op, state: observed })
    }

    /// Read one message.
    ///
    /// A clean end of stream closes the channel and yields
    /// [`TunnelError::ChannelClosed`]; I/O and decode errors fail it.
    pub async fn read_message(&self) -> Result<M> {
        self.check_state("read").await?;
        let next = {
            let mut guard = self.inner.reader.lock().await;
            let framed = guard.as_mut().ok_or(TunnelError::ChannelClosed)?;
            tokio::select! {
                biased;
                () = self.inner.closing.cancelled() => return Err(TunnelError::ChannelClosed),
                next = framed.next() => next,
            }
        };
        match next {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                self.inner.fault(format!("read failed: {e}")).await;
                Err(e)
            }
            None => {
                debug!(address = %self.inner.address, "peer closed the channel");
                self.inner.shut(Cause::Peer).await;
                Err(TunnelError::ChannelClosed)
            }
        }
    }

    /// Write and flush one message.
    pub async fn write_message(&self, message: &M) -> Result<()> {
        self.check_state("write").await?;
        let outcome = {
            let mut guard = self.inner.writer.lock().await;
            let writer = guard.as_mut().ok_or(TunnelError::ChannelClosed)?;
            tokio::select! {
                biased;
                () = self.inner.closing.cancelled() => return Err(TunnelError::ChannelClosed),
                sent = writer.send(message) => sent,
            }
        };
        if let Err(TunnelError::Io(e)) = &outcome {
            self.inner.fault(format!("write failed: {e}")).await;
        }
        outcome
    }

    /// Idempotent and safe to call concurrently with I/O or another close.
    pub async fn close(&self) {
        self.inner.shut(Cause::Caller).await;
    }

    /// Descriptive id while `CONNECTED`, [`UNCONNECTED_ID`] otherwise.
    pub fn connection_id(&self) -> String {
        if self.inner.state.current() == ConnectionState::Connected {
            format!("{} {}", self.inner.address, self.inner.identity)
        } else {
            UNCONNECTED_ID.to_string()
        }
    }
}

impl<M: Message> ChannelInner<M> {
    /// Record a transport failure: `FAILED`, one event, resources released.
    async fn fault(&self, reason: String) {
        match self.state.advance(ConnectionState::Failed) {
            Ok(previous) => {
                warn!(
                    address = %self.address,
                    from = %previous,
                    reason = %reason,
                    "channel failed"
                );
                let _ = self.events.send(ChannelEvent::Failed { reason });
            }
            Err(state) => debug!(
                address = %self.address,
                %state,
                reason = %reason,
                "fault after channel ended"
            ),
        }
        self.release().await;
    }

    /// Force `TERMINATED` and release everything.
    async fn shut(&self, cause: Cause) {
        let previous = self.state.terminate();
        self.release().await;
        if previous == ConnectionState::Terminated {
            return;
        }
        let event = match cause {
            Cause::Caller => ChannelEvent::Closed {
                initiator: CloseInitiator::Caller,
            },
            Cause::Peer => ChannelEvent::Closed {
                initiator: CloseInitiator::Peer,
            },
            Cause::Fault(_) if previous == ConnectionState::Failed => return,
            Cause::Fault(reason) => ChannelEvent::Failed { reason },
        };
        let _ = self.events.send(event);
    }

    /// Unblock in-flight I/O, drop the stream ends, then close the forward.
    ///
    /// A peer that stopped reading gets [`WRITER_DRAIN_GRACE`] to take any
    /// buffered bytes; after that the writer is dropped unflushed.
    async fn release(&self) {
        self.closing.cancel();
        self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(WRITER_DRAIN_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(address = %self.address, error = %e, "writer shutdown failed"),
                Err(_) => debug!(address = %self.address, "peer not draining, dropping writer"),
            }
        }
        self.forward.close().await;
    }
}

impl<M> Drop for ChannelInner<M> {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

/// Fail the channel when the forward underneath it reports closed.
fn watch_for_loss<M: Message>(inner: Weak<ChannelInner<M>>, mut closed: CloseSignal) {
    let Some(closing) = inner.upgrade().map(|i| i.closing.clone()) else {
        return;
    };
    tokio::spawn(async move {
        let reason = tokio::select! {
            () = closing.cancelled() => return,
            reason = closed.closed() => reason,
        };
        if let Some(inner) = inner.upgrade() {
            if inner.state.current() == ConnectionState::Connected {
                inner.fault(format!("tunnel lost: {reason}")).await;
            }
        }
    });
}
