//! Shared fakes for the tunnel integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_tunnel::codec::{FrameWriter, MessageCodec};
use tether_tunnel::pump::{self, PumpOptions, PumpOwner, SharedSocket};
use tether_tunnel::reconnect::OnReconnected;
use tether_tunnel::ssh::{
    CloseNotifier, ConnectionMonitor, RawDuplexStream, SessionProvider, SshSession,
};
use tether_tunnel::{
    AuthMethod, ChannelEvent, CloseInitiator, ConnectOptions, ConnectionState, Credentials,
    MessageConnection, ReconnectPolicy, Result, StateMachine, TunnelAddress, TunnelError,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A management-style request with nested structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Probe {
    Read {
        id: u64,
        object: String,
        attributes: Vec<String>,
    },
    Value {
        id: u64,
        values: BTreeMap<String, Option<f64>>,
        tags: Vec<String>,
    },
    Ping(u64),
}

pub fn address() -> TunnelAddress {
    TunnelAddress::new(
        "10.0.0.7",
        9010,
        "bastion",
        22,
        Credentials {
            username: "ops".into(),
            auth: AuthMethod::Password("secret".into()),
            host_key_fingerprint: None,
        },
    )
}

pub fn options(connect_timeout_ms: u64) -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_millis(connect_timeout_ms),
        ..ConnectOptions::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

// =========================================================================
// In-memory SSH provider
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// `open` never completes.
    Hang,
    /// `open` fails with a connect error.
    Refuse,
}

/// Session provider whose forwards are in-process pipes. The far end of each
/// forward is published on the receiver returned by [`WireProvider::new`].
pub struct WireProvider {
    mode: parking_lot::Mutex<Mode>,
    /// Route forwards through a pump pair so they carry byte counters.
    metered: bool,
    peers: mpsc::UnboundedSender<DuplexStream>,
    sessions: parking_lot::Mutex<Vec<Arc<WireSession>>>,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl WireProvider {
    pub fn new(mode: Mode) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::build(mode, false)
    }

    pub fn metered() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::build(Mode::Normal, true)
    }

    fn build(mode: Mode, metered: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            mode: parking_lot::Mutex::new(mode),
            metered,
            peers,
            sessions: parking_lot::Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
        });
        (provider, rx)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Drop every session opened so far.
    pub fn lose_all(&self, reason: &str) {
        let sessions: Vec<_> = self.sessions.lock().clone();
        for session in sessions {
            session.lose(reason);
        }
    }
}

#[async_trait]
impl SessionProvider for WireProvider {
    async fn open(&self, address: &TunnelAddress) -> Result<Arc<dyn SshSession>> {
        let mode = *self.mode.lock();
        match mode {
            Mode::Hang => std::future::pending::<()>().await,
            Mode::Refuse => {
                return Err(TunnelError::Connect(format!(
                    "{}:{} refused",
                    address.ssh_host(),
                    address.ssh_port()
                )));
            }
            Mode::Normal => {}
        }
        tokio::task::yield_now().await;
        self.opens.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(WireSession {
            peers: self.peers.clone(),
            metered: self.metered,
            releases: Arc::clone(&self.releases),
            monitors: parking_lot::Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));
        let session: Arc<dyn SshSession> = session;
        Ok(session)
    }
}

pub struct WireSession {
    peers: mpsc::UnboundedSender<DuplexStream>,
    metered: bool,
    releases: Arc<AtomicUsize>,
    monitors: parking_lot::Mutex<Vec<ConnectionMonitor>>,
    lost: AtomicBool,
}

impl WireSession {
    fn lose(&self, reason: &str) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitors: Vec<_> = self.monitors.lock().drain(..).collect();
        for monitor in monitors {
            monitor(Some(reason.to_string()));
        }
    }
}

#[async_trait]
impl SshSession for WireSession {
    async fn local_forward(&self, _host: &str, _port: u16) -> Result<RawDuplexStream> {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.peers
            .send(far)
            .map_err(|_| TunnelError::Connect("no peer listening".into()))?;
        let resource = Arc::new(CountingSocket(Arc::clone(&self.releases)));
        if !self.metered {
            let (source, sink) = tokio::io::split(near);
            return Ok(RawDuplexStream::new(
                Box::new(source),
                Box::new(sink),
                resource,
                CloseNotifier::new(),
            ));
        }

        let (app_side, pump_side) = tokio::io::duplex(PIPE_CAPACITY);
        let pair = pump::spawn_pair(
            tokio::io::split(pump_side),
            tokio::io::split(near),
            Arc::new(QuietOwner),
            Arc::new(QuietSocket),
            &PumpOptions::default(),
        );
        let (source, sink) = tokio::io::split(app_side);
        Ok(
            RawDuplexStream::new(Box::new(source), Box::new(sink), resource, CloseNotifier::new())
                .with_stats(pair.stats()),
        )
    }

    fn add_connection_monitor(&self, on_lost: ConnectionMonitor) {
        if self.lost.load(Ordering::SeqCst) {
            on_lost(Some("already lost".into()));
            return;
        }
        self.monitors.lock().push(on_lost);
    }

    async fn disconnect(&self, reason: &str) {
        self.lose(reason);
    }
}

struct QuietOwner;

#[async_trait]
impl PumpOwner for QuietOwner {
    async fn close_channel(&self, _reason: &str) -> io::Result<()> {
        Ok(())
    }
}

struct QuietSocket;

#[async_trait]
impl SharedSocket for QuietSocket {
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

struct CountingSocket(Arc<AtomicUsize>);

#[async_trait]
impl SharedSocket for CountingSocket {
    async fn close(&self) -> io::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Typed ends of the far side of a forward.
pub type PeerReader = FramedRead<ReadHalf<DuplexStream>, MessageCodec<Probe>>;
pub type PeerWriter = FrameWriter<WriteHalf<DuplexStream>, Probe>;

pub fn peer(stream: DuplexStream) -> (PeerReader, PeerWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        FramedRead::new(r, MessageCodec::default()),
        FrameWriter::new(w, MessageCodec::default()),
    )
}

/// Answer every forward with an echo service.
pub fn serve_echo(mut peers: mpsc::UnboundedReceiver<DuplexStream>) {
    tokio::spawn(async move {
        while let Some(stream) = peers.recv().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = peer(stream);
                while let Some(Ok(message)) = reader.next().await {
                    if writer.send(&message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

// =========================================================================
// Scripted delegate and manual policy
// =========================================================================

/// A delegate whose lifecycle is driven by the test.
pub struct Scripted {
    id: String,
    state: StateMachine,
    events: broadcast::Sender<ChannelEvent>,
    closes: AtomicUsize,
    written: parking_lot::Mutex<Vec<Probe>>,
}

impl Scripted {
    pub fn connected(id: &str) -> Arc<Self> {
        let scripted = Self {
            id: id.to_string(),
            state: StateMachine::new(),
            events: broadcast::channel(16).0,
            closes: AtomicUsize::new(0),
            written: parking_lot::Mutex::new(Vec::new()),
        };
        scripted.state.advance(ConnectionState::Connecting).unwrap();
        scripted.state.advance(ConnectionState::Connected).unwrap();
        Arc::new(scripted)
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.state.advance(ConnectionState::Failed);
        let _ = self.events.send(ChannelEvent::Failed {
            reason: reason.to_string(),
        });
    }

    pub fn peer_close(&self) {
        self.state.terminate();
        let _ = self.events.send(ChannelEvent::Closed {
            initiator: CloseInitiator::Peer,
        });
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Probe> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl MessageConnection<Probe> for Scripted {
    async fn connect(&self, _options: &ConnectOptions) -> Result<()> {
        Ok(())
    }

    async fn read_message(&self) -> Result<Probe> {
        Ok(Probe::Ping(0))
    }

    async fn write_message(&self, message: &Probe) -> Result<()> {
        self.written.lock().push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.terminate();
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> ConnectionState {
        self.state.current()
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

/// Records every scheduled reconnect and lets the test deliver delegates.
pub struct ManualPolicy {
    scheduled: watch::Sender<usize>,
    callbacks: parking_lot::Mutex<Vec<(TunnelAddress, OnReconnected<Probe>)>>,
}

impl ManualPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scheduled: watch::Sender::new(0),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn scheduled(&self) -> usize {
        *self.scheduled.borrow()
    }

    pub async fn wait_scheduled(&self, count: usize) {
        let mut rx = self.scheduled.subscribe();
        within(rx.wait_for(|n| *n >= count)).await.unwrap();
    }

    pub fn scheduled_for(&self) -> Vec<TunnelAddress> {
        self.callbacks.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    /// Complete the oldest outstanding reconnect with `fresh`.
    pub fn deliver(&self, fresh: Arc<dyn MessageConnection<Probe>>) {
        let (_, on_success) = self.callbacks.lock().remove(0);
        on_success(fresh);
    }
}

impl ReconnectPolicy<Probe> for ManualPolicy {
    fn schedule_reconnect(&self, address: TunnelAddress, on_success: OnReconnected<Probe>) {
        self.callbacks.lock().push((address, on_success));
        self.scheduled.send_modify(|n| *n += 1);
    }
}
