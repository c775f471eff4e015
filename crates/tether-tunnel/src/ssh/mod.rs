//! SSH session provider contract.
//!
//! The transport only needs three things from SSH: open a session for a
//! [`TunnelAddress`], open a local forward through it, and learn when the
//! session dies. [`client::RusshSessionProvider`] implements this over russh;
//! tests substitute in-memory providers.

pub mod client;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::address::TunnelAddress;
use crate::error::Result;
use crate::pump::{BoxedReader, BoxedWriter, PumpStats, SharedSocket};

pub use client::{RusshSessionProvider, SshClientConfig, fingerprint};

/// Invoked once when a session is lost, with a reason when one is known.
pub type ConnectionMonitor = Box<dyn FnOnce(Option<String>) + Send>;

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self, address: &TunnelAddress) -> Result<Arc<dyn SshSession>>;
}

#[async_trait]
pub trait SshSession: Send + Sync {
    /// Dial `remote_host:remote_port` from the SSH server and return the
    /// in-process end of the forward.
    async fn local_forward(&self, remote_host: &str, remote_port: u16) -> Result<RawDuplexStream>;

    /// Register a callback fired when the session is lost. Fires immediately
    /// if the session is already gone.
    fn add_connection_monitor(&self, on_lost: ConnectionMonitor);

    /// Tear the session down. Idempotent.
    async fn disconnect(&self, reason: &str);
}

/// Sender half of a forward's close notification. The first reason wins.
#[derive(Clone)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Record `reason` unless a reason is already recorded. Returns whether
    /// this call was the one that recorded it.
    pub fn notify(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Receiver half of a forward's close notification.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<String>>,
}

impl CloseSignal {
    /// Wait until the forward is reported closed and return the reason.
    pub async fn closed(&mut self) -> String {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "close notifier dropped".to_string(),
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }
}

/// The in-process end of a port forward: a byte source, a byte sink, and the
/// resource that owns them.
pub struct RawDuplexStream {
    source: BoxedReader,
    sink: BoxedWriter,
    resource: Arc<dyn SharedSocket>,
    notifier: CloseNotifier,
    stats: Option<Arc<PumpStats>>,
}

impl RawDuplexStream {
    pub fn new(
        source: BoxedReader,
        sink: BoxedWriter,
        resource: Arc<dyn SharedSocket>,
        notifier: CloseNotifier,
    ) -> Self {
        Self {
            source,
            sink,
            resource,
            notifier,
            stats: None,
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<PumpStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn into_parts(self) -> RawDuplexParts {
        RawDuplexParts {
            source: self.source,
            sink: self.sink,
            resource: self.resource,
            notifier: self.notifier,
            stats: self.stats,
        }
    }
}

impl fmt::Debug for RawDuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDuplexStream")
            .field("closed", &self.notifier.is_closed())
            .finish_non_exhaustive()
    }
}

/// A [`RawDuplexStream`] taken apart.
pub struct RawDuplexParts {
    pub source: BoxedReader,
    pub sink: BoxedWriter,
    pub resource: Arc<dyn SharedSocket>,
    pub notifier: CloseNotifier,
    pub stats: Option<Arc<PumpStats>>,
}
