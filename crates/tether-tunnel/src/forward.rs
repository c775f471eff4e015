//! Lazily dialed SSH local forward.
//!
//! A [`PortForward`] opens its SSH session and forward the first time
//! [`PortForward::open`] is called and holds at most one live forward at a
//! time. Closing it tears the forward down best-effort and clears the slot.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::address::TunnelAddress;
use crate::error::{Result, TunnelError};
use crate::pump::{BoxedReader, BoxedWriter, PumpStats, PumpStatsSnapshot, SharedSocket};
use crate::ssh::{CloseNotifier, CloseSignal, SessionProvider, SshSession};
use crate::state::ConnectionState;

/// The two stream ends handed to the owner of a forward, plus its close signal.
pub struct ForwardStreams {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub closed: CloseSignal,
}

struct ActiveForward {
    session: Arc<dyn SshSession>,
    resource: Arc<dyn SharedSocket>,
    notifier: CloseNotifier,
    stats: Option<Arc<PumpStats>>,
}

pub struct PortForward {
    address: TunnelAddress,
    provider: Arc<dyn SessionProvider>,
    /// Serializes dials. Never held by `close`.
    dial: Mutex<()>,
    active: parking_lot::Mutex<Option<ActiveForward>>,
}

impl PortForward {
    pub fn new(address: TunnelAddress, provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            address,
            provider,
            dial: Mutex::new(()),
            active: parking_lot::Mutex::new(None),
        }
    }

    /// Dial the forward and hand out its streams.
    ///
    /// Concurrent callers serialize on the dial lock, so only one forward is
    /// ever dialed. The streams can be taken once per forward; a second call
    /// while the forward is live fails.
    pub async fn open(&self) -> Result<ForwardStreams> {
        let _dialing = self.dial.lock().await;
        if self.is_open() {
            return Err(TunnelError::IllegalState {
                op: "open forward",
                state: ConnectionState::Connected,
            });
        }

        debug!(address = %self.address, "dialing port forward");
        let session = self.provider.open(&self.address).await?;
        let raw = match session
            .local_forward(self.address.service_host(), self.address.service_port())
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                session.disconnect("local forward failed").await;
                return Err(e);
            }
        };

        let parts = raw.into_parts();
        let notifier = parts.notifier;
        let lost = notifier.clone();
        session.add_connection_monitor(Box::new(move |reason| {
            lost.notify(reason.unwrap_or_else(|| "SSH session lost".to_string()));
        }));

        let closed = notifier.subscribe();
        *self.active.lock() = Some(ActiveForward {
            session,
            resource: parts.resource,
            notifier,
            stats: parts.stats,
        });
        info!(address = %self.address, "port forward established");

        Ok(ForwardStreams {
            reader: parts.source,
            writer: parts.sink,
            closed,
        })
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Byte counters of the live forward, if it exposes any.
    pub fn stats(&self) -> Option<PumpStatsSnapshot> {
        self.active
            .lock()
            .as_ref()
            .and_then(|a| a.stats.as_ref())
            .map(|s| s.snapshot())
    }

    /// Tear down the live forward, if any. Errors are logged and dropped.
    ///
    /// A dial still in flight is not interrupted; its forward is left for
    /// the next `close`.
    pub async fn close(&self) {
        let Some(forward) = self.active.lock().take() else {
            return;
        };
        forward.notifier.notify("forward closed by owner");
        if let Err(e) = forward.resource.close().await {
            debug!(address = %self.address, error = %e, "forward release failed");
        }
        forward.session.disconnect("port forward closed").await;
        debug!(address = %self.address, "port forward closed");
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port forward to [{}]", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AuthMethod, Credentials};
    use crate::ssh::{ConnectionMonitor, RawDuplexStream};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opens: AtomicUsize,
        releases: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct LoopbackProvider {
        counters: Arc<Counters>,
        fail_forward: bool,
    }

    struct LoopbackSession {
        counters: Arc<Counters>,
        fail_forward: bool,
        monitors: parking_lot::Mutex<Vec<ConnectionMonitor>>,
    }

    struct Releasing(Arc<Counters>);

    #[async_trait]
    impl SharedSocket for Releasing {
        async fn close(&self) -> io::Result<()> {
            self.0.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SessionProvider for LoopbackProvider {
        async fn open(&self, _address: &TunnelAddress) -> Result<Arc<dyn SshSession>> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LoopbackSession {
                counters: Arc::clone(&self.counters),
                fail_forward: self.fail_forward,
                monitors: parking_lot::Mutex::new(Vec::new()),
            }))
        }
    }

    #[async_trait]
    impl SshSession for LoopbackSession {
        async fn local_forward(&self, host: &str, port: u16) -> Result<RawDuplexStream> {
            if self.fail_forward {
                return Err(TunnelError::Connect(format!("{host}:{port} refused")));
            }
            let (a, _b) = tokio::io::duplex(64);
            let (r, w) = tokio::io::split(a);
            Ok(RawDuplexStream::new(
                Box::new(r),
                Box::new(w),
                Arc::new(Releasing(Arc::clone(&self.counters))),
                CloseNotifier::new(),
            ))
        }

        fn add_connection_monitor(&self, on_lost: ConnectionMonitor) {
            self.monitors.lock().push(on_lost);
        }

        async fn disconnect(&self, _reason: &str) {
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
            for monitor in self.monitors.lock().drain(..) {
                monitor(Some("disconnected".into()));
            }
        }
    }

    fn forward(fail_forward: bool) -> (PortForward, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let provider = Arc::new(LoopbackProvider {
            counters: Arc::clone(&counters),
            fail_forward,
        });
        let address = TunnelAddress::new(
            "svc",
            9000,
            "ssh",
            22,
            Credentials {
                username: "ops".into(),
                auth: AuthMethod::Password("pw".into()),
                host_key_fingerprint: None,
            },
        );
        (PortForward::new(address, provider), counters)
    }

    #[tokio::test]
    async fn open_is_lazy_and_single() {
        let (fwd, counters) = forward(false);
        assert!(!fwd.is_open());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 0);

        let _streams = fwd.open().await.unwrap();
        assert!(fwd.is_open());
        assert!(matches!(
            fwd.open().await,
            Err(TunnelError::IllegalState { .. })
        ));
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_releases_once_and_clears() {
        let (fwd, counters) = forward(false);
        let mut streams = fwd.open().await.unwrap();

        fwd.close().await;
        fwd.close().await;

        assert!(!fwd.is_open());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(streams.closed.closed().await, "forward closed by owner");

        // A cleared slot dials afresh.
        let _again = fwd.open().await.unwrap();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_forward_disconnects_session() {
        let (fwd, counters) = forward(true);
        assert!(matches!(fwd.open().await, Err(TunnelError::Connect(_))));
        assert!(!fwd.is_open());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn display_names_the_tunnel() {
        let (fwd, _) = forward(false);
        assert_eq!(
            fwd.to_string(),
            "port forward to [tunnel://svc:9000 via ssh:22]"
        );
    }
}
