//! Paired unidirectional byte pumps over one shared socket.
//!
//! Each [`ForwarderTask`] copies bytes from its source to its sink until EOF,
//! an I/O error, or an abort. Both tasks of a pair hold the same
//! [`SharedSocket`]; only the second task to finish releases it, and it does
//! so after both tasks have closed their own streams. The pair never reports
//! errors to its caller: failures are logged, counted, and forwarded to the
//! [`PumpOwner`] as a close request.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Matches the SSH channel window chunk the pumps were tuned for.
pub const DEFAULT_BUFFER_SIZE: usize = 30_000;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalToRemote => "local->remote",
            Self::RemoteToLocal => "remote->local",
        })
    }
}

/// The session a pump pair belongs to.
#[async_trait]
pub trait PumpOwner: Send + Sync {
    /// Ask the session to close the forwarded channel. May be called more
    /// than once per pair; errors are ignored by the caller.
    async fn close_channel(&self, reason: &str) -> io::Result<()>;
}

/// The resource both pumps of a pair share.
#[async_trait]
pub trait SharedSocket: Send + Sync {
    async fn close(&self) -> io::Result<()>;
}

/// Byte and error counters for one pump pair.
#[derive(Debug, Default)]
pub struct PumpStats {
    local_to_remote: AtomicU64,
    remote_to_local: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStatsSnapshot {
    pub bytes_local_to_remote: u64,
    pub bytes_remote_to_local: u64,
    pub errors: u64,
}

impl PumpStats {
    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::LocalToRemote => &self.local_to_remote,
            Direction::RemoteToLocal => &self.remote_to_local,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            bytes_local_to_remote: self.local_to_remote.load(Ordering::Relaxed),
            bytes_remote_to_local: self.remote_to_local.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PumpOptions {
    pub buffer_size: usize,
    /// Cancelling this stops both pumps as if their reads had failed.
    pub abort: CancellationToken,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            abort: CancellationToken::new(),
        }
    }
}

/// Link from one task to the other half of its pair.
struct Sibling {
    terminated: watch::Receiver<bool>,
    /// Number of pair members that have finished their own streams.
    finished: Arc<AtomicU8>,
}

/// One direction of a forward.
pub struct ForwarderTask<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    owner: Arc<dyn PumpOwner>,
    socket: Arc<dyn SharedSocket>,
    sibling: Option<Sibling>,
    terminated: watch::Sender<bool>,
    buffer: Vec<u8>,
    stats: Arc<PumpStats>,
    abort: CancellationToken,
}

impl<R, W> ForwarderTask<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// A task with no sibling. It releases the socket itself when it stops.
    pub fn new(
        direction: Direction,
        source: R,
        sink: W,
        owner: Arc<dyn PumpOwner>,
        socket: Arc<dyn SharedSocket>,
        options: &PumpOptions,
    ) -> Self {
        Self {
            direction,
            source,
            sink,
            owner,
            socket,
            sibling: None,
            terminated: watch::Sender::new(false),
            buffer: vec![0; options.buffer_size.max(1)],
            stats: Arc::new(PumpStats::default()),
            abort: options.abort.clone(),
        }
    }

    /// Observe this task's terminated flag.
    pub fn watch_terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    /// Copy until EOF, error, or abort; then run the shutdown protocol.
    pub async fn run(self) {
        let Self {
            direction,
            mut source,
            mut sink,
            owner,
            socket,
            sibling,
            terminated,
            mut buffer,
            stats,
            abort,
        } = self;
        debug!(%direction, "forwarder started");

        let outcome = copy_until_done(
            direction,
            &mut source,
            &mut sink,
            &mut buffer,
            &stats,
            &abort,
        )
        .await;

        match outcome {
            Ok(()) => debug!(%direction, "forwarder reached end of stream"),
            Err(e) => {
                stats.record_error();
                warn!(%direction, error = %e, "forwarder stopped on I/O error");
                let reason = format!("Closed due to exception in forwarder ({direction}): {e}");
                if let Err(close_err) = owner.close_channel(&reason).await {
                    debug!(%direction, error = %close_err, "owner close request failed");
                }
            }
        }

        if let Err(e) = sink.shutdown().await {
            trace!(%direction, error = %e, "sink shutdown failed");
        }
        drop(sink);
        drop(source);
        terminated.send_replace(true);

        let Some(mut sibling) = sibling else {
            release(direction, owner.as_ref(), socket.as_ref()).await;
            return;
        };

        if sibling.finished.fetch_add(1, Ordering::AcqRel) == 0 {
            trace!(%direction, "waiting for sibling to terminate");
            // An Err means the sibling task was dropped, which also ends it.
            let _ = sibling.terminated.wait_for(|done| *done).await;
            return;
        }
        release(direction, owner.as_ref(), socket.as_ref()).await;
    }
}

async fn copy_until_done<R, W>(
    direction: Direction,
    source: &mut R,
    sink: &mut W,
    buffer: &mut [u8],
    stats: &PumpStats,
    abort: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(aborted()),
            read = source.read(buffer) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = abort.cancelled() => return Err(aborted()),
            written = async {
                sink.write_all(&buffer[..n]).await?;
                sink.flush().await
            } => written?,
        }
        stats.record(direction, n);
        trace!(%direction, bytes = n, "forwarded");
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "forward aborted")
}

/// Final phase, run by exactly one task per pair.
async fn release(direction: Direction, owner: &dyn PumpOwner, socket: &dyn SharedSocket) {
    let reason = format!("Forwarder ({direction}) is cleaning up the connection");
    if let Err(e) = owner.close_channel(&reason).await {
        debug!(%direction, error = %e, "owner cleanup notification failed");
    }
    if let Err(e) = socket.close().await {
        debug!(%direction, error = %e, "shared socket close failed");
    }
    debug!(%direction, "forward released");
}

/// A running pair of forwarders.
pub struct PumpPair {
    local_to_remote: JoinHandle<()>,
    remote_to_local: JoinHandle<()>,
    terminated: [watch::Receiver<bool>; 2],
    stats: Arc<PumpStats>,
}

impl PumpPair {
    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.local_to_remote.is_finished() && self.remote_to_local.is_finished()
    }

    pub fn watch_terminated(&self, direction: Direction) -> watch::Receiver<bool> {
        match direction {
            Direction::LocalToRemote => self.terminated[0].clone(),
            Direction::RemoteToLocal => self.terminated[1].clone(),
        }
    }

    /// Wait for both tasks to exit.
    pub async fn join(self) {
        for (direction, handle) in [
            (Direction::LocalToRemote, self.local_to_remote),
            (Direction::RemoteToLocal, self.remote_to_local),
        ] {
            if let Err(e) = handle.await {
                warn!(%direction, error = %e, "forwarder task panicked");
            }
        }
    }
}

/// Spawn both directions of a forward on the current tokio runtime.
///
/// `local` is the in-process side, `remote` the tunneled side.
pub fn spawn_pair<LR, LW, RR, RW>(
    local: (LR, LW),
    remote: (RR, RW),
    owner: Arc<dyn PumpOwner>,
    socket: Arc<dyn SharedSocket>,
    options: &PumpOptions,
) -> PumpPair
where
    LR: AsyncRead + Send + Unpin + 'static,
    LW: AsyncWrite + Send + Unpin + 'static,
    RR: AsyncRead + Send + Unpin + 'static,
    RW: AsyncWrite + Send + Unpin + 'static,
{
    let (local_reader, local_writer) = local;
    let (remote_reader, remote_writer) = remote;

    let mut outbound = ForwarderTask::new(
        Direction::LocalToRemote,
        local_reader,
        remote_writer,
        Arc::clone(&owner),
        Arc::clone(&socket),
        options,
    );
    let mut inbound = ForwarderTask::new(
        Direction::RemoteToLocal,
        remote_reader,
        local_writer,
        owner,
        socket,
        options,
    );

    let stats = Arc::new(PumpStats::default());
    outbound.stats = Arc::clone(&stats);
    inbound.stats = Arc::clone(&stats);

    let finished = Arc::new(AtomicU8::new(0));
    let outbound_flag = outbound.watch_terminated();
    let inbound_flag = inbound.watch_terminated();
    outbound.sibling = Some(Sibling {
        terminated: inbound_flag.clone(),
        finished: Arc::clone(&finished),
    });
    inbound.sibling = Some(Sibling {
        terminated: outbound_flag.clone(),
        finished,
    });

    PumpPair {
        local_to_remote: tokio::spawn(outbound.run()),
        remote_to_local: tokio::spawn(inbound.run()),
        terminated: [outbound_flag, inbound_flag],
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct CountingSocket {
        closes: AtomicUsize,
        flags: parking_lot::Mutex<Vec<watch::Receiver<bool>>>,
        closed_after_both: AtomicUsize,
    }

    #[async_trait]
    impl SharedSocket for CountingSocket {
        async fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            let flags = self.flags.lock();
            if !flags.is_empty() && flags.iter().all(|f| *f.borrow()) {
                self.closed_after_both.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingOwner {
        reasons: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PumpOwner for RecordingOwner {
        async fn close_channel(&self, reason: &str) -> io::Result<()> {
            self.reasons.lock().push(reason.to_string());
            Err(io::Error::other("owner refuses"))
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    struct Harness {
        local_peer: (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
        remote_peer: (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
        pair: PumpPair,
        socket: Arc<CountingSocket>,
        owner: Arc<RecordingOwner>,
    }

    fn harness(options: &PumpOptions) -> Harness {
        let (local_peer, local_pump) = tokio::io::duplex(256);
        let (remote_peer, remote_pump) = tokio::io::duplex(256);
        let socket = Arc::new(CountingSocket::default());
        let owner = Arc::new(RecordingOwner::default());
        let pair = spawn_pair(
            tokio::io::split(local_pump),
            tokio::io::split(remote_pump),
            Arc::clone(&owner) as Arc<dyn PumpOwner>,
            Arc::clone(&socket) as Arc<dyn SharedSocket>,
            options,
        );
        socket.flags.lock().extend([
            pair.watch_terminated(Direction::LocalToRemote),
            pair.watch_terminated(Direction::RemoteToLocal),
        ]);
        Harness {
            local_peer: tokio::io::split(local_peer),
            remote_peer: tokio::io::split(remote_peer),
            pair,
            socket,
            owner,
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_are_counted() {
        let mut h = harness(&PumpOptions::default());

        h.local_peer.1.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        h.remote_peer.0.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        h.remote_peer.1.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        h.local_peer.0.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        let stats = h.pair.stats().snapshot();
        assert_eq!(stats.bytes_local_to_remote, 4);
        assert_eq!(stats.bytes_remote_to_local, 5);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn first_eof_waits_for_sibling_before_socket_close() {
        let mut h = harness(&PumpOptions::default());
        let mut outbound_done = h.pair.watch_terminated(Direction::LocalToRemote);

        // A (local->remote) sees EOF first.
        h.local_peer.1.shutdown().await.unwrap();
        outbound_done.wait_for(|d| *d).await.unwrap();

        // A closed its sink, so the remote peer sees EOF too.
        let mut rest = Vec::new();
        h.remote_peer.0.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.socket.closes.load(Ordering::SeqCst), 0);
        assert!(!h.pair.is_finished());

        // Then B (remote->local) reaches EOF.
        h.remote_peer.1.shutdown().await.unwrap();
        h.pair.join().await;

        assert_eq!(h.socket.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.socket.closed_after_both.load(Ordering::SeqCst), 1);
        let reasons = h.owner.reasons.lock();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("cleaning up"));
    }

    #[tokio::test]
    async fn abort_stops_both_directions_with_one_close() {
        let options = PumpOptions::default();
        let h = harness(&options);
        options.abort.cancel();
        h.pair.join().await;

        assert_eq!(h.socket.closes.load(Ordering::SeqCst), 1);
        let reasons = h.owner.reasons.lock();
        // Two exception reports plus one cleanup notice.
        assert_eq!(reasons.len(), 3);
        assert_eq!(
            reasons.iter().filter(|r| r.contains("exception")).count(),
            2
        );
    }

    #[tokio::test]
    async fn concurrent_failures_close_socket_exactly_once() {
        for _ in 0..50 {
            let socket = Arc::new(CountingSocket::default());
            let owner: Arc<dyn PumpOwner> = Arc::new(RecordingOwner::default());
            let pair = spawn_pair(
                (FailingReader, tokio::io::sink()),
                (FailingReader, tokio::io::sink()),
                owner,
                Arc::clone(&socket) as Arc<dyn SharedSocket>,
                &PumpOptions::default(),
            );
            let stats = pair.stats();
            pair.join().await;
            assert_eq!(socket.closes.load(Ordering::SeqCst), 1);
            assert_eq!(stats.snapshot().errors, 2);
        }
    }

    #[tokio::test]
    async fn solo_task_releases_socket_itself() {
        let socket = Arc::new(CountingSocket::default());
        let owner: Arc<dyn PumpOwner> = Arc::new(RecordingOwner::default());
        let task = ForwarderTask::new(
            Direction::RemoteToLocal,
            tokio::io::empty(),
            tokio::io::sink(),
            owner,
            Arc::clone(&socket) as Arc<dyn SharedSocket>,
            &PumpOptions::default(),
        );
        let flag = task.watch_terminated();
        task.run().await;
        assert!(*flag.borrow());
        assert_eq!(socket.closes.load(Ordering::SeqCst), 1);
    }
}
