//! SSH session provider over russh.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tether_core::config::PumpSection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CloseNotifier, ConnectionMonitor, RawDuplexStream, SessionProvider, SshSession};
use crate::address::{AuthMethod, TunnelAddress};
use crate::error::{Result, TunnelError};
use crate::pump::{self, PumpOptions, PumpOwner, SharedSocket};

const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for [`RusshSessionProvider`].
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Consecutive missed keepalives before the session counts as lost.
    pub keepalive_max: u32,
    pub buffer_size: usize,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_max: 3,
            buffer_size: pump::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl From<&PumpSection> for SshClientConfig {
    fn from(section: &PumpSection) -> Self {
        Self {
            connect_timeout: Duration::from_secs(section.ssh_connect_timeout_secs),
            keepalive_interval: Duration::from_secs(section.keepalive_interval_secs),
            keepalive_max: section.keepalive_max.max(1),
            buffer_size: section.buffer_size,
        }
    }
}

/// SHA-256 fingerprint in OpenSSH's `SHA256:<base64>` form.
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Verifies the server key against an optional pinned fingerprint.
struct HostKeyCheck {
    host: String,
    port: u16,
    expected: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        let actual = fingerprint(server_public_key);
        match &self.expected {
            None => {
                debug!(
                    host = %self.host,
                    port = self.port,
                    fingerprint = %actual,
                    "accepting unpinned host key"
                );
                Ok(true)
            }
            Some(expected) if *expected == actual => Ok(true),
            Some(expected) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    expected = %expected,
                    actual = %actual,
                    "host key does not match pinned fingerprint"
                );
                Ok(false)
            }
        }
    }
}

pub struct RusshSessionProvider {
    config: SshClientConfig,
}

impl RusshSessionProvider {
    pub const fn new(config: SshClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionProvider for RusshSessionProvider {
    async fn open(&self, address: &TunnelAddress) -> Result<Arc<dyn SshSession>> {
        let creds = address.credentials();
        let ssh_config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        let handler = HostKeyCheck {
            host: address.ssh_host().to_string(),
            port: address.ssh_port(),
            expected: creds.host_key_fingerprint.clone(),
        };

        info!(
            ssh_host = %address.ssh_host(),
            ssh_port = address.ssh_port(),
            "connecting to SSH server"
        );
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(
                Arc::new(ssh_config),
                (address.ssh_host(), address.ssh_port()),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            TunnelError::Timeout(format!(
                "SSH connect to {}:{} after {:?}",
                address.ssh_host(),
                address.ssh_port(),
                self.config.connect_timeout
            ))
        })??;

        let auth = match &creds.auth {
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(&creds.username, password)
                    .await?
            }
            AuthMethod::KeyFile { path, passphrase } => {
                let key = russh::keys::load_secret_key(path, passphrase.as_deref())?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle.authenticate_publickey(&creds.username, key).await?
            }
        };
        if !auth.success() {
            return Err(TunnelError::Ssh(format!(
                "authentication rejected for {}",
                creds.username
            )));
        }
        info!(ssh_host = %address.ssh_host(), user = %creds.username, "SSH session established");

        let session = Arc::new(RusshSession {
            label: format!("{}@{}:{}", creds.username, address.ssh_host(), address.ssh_port()),
            handle: Mutex::new(handle),
            monitors: parking_lot::Mutex::new(Monitors::default()),
            shutdown: CancellationToken::new(),
            buffer_size: self.config.buffer_size,
        });
        tokio::spawn(keepalive_loop(
            Arc::downgrade(&session),
            self.config.keepalive_interval,
            self.config.keepalive_max,
            session.shutdown.clone(),
        ));
        Ok(session)
    }
}

#[derive(Default)]
struct Monitors {
    /// `Some` once the session is lost; holds the reason, if any.
    lost: Option<Option<String>>,
    pending: Vec<ConnectionMonitor>,
}

struct RusshSession {
    label: String,
    handle: Mutex<client::Handle<HostKeyCheck>>,
    monitors: parking_lot::Mutex<Monitors>,
    shutdown: CancellationToken,
    buffer_size: usize,
}

impl RusshSession {
    fn mark_lost(&self, reason: Option<String>) {
        let pending = {
            let mut monitors = self.monitors.lock();
            if monitors.lost.is_some() {
                return;
            }
            monitors.lost = Some(reason.clone());
            std::mem::take(&mut monitors.pending)
        };
        self.shutdown.cancel();
        info!(session = %self.label, reason = ?reason, "SSH session lost");
        for monitor in pending {
            monitor(reason.clone());
        }
    }
}

impl Drop for RusshSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl SshSession for RusshSession {
    async fn local_forward(&self, remote_host: &str, remote_port: u16) -> Result<RawDuplexStream> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Ssh(format!("session {} is closed", self.label)));
        }
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
                .await?
        };
        debug!(session = %self.label, remote_host, remote_port, "direct-tcpip channel opened");

        let remote = tokio::io::split(channel.into_stream());
        let (app_side, pump_side) = tokio::io::duplex(self.buffer_size);
        let notifier = CloseNotifier::new();
        let options = PumpOptions {
            buffer_size: self.buffer_size,
            abort: self.shutdown.child_token(),
        };
        let socket = Arc::new(ForwardSocket {
            label: format!("{remote_host}:{remote_port} via {}", self.label),
            abort: options.abort.clone(),
            released: AtomicBool::new(false),
        });
        let owner = Arc::new(ForwardOwner {
            notifier: notifier.clone(),
            abort: options.abort.clone(),
        });
        let pair = pump::spawn_pair(
            tokio::io::split(pump_side),
            remote,
            owner,
            Arc::clone(&socket) as Arc<dyn SharedSocket>,
            &options,
        );

        let (source, sink) = tokio::io::split(app_side);
        Ok(
            RawDuplexStream::new(Box::new(source), Box::new(sink), socket, notifier)
                .with_stats(pair.stats()),
        )
    }

    fn add_connection_monitor(&self, on_lost: ConnectionMonitor) {
        let already_lost = {
            let mut monitors = self.monitors.lock();
            match &monitors.lost {
                Some(reason) => Some(reason.clone()),
                None => {
                    monitors.pending.push(on_lost);
                    return;
                }
            }
        };
        if let Some(reason) = already_lost {
            on_lost(reason);
        }
    }

    async fn disconnect(&self, reason: &str) {
        if self.shutdown.is_cancelled() && self.monitors.lock().lost.is_some() {
            return;
        }
        self.shutdown.cancel();
        let result = self
            .handle
            .lock()
            .await
            .disconnect(russh::Disconnect::ByApplication, reason, "en")
            .await;
        if let Err(e) = result {
            debug!(session = %self.label, error = %e, "SSH disconnect failed");
        }
        self.mark_lost(Some(format!("disconnected: {reason}")));
    }
}

async fn keepalive_loop(
    session: Weak<RusshSession>,
    interval: Duration,
    max_missed: u32,
    shutdown: CancellationToken,
) {
    let mut missed: u32 = 0;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        let Some(session) = session.upgrade() else {
            return;
        };
        let reply = {
            let handle = session.handle.lock().await;
            tokio::time::timeout(KEEPALIVE_REPLY_TIMEOUT, handle.send_keepalive(true)).await
        };
        match reply {
            Ok(Ok(())) => {
                missed = 0;
                continue;
            }
            Ok(Err(e)) => warn!(session = %session.label, error = %e, "keepalive failed"),
            Err(_) => warn!(session = %session.label, "keepalive timed out"),
        }
        missed = missed.saturating_add(1);
        if missed >= max_missed {
            session.mark_lost(Some(format!("{missed} keepalives missed")));
            return;
        }
    }
}

/// Session side of one forward: a close request aborts both pumps and is
/// reported through the forward's notifier.
struct ForwardOwner {
    notifier: CloseNotifier,
    abort: CancellationToken,
}

#[async_trait]
impl PumpOwner for ForwardOwner {
    async fn close_channel(&self, reason: &str) -> io::Result<()> {
        if self.notifier.notify(reason) {
            debug!(reason, "forward channel closing");
        }
        self.abort.cancel();
        Ok(())
    }
}

/// Releasing the socket aborts any pump still running; later calls are no-ops.
struct ForwardSocket {
    label: String,
    abort: CancellationToken,
    released: AtomicBool,
}

#[async_trait]
impl SharedSocket for ForwardSocket {
    async fn close(&self) -> io::Result<()> {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.abort.cancel();
            debug!(forward = %self.label, "forward socket released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::client::Handler;

    const SERVER_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMew42gMax4gOEwG51ig/QqtB25UgkTOPAXYz3ruBh80";
    const SERVER_FINGERPRINT: &str = "SHA256:H1ntpUe22H5CL0DMdFB+TQW0/I1jmbXPkZd7Uo3wM34";
    const OTHER_FINGERPRINT: &str = "SHA256:YHg1Us0T7poE3U3ls7G88lbPaCpKKYBucn1bZGJBlLE";

    fn server_key() -> PublicKey {
        PublicKey::from_openssh(SERVER_KEY).unwrap()
    }

    fn check(expected: Option<&str>) -> HostKeyCheck {
        HostKeyCheck {
            host: "bastion".into(),
            port: 22,
            expected: expected.map(str::to_string),
        }
    }

    #[test]
    fn fingerprint_matches_openssh() {
        assert_eq!(fingerprint(&server_key()), SERVER_FINGERPRINT);
    }

    #[tokio::test]
    async fn pinned_host_key_is_accepted() {
        let mut check = check(Some(SERVER_FINGERPRINT));
        assert!(check.check_server_key(&server_key()).await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_host_key_is_rejected() {
        let mut check = check(Some(OTHER_FINGERPRINT));
        assert!(!check.check_server_key(&server_key()).await.unwrap());
    }

    #[tokio::test]
    async fn unpinned_host_key_is_accepted() {
        let mut check = check(None);
        assert!(check.check_server_key(&server_key()).await.unwrap());
    }

    #[test]
    fn config_from_pump_section() {
        let section = PumpSection {
            keepalive_max: 0,
            ..PumpSection::default()
        };
        let config = SshClientConfig::from(&section);
        assert_eq!(config.keepalive_max, 1);
        assert_eq!(config.buffer_size, 30_000);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn forward_socket_release_is_idempotent() {
        let socket = ForwardSocket {
            label: "svc:1 via ops@ssh:22".into(),
            abort: CancellationToken::new(),
            released: AtomicBool::new(false),
        };
        socket.close().await.unwrap();
        socket.close().await.unwrap();
        assert!(socket.abort.is_cancelled());
        assert!(socket.released.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn owner_close_keeps_first_reason() {
        let notifier = CloseNotifier::new();
        let owner = ForwardOwner {
            notifier: notifier.clone(),
            abort: CancellationToken::new(),
        };
        owner.close_channel("Closed due to exception").await.unwrap();
        owner.close_channel("cleaning up").await.unwrap();
        assert_eq!(
            notifier.subscribe().reason().as_deref(),
            Some("Closed due to exception")
        );
        assert!(owner.abort.is_cancelled());
    }
}
