//! Exponential-backoff reconnection policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tether_core::config::ReconnectSection;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChannelFactory, MessageConnection, OnReconnected, ReconnectPolicy};
use crate::address::TunnelAddress;
use crate::channel::Message;

const EVENT_CAPACITY: usize = 64;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSection> for BackoffPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            multiplier: section.multiplier,
            max_attempts: section.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Lifecycle of scheduled reconnects, for observers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Registered { address: String },
    AttemptFailed { address: String, attempt: u32, error: String },
    Reconnected { address: String, attempts: u32 },
    GaveUp { address: String, attempts: u32 },
}

/// Retries each scheduled address on its own task until the factory builds
/// a delegate, the attempt limit is reached, or [`BackoffReconnector::shutdown`]
/// is called.
pub struct BackoffReconnector<M> {
    inner: Arc<ReconnectorInner<M>>,
}

impl<M> Clone for BackoffReconnector<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ReconnectorInner<M> {
    factory: Arc<dyn ChannelFactory<M>>,
    policy: BackoffPolicy,
    pending: parking_lot::Mutex<HashMap<u64, TunnelAddress>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ReconnectEvent>,
    shutdown: CancellationToken,
}

impl<M: Message> BackoffReconnector<M> {
    pub fn new(factory: Arc<dyn ChannelFactory<M>>, policy: BackoffPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ReconnectorInner {
                factory,
                policy,
                pending: parking_lot::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Addresses with a reconnect in flight.
    pub fn pending_reconnects(&self) -> Vec<TunnelAddress> {
        self.inner.pending.lock().values().cloned().collect()
    }

    /// Abandon all pending reconnects. Their callbacks never run.
    pub fn shutdown(&self) {
        info!(pending = self.pending_count(), "reconnector shutting down");
        self.inner.shutdown.cancel();
    }
}

impl<M: Message> ReconnectPolicy<M> for BackoffReconnector<M> {
    fn schedule_reconnect(&self, address: TunnelAddress, on_success: OnReconnected<M>) {
        let label = address.to_string();
        if self.inner.shutdown.is_cancelled() {
            debug!(address = %label, "reconnector is shut down, ignoring request");
            let _ = self.inner.events.send(ReconnectEvent::GaveUp {
                address: label,
                attempts: 0,
            });
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(address = %label, "no tokio runtime to run the reconnect on");
            let _ = self.inner.events.send(ReconnectEvent::GaveUp {
                address: label,
                attempts: 0,
            });
            return;
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().insert(id, address.clone());
        info!(address = %label, "reconnect registered");
        let _ = self
            .inner
            .events
            .send(ReconnectEvent::Registered { address: label });
        runtime.spawn(run_reconnect(Arc::clone(&self.inner), id, address, on_success));
    }
}

async fn run_reconnect<M: Message>(
    inner: Arc<ReconnectorInner<M>>,
    id: u64,
    address: TunnelAddress,
    on_success: OnReconnected<M>,
) {
    let label = address.to_string();
    let mut attempt: u32 = 0;
    let rebuilt: Option<Arc<dyn MessageConnection<M>>> = loop {
        if !inner.policy.should_retry(attempt) {
            error!(address = %label, attempt, "Max reconnect attempts reached");
            break None;
        }
        let delay = inner.policy.delay_for_attempt(attempt);
        debug!(address = %label, attempt, delay_ms = delay.as_millis(), "waiting before reconnect");
        tokio::select! {
            () = sleep(delay) => {}
            () = inner.shutdown.cancelled() => {
                info!(address = %label, "reconnect cancelled by shutdown");
                break None;
            }
        }

        attempt = attempt.saturating_add(1);
        match inner.factory.build(&address).await {
            Ok(delegate) => break Some(delegate),
            Err(e) => {
                warn!(address = %label, error = %e, attempt, "reconnect attempt failed");
                let _ = inner.events.send(ReconnectEvent::AttemptFailed {
                    address: label.clone(),
                    attempt,
                    error: e.to_string(),
                });
            }
        }
    };

    inner.pending.lock().remove(&id);
    match rebuilt {
        Some(delegate) if !inner.shutdown.is_cancelled() => {
            info!(address = %label, attempts = attempt, "reconnected");
            let _ = inner.events.send(ReconnectEvent::Reconnected {
                address: label,
                attempts: attempt,
            });
            on_success(delegate);
        }
        Some(delegate) => {
            delegate.close().await;
            let _ = inner.events.send(ReconnectEvent::GaveUp {
                address: label,
                attempts: attempt,
            });
        }
        None => {
            let _ = inner.events.send(ReconnectEvent::GaveUp {
                address: label,
                attempts: attempt,
            });
        }
    }
}
