//! `tether probe`: heartbeat a tunneled echo service through a reconnecting handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tether_core::Config;
use tether_tunnel::ssh::{RusshSessionProvider, SessionProvider, SshClientConfig};
use tether_tunnel::{
    BackoffPolicy, BackoffReconnector, ChannelFactory, ConnectOptions, HandleOptions,
    ReconnectEvent, ReconnectPolicy, ReconnectingHandle, TunnelAddress, TunnelChannelFactory,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::envelope::Envelope;

pub struct ProbeArgs {
    /// Stop after this many heartbeats. `None` runs until Ctrl-C.
    pub count: Option<u64>,
    pub interval: Duration,
}

pub async fn run(config: &Config, args: ProbeArgs) -> anyhow::Result<()> {
    let address = TunnelAddress::from_config(&config.tunnel).context("invalid [tunnel] section")?;
    let provider: Arc<dyn SessionProvider> =
        Arc::new(RusshSessionProvider::new(SshClientConfig::from(&config.pump)));
    let factory: Arc<dyn ChannelFactory<Envelope>> = Arc::new(TunnelChannelFactory::new(
        provider,
        ConnectOptions::from(&config.channel),
    ));
    let reconnector = BackoffReconnector::new(
        Arc::clone(&factory),
        BackoffPolicy::from(&config.reconnect),
    );
    tokio::spawn(log_reconnects(reconnector.clone()));

    info!(%address, "opening tunnel");
    let policy: Arc<dyn ReconnectPolicy<Envelope>> = Arc::new(reconnector.clone());
    let handle = ReconnectingHandle::establish(
        address,
        factory.as_ref(),
        policy,
        HandleOptions {
            reconnect_on_close: config.reconnect.reconnect_on_close,
        },
    )
    .await
    .context("initial tunnel connect failed")?;
    info!(connection_id = %handle.connection_id(), "tunnel up");

    let outcome = tokio::select! {
        result = heartbeat(&handle, &args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    handle.close().await;
    reconnector.shutdown();
    outcome
}

async fn heartbeat(handle: &ReconnectingHandle<Envelope>, args: &ProbeArgs) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(args.interval);
    let mut seq = 0u64;
    let mut answered = 0u64;
    loop {
        if args.count.is_some_and(|count| seq >= count) {
            break;
        }
        ticker.tick().await;
        seq += 1;

        let ping = Envelope::heartbeat(seq);
        if let Err(e) = handle.write_message(&ping).await {
            warn!(seq, error = %e, generation = handle.generation(), "heartbeat not sent");
            continue;
        }
        match handle.read_message().await {
            Ok(reply) if reply.seq == seq => {
                answered += 1;
                info!(seq, rtt_ms = reply.age_ms(), "heartbeat answered");
            }
            Ok(reply) => warn!(seq, got = reply.seq, "out-of-order reply"),
            Err(e) => warn!(seq, error = %e, generation = handle.generation(), "no reply"),
        }
    }

    info!(sent = seq, answered, "probe finished");
    if seq > 0 && answered == 0 {
        anyhow::bail!("no heartbeat was answered");
    }
    Ok(())
}

async fn log_reconnects(reconnector: BackoffReconnector<Envelope>) {
    let mut events = reconnector.subscribe();
    loop {
        match events.recv().await {
            Ok(ReconnectEvent::Registered { address }) => info!(%address, "reconnect scheduled"),
            Ok(ReconnectEvent::AttemptFailed {
                address,
                attempt,
                error,
            }) => warn!(%address, attempt, %error, "reconnect attempt failed"),
            Ok(ReconnectEvent::Reconnected { address, attempts }) => {
                info!(%address, attempts, "tunnel restored");
            }
            Ok(ReconnectEvent::GaveUp { address, attempts }) => {
                error!(%address, attempts, "giving up on tunnel");
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}
