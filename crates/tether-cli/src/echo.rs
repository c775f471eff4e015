//! `tether echo`: a TCP endpoint that answers every framed envelope with itself.
//!
//! Point a tunnel's service address at it to exercise the full path.

use std::net::SocketAddr;

use tether_tunnel::codec::{FrameWriter, MessageCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;

pub async fn run(listen: SocketAddr, max_frame: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "echo endpoint listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("echo endpoint stopping");
                return Ok(());
            }
        };
        tokio::spawn(async move {
            if let Err(e) = serve(stream, max_frame).await {
                warn!(%peer, error = %e, "echo connection failed");
            }
        });
    }
}

async fn serve(stream: TcpStream, max_frame: usize) -> tether_tunnel::Result<()> {
    let peer = stream.peer_addr()?;
    debug!(%peer, "echo connection opened");
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, MessageCodec::<Envelope>::new(max_frame));
    let mut writer = FrameWriter::new(write, MessageCodec::<Envelope>::new(max_frame));

    let mut echoed = 0u64;
    while let Some(envelope) = reader.next().await {
        writer.send(&envelope?).await?;
        echoed += 1;
    }
    writer.shutdown().await?;
    debug!(%peer, echoed, "echo connection closed");
    Ok(())
}
