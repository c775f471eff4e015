//! Message framing.
//!
//! Format: 4-byte big-endian length prefix + MessagePack payload (named
//! fields). Partial frames decode to `Ok(None)` so the codec works under
//! `FramedRead`; oversized frames are rejected before buffering them.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TunnelError};

/// Length of the frame header (4 bytes, big-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Scratch buffers above this size are dropped after a write instead of reused.
const SCRATCH_RETAIN: usize = 64 * 1024;

pub struct MessageCodec<M> {
    max_frame: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> MessageCodec<M> {
    pub const fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            _message: PhantomData,
        }
    }
}

impl<M> Default for MessageCodec<M> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl<M> Clone for MessageCodec<M> {
    fn clone(&self) -> Self {
        Self::new(self.max_frame)
    }
}

impl<M: DeserializeOwned> Decoder for MessageCodec<M> {
    type Item = M;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(TunnelError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len);
        rmp_serde::from_slice(&payload)
            .map(Some)
            .map_err(|e| TunnelError::Codec(format!("deserialization failed: {e}")))
    }
}

impl<M: Serialize> Encoder<&M> for MessageCodec<M> {
    type Error = TunnelError;

    fn encode(&mut self, item: &M, dst: &mut BytesMut) -> Result<()> {
        let payload = rmp_serde::to_vec_named(item)
            .map_err(|e| TunnelError::Codec(format!("serialization failed: {e}")))?;
        if payload.len() > self.max_frame {
            return Err(TunnelError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| TunnelError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame,
        })?;
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Buffered frame writer.
///
/// Every [`FrameWriter::send`] encodes into a scratch buffer, writes, flushes,
/// and then resets the scratch so a long-lived writer does not keep the
/// capacity of its largest message.
pub struct FrameWriter<W, M> {
    inner: BufWriter<W>,
    codec: MessageCodec<M>,
    scratch: BytesMut,
}

impl<W, M> FrameWriter<W, M>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    pub fn new(writer: W, codec: MessageCodec<M>) -> Self {
        Self {
            inner: BufWriter::new(writer),
            codec,
            scratch: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, message: &M) -> Result<()> {
        let outcome = self.write_frame(message).await;
        self.reset();
        outcome
    }

    async fn write_frame(&mut self, message: &M) -> Result<()> {
        self.codec.encode(message, &mut self.scratch)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    fn reset(&mut self) {
        if self.scratch.capacity() > SCRATCH_RETAIN {
            self.scratch = BytesMut::new();
        } else {
            self.scratch.clear();
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }
}
