//! Length-prefixed frame codec for async streams

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec framing opaque payloads with a 4-byte big-endian length prefix
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode a payload with its length prefix
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    /// Write one frame and flush it
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(payload)?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| ProtocolError::Transport(format!("Write error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::Transport(format!("Flush error: {}", e)))?;
        Ok(())
    }

    /// Read the next frame payload, `None` on a clean EOF
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(payload) = self.try_decode_frame()? {
                return Ok(Some(payload));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| ProtocolError::Transport(format!("Read error: {}", e)))?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidFrame);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to split one complete frame off the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        // Peek at the length prefix without consuming it
        let frame_len = (&self.read_buf[..4]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        Ok(Some(self.read_buf.split_to(frame_len).freeze()))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
