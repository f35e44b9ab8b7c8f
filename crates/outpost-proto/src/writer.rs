//! Shared outbound sink for the controller connection

use crate::codec::FrameCodec;
use crate::message::Outbound;
use crate::ProtocolError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// Sends one framed message at a time to the controller
///
/// Implementations must write each frame atomically: concurrent callers may
/// be forwarding loops, module loops and command handlers all at once.
#[async_trait]
pub trait TransportWriter: Send + Sync {
    /// Write one already-encoded payload as a single frame
    async fn write_frame(&self, payload: Bytes) -> Result<(), ProtocolError>;

    /// Encode and write an outbound message
    async fn send(&self, message: &Outbound) -> Result<(), ProtocolError> {
        let payload = message.encode()?;
        self.write_frame(payload).await
    }
}

/// [`TransportWriter`] over any async byte sink, serialized by a mutex
pub struct FramedWriter<W> {
    writer: Mutex<W>,
    codec: FrameCodec,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer with the default frame size limit
    pub fn new(writer: W) -> Self {
        Self::with_codec(writer, FrameCodec::new())
    }

    /// Wrap a writer with a custom codec
    pub fn with_codec(writer: W, codec: FrameCodec) -> Self {
        Self {
            writer: Mutex::new(writer),
            codec,
        }
    }

    /// Recover the inner writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> TransportWriter for FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&self, payload: Bytes) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        self.codec.write_frame(&mut *writer, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Fields;
    use crate::test_utils::decode_value;
    use std::io::Cursor;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let writer = Arc::new(FramedWriter::new(Vec::<u8>::new()));

        let mut tasks = Vec::new();
        for task in 0..8 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let message = Outbound::command_result(
                        format!("c{}-{}", task, n),
                        true,
                        "x".repeat(500),
                    );
                    writer.send(&message).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let bytes = Arc::try_unwrap(writer).ok().unwrap().into_inner();
        let mut codec = FrameCodec::new();
        let mut cursor = Cursor::new(bytes);
        let mut count = 0;
        while let Some(frame) = codec.read_frame(&mut cursor).await.unwrap() {
            let value = decode_value(&frame);
            assert_eq!(Fields::new(&value).str("message").len(), 500);
            count += 1;
        }
        assert_eq!(count, 200);
    }
}
