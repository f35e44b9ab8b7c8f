//! Agent main loop and frame processing

use crate::command::{CommandHandler, CommandType};
use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;
use anyhow::{Context, Result};
use outpost_proto::{Envelope, FrameCodec, FramedWriter, TransportWriter};
use std::sync::Arc;
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite, Stdin};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Main agent loop: reads frames, decodes envelopes, dispatches them
pub struct AgentLoop<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Input stream (typically stdin)
    reader: R,
    /// Frame codec for the input stream
    codec: FrameCodec,
    /// Shared dispatcher
    dispatcher: Arc<Dispatcher>,
    /// Shutdown signal receiver
    shutdown_rx: Option<oneshot::Receiver<()>>,
    /// Shutdown signal sender (kept for graceful shutdown)
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AgentLoop<Stdin> {
    /// Create an agent loop speaking frames over stdin/stdout
    pub fn new(config: AgentConfig) -> Self {
        Self::with_io(stdin(), stdout(), config)
    }
}

impl<R> AgentLoop<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create an agent loop over a custom reader/writer pair
    pub fn with_io<W>(reader: R, writer: W, config: AgentConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::with_max_frame_size(config.max_frame_size);
        let writer: Arc<dyn TransportWriter> = Arc::new(FramedWriter::with_codec(writer, codec));
        Self::with_writer(reader, writer, config)
    }

    /// Create an agent loop sending through an existing transport writer
    pub fn with_writer(reader: R, writer: Arc<dyn TransportWriter>, config: AgentConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            reader,
            codec: FrameCodec::with_max_frame_size(config.max_frame_size),
            dispatcher: Arc::new(Dispatcher::new(writer, &config)),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Register a handler for a command type
    pub async fn register_handler(&self, kind: CommandType, handler: Arc<dyn CommandHandler>) {
        self.dispatcher.register_handler(kind, handler).await;
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// The dispatcher behind this loop
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run until EOF, shutdown or a framing error
    ///
    /// Every session, module and abortable command is torn down before this
    /// returns. A framing error is returned so the caller can reconnect.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting agent loop");

        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .context("Shutdown receiver already taken")?;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Received shutdown signal, stopping agent loop");
                    break Ok(());
                }

                frame_result = self.codec.read_frame(&mut self.reader) => {
                    match frame_result {
                        Ok(Some(payload)) => self.process_frame(&payload).await,
                        Ok(None) => {
                            info!("Input stream closed, stopping agent loop");
                            break Ok(());
                        }
                        Err(e) => {
                            error!("Error reading frame: {}", e);
                            break Err(anyhow::Error::new(e).context("controller connection failed"));
                        }
                    }
                }
            }
        };

        self.dispatcher.shutdown().await;
        info!("Agent loop stopped");
        outcome
    }

    async fn process_frame(&self, payload: &[u8]) {
        match Envelope::decode(payload) {
            Ok(envelope) => {
                debug!(kind = %envelope.kind(), size = payload.len(), "received envelope");
                self.dispatcher.dispatch(envelope).await;
            }
            Err(e) => warn!("Failed to decode envelope: {}", e),
        }
    }
}
