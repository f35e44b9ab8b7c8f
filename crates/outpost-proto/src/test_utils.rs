//! Helpers for building envelopes and observing outbound traffic in tests

use crate::writer::TransportWriter;
use crate::ProtocolError;
use async_trait::async_trait;
use bytes::Bytes;
use rmpv::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Build a msgpack map value from string keys
pub fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// Encode a string-keyed map as msgpack bytes
pub fn encode_map(entries: Vec<(&str, Value)>) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = rmpv::encode::write_value(&mut buf, &map(entries));
    buf
}

/// Decode msgpack bytes into a value, nil on error
pub fn decode_value(bytes: &[u8]) -> Value {
    let mut reader = bytes;
    rmpv::decode::read_value(&mut reader).unwrap_or(Value::Nil)
}

/// Capturing [`TransportWriter`]
#[derive(Debug)]
pub struct RecordingWriter {
    frames: Mutex<Vec<Bytes>>,
    count: watch::Sender<usize>,
}

impl Default for RecordingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingWriter {
    /// Empty recorder
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            frames: Mutex::new(Vec::new()),
            count,
        }
    }

    /// All captured messages, decoded
    pub fn messages(&self) -> Vec<Value> {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.iter().map(|frame| decode_value(frame)).collect()
    }

    /// Captured messages whose `type` matches
    pub fn messages_of(&self, kind: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| crate::envelope::Fields::new(m).str("type") == kind)
            .collect()
    }

    /// Wait until the captured messages satisfy `done`
    pub async fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&[Value]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.count.subscribe();
        loop {
            if done(&self.messages()) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return done(&self.messages()),
            }
        }
    }

    /// Wait for the first message matching `pred`
    pub async fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<Value>
    where
        F: FnMut(&Value) -> bool,
    {
        let mut found = None;
        self.wait_until(timeout, |messages| {
            found = messages.iter().find(|m| pred(m)).cloned();
            found.is_some()
        })
        .await;
        found
    }
}

#[async_trait]
impl TransportWriter for RecordingWriter {
    async fn write_frame(&self, payload: Bytes) -> Result<(), ProtocolError> {
        let len = {
            let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
            frames.push(payload);
            frames.len()
        };
        self.count.send_replace(len);
        Ok(())
    }
}
