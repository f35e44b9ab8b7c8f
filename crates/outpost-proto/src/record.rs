//! Streaming decoder for back-to-back msgpack records
//!
//! Module stdout carries records with no outer framing; each msgpack value is
//! self-delimiting. The decoder walks item headers as bytes arrive and keeps its
//! position between reads, so a large record is scanned once and parsed once.

use crate::codec::MAX_FRAME_SIZE;
use crate::ProtocolError;
use bytes::{Buf, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Deepest container nesting accepted in one record
const MAX_DEPTH: usize = 1024;

/// Incremental decoder buffering partial records
pub struct RecordDecoder {
    read_buf: BytesMut,
    max_record_size: usize,
    /// Bytes of the current record already walked
    scanned: usize,
    /// Items still expected by each open array or map, innermost last
    open: Vec<u64>,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape of one msgpack item header
struct Item {
    header: usize,
    body: usize,
    children: u64,
}

impl Item {
    fn scalar(header: usize, body: usize) -> Self {
        Self { header, body, children: 0 }
    }

    fn container(header: usize, children: u64) -> Self {
        Self { header, body: 0, children }
    }
}

impl RecordDecoder {
    /// Decoder with the default 16MB record ceiling
    pub fn new() -> Self {
        Self::with_max_record_size(MAX_FRAME_SIZE)
    }

    /// Decoder with a custom record ceiling
    pub fn with_max_record_size(max_record_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(4096),
            max_record_size,
            scanned: 0,
            open: Vec::new(),
        }
    }

    /// Append raw bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Pop one complete record if the buffer holds one
    pub fn try_decode(&mut self) -> Result<Option<Value>, ProtocolError> {
        if !self.scan()? {
            if self.read_buf.len() > self.max_record_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: self.read_buf.len(),
                    max: self.max_record_size,
                });
            }
            return Ok(None);
        }

        let record = self.read_buf.split_to(self.scanned);
        self.scanned = 0;
        let value = rmpv::decode::read_value(&mut record.chunk())?;
        Ok(Some(value))
    }

    /// Walk item headers from the saved position; true once a whole record is buffered
    fn scan(&mut self) -> Result<bool, ProtocolError> {
        loop {
            let Some(item) = peek_item(&self.read_buf[self.scanned..])? else {
                return Ok(false);
            };

            let end = self.scanned + item.header + item.body;
            if end > self.max_record_size {
                self.reset();
                return Err(ProtocolError::FrameTooLarge {
                    size: end,
                    max: self.max_record_size,
                });
            }
            if end > self.read_buf.len() {
                return Ok(false);
            }
            self.scanned = end;

            if item.children > 0 {
                if self.open.len() >= MAX_DEPTH {
                    self.reset();
                    return Err(ProtocolError::InvalidFrame);
                }
                self.open.push(item.children);
                continue;
            }

            // A finished item may close any number of enclosing containers
            loop {
                match self.open.last_mut() {
                    None => return Ok(true),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.read_buf.clear();
        self.scanned = 0;
        self.open.clear();
    }

    /// Read the next record; `None` on EOF at a record boundary
    pub async fn read_record<R>(&mut self, reader: &mut R) -> Result<Option<Value>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(value) = self.try_decode()? {
                return Ok(Some(value));
            }

            let mut temp_buf = [0u8; 4096];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| ProtocolError::Transport(format!("Read error: {}", e)))?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::InvalidFrame);
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }
}

/// Big-endian length field of `width` bytes following the marker
fn length(buf: &[u8], width: usize) -> Option<usize> {
    let field = buf.get(1..1 + width)?;
    Some(field.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
}

/// Decode the header at the start of `buf`; `None` until the header is buffered
fn peek_item(buf: &[u8]) -> Result<Option<Item>, ProtocolError> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    let item = match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Item::scalar(1, 0),
        0x80..=0x8f => Item::container(1, 2 * u64::from(marker & 0x0f)),
        0x90..=0x9f => Item::container(1, u64::from(marker & 0x0f)),
        0xa0..=0xbf => Item::scalar(1, usize::from(marker & 0x1f)),
        0xc1 => return Err(ProtocolError::InvalidFrame),
        0xc4 | 0xd9 => match length(buf, 1) {
            Some(len) => Item::scalar(2, len),
            None => return Ok(None),
        },
        0xc5 | 0xda => match length(buf, 2) {
            Some(len) => Item::scalar(3, len),
            None => return Ok(None),
        },
        0xc6 | 0xdb => match length(buf, 4) {
            Some(len) => Item::scalar(5, len),
            None => return Ok(None),
        },
        // ext: length, then a type byte before the data
        0xc7 => match length(buf, 1) {
            Some(len) => Item::scalar(3, len),
            None => return Ok(None),
        },
        0xc8 => match length(buf, 2) {
            Some(len) => Item::scalar(4, len),
            None => return Ok(None),
        },
        0xc9 => match length(buf, 4) {
            Some(len) => Item::scalar(6, len),
            None => return Ok(None),
        },
        0xca => Item::scalar(1, 4),
        0xcb => Item::scalar(1, 8),
        0xcc | 0xd0 => Item::scalar(1, 1),
        0xcd | 0xd1 => Item::scalar(1, 2),
        0xce | 0xd2 => Item::scalar(1, 4),
        0xcf | 0xd3 => Item::scalar(1, 8),
        // fixext: type byte plus 1, 2, 4, 8 or 16 data bytes
        0xd4 => Item::scalar(1, 2),
        0xd5 => Item::scalar(1, 3),
        0xd6 => Item::scalar(1, 5),
        0xd7 => Item::scalar(1, 9),
        0xd8 => Item::scalar(1, 17),
        0xdc => match length(buf, 2) {
            Some(len) => Item::container(3, len as u64),
            None => return Ok(None),
        },
        0xdd => match length(buf, 4) {
            Some(len) => Item::container(5, len as u64),
            None => return Ok(None),
        },
        0xde => match length(buf, 2) {
            Some(len) => Item::container(3, 2 * len as u64),
            None => return Ok(None),
        },
        0xdf => match length(buf, 4) {
            Some(len) => Item::container(5, 2 * len as u64),
            None => return Ok(None),
        },
    };
    Ok(Some(item))
}
