//! Byte pipes between blocking guest stdio and async host code
//!
//! The guest runs on its own OS thread and performs ordinary blocking
//! `Read`/`Write` on its stdio. The host side is async. Both ends are backed
//! by unbounded channels of [`Bytes`] chunks; dropping either end closes the
//! pipe (EOF for readers, `BrokenPipe` for writers).

use bytes::{Buf, Bytes};
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Host end of the guest's stdin
#[derive(Debug, Clone)]
pub struct HostInput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl HostInput {
    /// Queue bytes for the guest; fails once the guest end is gone
    pub fn send(&self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "guest input closed"))
    }

    /// Whether the guest end has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Guest end of stdin, a blocking reader
#[derive(Debug)]
pub struct GuestInput {
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    pending: Bytes,
}

impl Read for GuestInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            let rx = self.rx.get_mut().unwrap_or_else(|e| e.into_inner());
            match rx.blocking_recv() {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// Guest end of stdout or stderr, a non-blocking writer
#[derive(Debug, Clone)]
pub struct GuestOutput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Write for GuestOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host output closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Host end of the guest's stdout or stderr, an async reader
#[derive(Debug)]
pub struct HostOutput {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for HostOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// Pipe feeding the guest's stdin
pub fn input_pipe() -> (HostInput, GuestInput) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        HostInput { tx },
        GuestInput {
            rx: Mutex::new(rx),
            pending: Bytes::new(),
        },
    )
}

/// Pipe draining one of the guest's output streams
pub fn output_pipe() -> (GuestOutput, HostOutput) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        GuestOutput { tx },
        HostOutput {
            rx,
            pending: Bytes::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_guest_input_reads_across_chunks() {
        let (host, mut guest) = input_pipe();
        host.send(Bytes::from_static(b"hel")).unwrap();
        host.send(Bytes::from_static(b"lo")).unwrap();
        drop(host);

        let mut out = String::new();
        guest.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_guest_input_small_buffer() {
        let (host, mut guest) = input_pipe();
        host.send(Bytes::from_static(b"abcdef")).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(guest.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(guest.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_send_after_guest_dropped() {
        let (host, guest) = input_pipe();
        drop(guest);
        assert!(host.is_closed());
        let err = host.send(Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_host_output_sees_guest_writes_then_eof() {
        let (mut guest, mut host) = output_pipe();
        let writer = std::thread::spawn(move || {
            guest.write_all(b"from ").unwrap();
            guest.write_all(b"guest").unwrap();
        });
        writer.join().unwrap();

        let mut out = Vec::new();
        host.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"from guest");
    }

    #[test]
    fn test_guest_write_after_host_dropped() {
        let (mut guest, host) = output_pipe();
        drop(host);
        assert_eq!(
            guest.write(b"lost").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
