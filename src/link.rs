//! # Line-oriented worker transport.
//!
//! [`Link`] wraps one worker TCP connection with a read buffer and
//! deadline-bounded operations: text lines for control traffic, raw byte
//! ranges for bulk payloads. Every operation takes an explicit timeout and
//! fails with [`LinkError::Timeout`] rather than blocking the wait loop.
//!
//! The wait loop polls many links at once through [`Link::poll_recv_ready`],
//! which reports readiness when either a full line is already buffered or
//! the socket has data to read.

use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use crate::error::LinkError;

/// Maximum length of a single control line.
pub const LINE_MAX: usize = 64 * 1024;

/// One buffered worker connection.
pub struct Link {
    stream: TcpStream,
    buf: BytesMut,
    peer: SocketAddr,
}

impl Link {
    /// Wraps an accepted connection.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            peer,
        }
    }

    /// Remote address of this connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reports readiness without consuming anything.
    ///
    /// Ready when a complete line is buffered, or when the socket itself is
    /// readable (which may also mean EOF; the next receive surfaces it).
    pub fn poll_recv_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.buf.contains(&b'\n') {
            return Poll::Ready(());
        }
        match self.stream.poll_read_ready(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Receives one `\n`-terminated line, stripping the terminator and any
    /// trailing `\r`.
    pub async fn recv_line(&mut self, timeout: Duration) -> Result<String, LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > LINE_MAX {
                return Err(LinkError::LineTooLong { limit: LINE_MAX });
            }
            self.read_more(deadline, timeout).await?;
        }
    }

    /// Receives exactly `n` bytes of bulk payload.
    pub async fn recv_exact(&mut self, n: usize, timeout: Duration) -> Result<Bytes, LinkError> {
        let deadline = Instant::now() + timeout;
        while self.buf.len() < n {
            self.read_more(deadline, timeout).await?;
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Reads and discards `n` bytes of unwanted payload.
    pub async fn soak(&mut self, mut n: u64, timeout: Duration) -> Result<(), LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            let drop = (self.buf.len() as u64).min(n) as usize;
            let _ = self.buf.split_to(drop);
            n -= drop as u64;
            if n == 0 {
                return Ok(());
            }
            self.read_more(deadline, timeout).await?;
        }
    }

    /// Sends raw bytes, all or nothing, within the deadline.
    pub async fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), LinkError> {
        use tokio::io::AsyncWriteExt;
        let deadline = Instant::now() + timeout;
        timeout_at(deadline, self.stream.write_all(data))
            .await
            .map_err(|_| LinkError::Timeout { timeout })?
            .map_err(LinkError::Io)
    }

    async fn read_more(&mut self, deadline: Instant, timeout: Duration) -> Result<(), LinkError> {
        let n = timeout_at(deadline, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|_| LinkError::Timeout { timeout })?
            .map_err(LinkError::Io)?;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Link, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Link::new(server, peer), client)
    }

    #[tokio::test]
    async fn lines_and_bytes_round_trip() {
        let (mut link, mut client) = pair().await;
        client.write_all(b"hello world\r\nabcde").await.unwrap();

        let line = link.recv_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "hello world");

        let bytes = link.recv_exact(5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&bytes[..], b"abcde");
    }

    #[tokio::test]
    async fn recv_line_times_out() {
        let (mut link, _client) = pair().await;
        let err = link.recv_line(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let (mut link, client) = pair().await;
        drop(client);
        let err = link.recv_line(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::Closed));
    }

    #[tokio::test]
    async fn soak_discards_exactly() {
        let (mut link, mut client) = pair().await;
        client.write_all(b"0123456789tail\n").await.unwrap();
        link.soak(10, Duration::from_secs(1)).await.unwrap();
        let line = link.recv_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "tail");
    }
}
