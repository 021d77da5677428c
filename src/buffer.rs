//! sniproxy/src/buffer.rs
//! Fixed-capacity byte ring with coalesce-on-read, modeled on the buffer
//! contract in SPEC_FULL.md §4.A.

use crate::error::BufferError;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A bounded ring of octets belonging to one side of one connection.
///
/// `recv`/`send` operate against any `AsyncRead + AsyncWrite` stream rather
/// than a raw fd, so the same buffer works whether the socket underneath is
/// a plain `TcpStream` or a SOCKS5-wrapped one. `len() + room() == capacity`
/// holds at all times; `tx_bytes`/`rx_bytes` are monotonic for the lifetime
/// of the buffer.
pub struct ByteBuffer {
    data: Vec<u8>,
    capacity: usize,
    head: usize,
    len: usize,
    tx_bytes: u64,
    rx_bytes: u64,
    last_recv: Option<Instant>,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            data: vec![0u8; capacity],
            capacity,
            head: 0,
            len: 0,
            tx_bytes: 0,
            rx_bytes: 0,
            last_recv: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn room(&self) -> usize {
        self.capacity - self.len
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn last_recv_time(&self) -> Option<Instant> {
        self.last_recv
    }

    fn tail_index(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity
    }

    /// Copies up to `room()` bytes from `bytes` into the buffer. Never blocks,
    /// never grows the buffer. Returns the number of bytes actually copied.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.room());
        for (i, b) in bytes[..n].iter().enumerate() {
            let idx = self.tail_index(self.len + i);
            self.data[idx] = *b;
        }
        self.len += n;
        n
    }

    /// Non-blocking read from `stream` into free space. Returns `Ok(0)` on a
    /// clean peer close, `Ok(n)` for `n` bytes received. `ErrorKind::WouldBlock`
    /// is the async equivalent of the C contract's EAGAIN/EWOULDBLOCK: callers
    /// treat it as temporary and simply re-arm, which `.await` already does
    /// for them under Tokio, but it is preserved as a distinct `Ok` vs `Err`
    /// split so the connection state machine can log permanent I/O errors
    /// (SPEC_FULL.md §7, kind 2) without misclassifying a retryable one.
    pub async fn recv<S>(&mut self, stream: &mut S) -> Result<usize, BufferError>
    where
        S: AsyncRead + Unpin,
    {
        if self.room() == 0 {
            return Ok(0);
        }
        let start = self.tail_index(self.len);
        let contiguous_room = (self.capacity - start).min(self.room());
        let n = stream.read(&mut self.data[start..start + contiguous_room]).await?;
        if n > 0 {
            self.len += n;
            self.rx_bytes += n as u64;
            self.last_recv = Some(Instant::now());
        }
        Ok(n)
    }

    /// Drains from the front of the buffer into `stream`. Partial writes are
    /// expected and legal: the caller simply calls `send` again once the
    /// socket is next writable.
    pub async fn send<S>(&mut self, stream: &mut S) -> Result<usize, BufferError>
    where
        S: AsyncWrite + Unpin,
    {
        if self.len == 0 {
            return Ok(0);
        }
        let contiguous = self.coalesce_into_scratch();
        let n = stream.write(&contiguous).await?;
        self.pop(n);
        self.tx_bytes += n as u64;
        Ok(n)
    }

    /// Presents the buffer's logical content as one contiguous read-only
    /// span, copying internally if the content wraps the ring.
    pub fn coalesce(&self) -> Vec<u8> {
        self.coalesce_into_scratch()
    }

    fn coalesce_into_scratch(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.data[self.tail_index(i)]);
        }
        out
    }

    /// Removes `n` bytes from the front of the buffer (`n` is clamped to
    /// `len()`). Used to discard PROXY-header bytes that should not reach a
    /// backend, and to discard SOCKS5 acknowledgement bytes.
    pub fn pop(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = self.tail_index(n);
        self.len -= n;
    }

    /// Clears all content without affecting the monotonic counters.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Writes a whole packet to `stream`, bypassing the ring (used for the
    /// small amount of synthesized data — PROXY headers, SOCKS5 control
    /// bytes, abort messages — that is produced in full up front).
    pub async fn write_through<S>(stream: &mut S, bytes: &[u8]) -> Result<(), BufferError>
    where
        S: AsyncWrite + Unpin,
    {
        stream.write_all(bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_respects_room() {
        let mut buf = ByteBuffer::with_capacity(4);
        assert_eq!(buf.push(b"hello"), 4);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.room(), 0);
        assert_eq!(buf.coalesce(), b"hell");
    }

    #[test]
    fn pop_and_wrap() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.push(b"ab");
        buf.pop(1);
        buf.push(b"cd");
        // ring has wrapped: logical content is "bcd"
        assert_eq!(buf.coalesce(), b"bcd");
        assert_eq!(buf.len() + buf.room(), 4);
    }

    #[test]
    fn reset_clears_content_not_counters() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.push(b"socks5ack");
        let room_before = buf.room();
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert!(buf.room() > room_before);
    }

    #[tokio::test]
    async fn recv_reports_zero_on_eof() {
        let mut buf = ByteBuffer::with_capacity(16);
        let (mut client, server) = tokio::io::duplex(16);
        drop(server);
        client.shutdown().await.ok();
        let (mut a, b) = tokio::io::duplex(16);
        drop(b);
        let n = buf.recv(&mut a).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn send_drains_front_and_counts() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.push(b"hello");
        let (mut a, mut b) = tokio::io::duplex(64);
        let n = buf.send(&mut a).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.tx_bytes(), 5);
        let mut out = [0u8; 5];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }
}
