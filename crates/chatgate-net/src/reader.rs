//! Buffered reader with peeking and guaranteed full-length reads.
//!
//! Sniffing needs to look at leading bytes without consuming them, and every
//! codec needs "exactly n bytes or an error". Both work off one internal
//! buffer that is refilled from the socket on demand.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const INITIAL_CAPACITY: usize = 4096;

pub struct Reader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// One read from the underlying stream into the buffer. Returns the number
    /// of bytes added; 0 means end of stream.
    pub async fn fill_more(&mut self) -> io::Result<usize> {
        if self.buf.capacity() - self.buf.len() < INITIAL_CAPACITY / 4 {
            self.buf.reserve(INITIAL_CAPACITY);
        }
        self.inner.read_buf(&mut self.buf).await
    }

    /// Wait until at least one byte is buffered. Returns false at end of
    /// stream.
    pub async fn fill_if_empty(&mut self) -> io::Result<bool> {
        if !self.buf.is_empty() {
            return Ok(true);
        }
        Ok(self.fill_more().await? > 0)
    }

    async fn fill_to(&mut self, n: usize) -> io::Result<()> {
        if self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
        }
        while self.buf.len() < n {
            if self.fill_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("wanted {n} bytes, stream ended after {}", self.buf.len()),
                ));
            }
        }
        Ok(())
    }

    /// Up to `n` bytes without consuming them. Fewer only when the stream
    /// ended first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill_more().await? == 0 {
                break;
            }
        }
        let end = n.min(self.buf.len());
        Ok(&self.buf[..end])
    }

    /// Drop `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Exactly `n` bytes, or `UnexpectedEof`.
    pub async fn read_n(&mut self, n: usize) -> io::Result<Bytes> {
        self.fill_to(n).await?;
        Ok(self.buf.split_to(n).freeze())
    }

    pub async fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        self.fill_to(N).await?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[..N]);
        self.buf.advance(N);
        Ok(out)
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.read_array::<1>().await?[0])
    }

    pub async fn read_u16_be(&mut self) -> io::Result<u16> {
        Ok(u16::from_be_bytes(self.read_array().await?))
    }

    pub async fn read_u32_le(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_u64_be(&mut self) -> io::Result<u64> {
        Ok(u64::from_be_bytes(self.read_array().await?))
    }

    /// Partial read: whatever is buffered (refilling once if empty), up to
    /// `out.len()`. Returns 0 only at end of stream or for an empty `out`.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && self.fill_more().await? == 0 {
            return Ok(0);
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    /// Skip `n` bytes of input.
    pub async fn discard(&mut self, mut n: u64) -> io::Result<()> {
        loop {
            let take = (self.buf.len() as u64).min(n) as usize;
            self.buf.advance(take);
            n -= take as u64;
            if n == 0 {
                return Ok(());
            }
            if self.fill_more().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}
