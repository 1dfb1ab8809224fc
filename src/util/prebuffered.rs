//! A pushback buffer for Tokio `AsyncRead`.
//!
//! This module provides [`Prebuffered`], a wrapper around an `AsyncRead` that
//! serves bytes pushed back by the message parser before falling through to
//! the inner reader.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{self, AsyncRead, ReadBuf};

/// A prebuffering wrapper around an `AsyncRead`.
///
/// Message parsing reads in whole blocks and may pull in bytes that belong to
/// the next message on the same connection. Those bytes are handed back with
/// [`Prebuffered::unread`] and returned by the next read.
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> fmt::Debug for Prebuffered<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prebuffered")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Creates a new `Prebuffered` wrapper with an empty buffer.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Pushes `bytes` back so that they are read before anything buffered
    /// earlier and before the inner reader.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.buf.is_empty() {
            self.buf.extend_from_slice(bytes);
        } else {
            let mut merged = BytesMut::with_capacity(bytes.len() + self.buf.len());
            merged.extend_from_slice(bytes);
            merged.extend_from_slice(&self.buf);
            self.buf = merged;
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}
