use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;

use crate::Error;

/// A stream used to send bytes to the peer. Thin wrapper over
/// [`quinn::SendStream`] that folds its errors into [`Error`].
#[derive(Debug)]
pub struct SendStream {
    inner: quinn::SendStream,
}

impl SendStream {
    pub(crate) fn new(stream: quinn::SendStream) -> Self {
        Self { inner: stream }
    }

    /// Abruptly reset the stream with the given H3 application error code.
    pub fn reset(&mut self, code: u64) -> Result<(), quinn::ClosedStream> {
        let code = quinn::VarInt::try_from(code).unwrap_or(quinn::VarInt::MAX);
        self.inner.reset(code)
    }

    /// Write some data to the stream, returning the size written.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.inner.write(buf).await.map_err(Into::into)
    }

    /// Write all of the data to the stream.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf).await.map_err(Into::into)
    }

    /// Write a chunk of data to the stream.
    pub async fn write_chunk(&mut self, buf: Bytes) -> Result<(), Error> {
        self.inner.write_chunk(buf).await.map_err(Into::into)
    }

    /// Wait until all of the data has been written to the stream, then
    /// close our side cleanly.
    pub fn finish(&mut self) -> Result<(), quinn::ClosedStream> {
        self.inner.finish()
    }

    pub fn set_priority(&self, order: i32) -> Result<(), quinn::ClosedStream> {
        self.inner.set_priority(order)
    }

    pub(crate) fn quinn_mut(&mut self) -> &mut quinn::SendStream {
        &mut self.inner
    }
}

impl tokio::io::AsyncWrite for SendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // We have to use this syntax because quinn added its own poll_write method.
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
