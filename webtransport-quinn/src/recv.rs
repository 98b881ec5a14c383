use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;

use crate::{Error, ReadExactError, ReadToEndError};

/// A stream used to receive bytes from the peer. Thin wrapper over
/// [`quinn::RecvStream`] that folds its errors into [`Error`].
#[derive(Debug)]
pub struct RecvStream {
    inner: quinn::RecvStream,
}

impl RecvStream {
    pub(crate) fn new(stream: quinn::RecvStream) -> Self {
        Self { inner: stream }
    }

    /// Tell the peer to stop sending on this stream with the given H3
    /// application error code.
    pub fn stop(&mut self, code: u64) -> Result<(), quinn::ClosedStream> {
        let code = quinn::VarInt::try_from(code).unwrap_or(quinn::VarInt::MAX);
        self.inner.stop(code)
    }

    /// Read some data into the buffer and return the amount read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        self.inner.read(buf).await.map_err(Into::into)
    }

    /// Fill the entire buffer with data.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadExactError> {
        self.inner.read_exact(buf).await.map_err(Into::into)
    }

    /// Read a chunk of data from the stream.
    pub async fn read_chunk(
        &mut self,
        max_length: usize,
        ordered: bool,
    ) -> Result<Option<quinn::Chunk>, Error> {
        self.inner
            .read_chunk(max_length, ordered)
            .await
            .map_err(Into::into)
    }

    /// Read chunks of data from the stream.
    pub async fn read_chunks(&mut self, bufs: &mut [Bytes]) -> Result<Option<usize>, Error> {
        self.inner.read_chunks(bufs).await.map_err(Into::into)
    }

    /// Read until the end of the stream or the limit is hit.
    pub async fn read_to_end(&mut self, size_limit: usize) -> Result<Vec<u8>, ReadToEndError> {
        self.inner.read_to_end(size_limit).await.map_err(Into::into)
    }

    /// Block until the stream has been reset by the peer, returning the raw
    /// H3 application error code.
    pub async fn received_reset(&mut self) -> Result<Option<u64>, Error> {
        match self.inner.received_reset().await {
            Ok(code) => Ok(code.map(|c| c.into_inner())),
            Err(quinn::ResetError::ConnectionLost(e)) => Err(e.into()),
            Err(quinn::ResetError::ZeroRttRejected) => unreachable!("0-RTT not supported"),
        }
    }

    pub(crate) fn quinn_mut(&mut self) -> &mut quinn::RecvStream {
        &mut self.inner
    }

    // We purposely don't expose the stream ID; it isn't meaningful above the
    // WebTransport session/request abstraction.
}

impl tokio::io::AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
