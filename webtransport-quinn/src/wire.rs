//! Async stream helpers built on top of `webtransport_proto`'s in-memory codec.
//!
//! The wire protocol is specified in terms of `Buf`, which is convenient for
//! tests but useless against a live `quinn::RecvStream`. These helpers read
//! just enough bytes off a stream into a small buffer, then hand that buffer
//! to the synchronous decoder.

use webtransport_proto::{self as proto, Capsule, CapsuleError, Frame, VarInt};

use crate::Error;

/// Read a single varint directly off the stream, one byte at a time until the
/// encoded length is known.
pub async fn read_varint(recv: &mut quinn::RecvStream) -> Result<VarInt, Error> {
    let mut buf = [0u8; 8];
    read_exact(recv, &mut buf[..1]).await?;

    let len = 1usize << (buf[0] >> 6);
    if len > 1 {
        read_exact(recv, &mut buf[1..len]).await?;
    }

    let mut cursor = &buf[..len];
    VarInt::decode(&mut cursor).map_err(Into::into)
}

/// Read exactly `buf.len()` bytes, failing with [`Error::UnexpectedEof`] if the
/// peer half-closes early.
pub async fn read_exact(recv: &mut quinn::RecvStream, buf: &mut [u8]) -> Result<(), Error> {
    use tokio::io::AsyncReadExt;
    recv.read_exact(buf).await.map_err(|_| Error::UnexpectedEof)
}

/// Read and discard exactly `n` bytes.
pub async fn drop_exact(recv: &mut quinn::RecvStream, mut n: usize) -> Result<(), Error> {
    let mut scratch = [0u8; 1024];
    while n > 0 {
        let chunk = n.min(scratch.len());
        read_exact(recv, &mut scratch[..chunk]).await?;
        n -= chunk;
    }
    Ok(())
}

/// Read only the frame's type varint. Used when classifying a fresh stream,
/// where the caller decides whether a length field even follows (the
/// `WEBTRANSPORT_STREAM` marker is a bare type+session-id pair with no length
/// field, unlike ordinary HTTP/3 frames such as HEADERS or SETTINGS).
pub async fn read_frame_type(recv: &mut quinn::RecvStream) -> Result<Frame, Error> {
    Ok(Frame(read_varint(recv).await?))
}

/// Read a `(type, length)` HTTP/3 frame header, transparently dropping any
/// grease frame that precedes the meaningful one (`(type - 0x21) % 0x1f == 0`).
pub async fn read_frame_header(recv: &mut quinn::RecvStream) -> Result<(Frame, u64), Error> {
    loop {
        let typ = read_frame_type(recv).await?;
        let len = read_varint(recv).await?;

        if typ.is_grease() {
            drop_exact(recv, len.into_inner() as usize).await?;
            continue;
        }

        return Ok((typ, len.into_inner()));
    }
}

/// Same as [`read_frame_header`], but for a bidirectional stream: a short
/// read while dropping a grease frame's payload aborts the write side with
/// `H3_FRAME_ERROR`, per the framing helper's contract.
pub async fn read_frame_header_bidi(
    send: &mut quinn::SendStream,
    recv: &mut quinn::RecvStream,
) -> Result<(Frame, u64), Error> {
    loop {
        let typ = read_frame_type(recv).await?;
        let len = read_varint(recv).await?;

        if typ.is_grease() {
            if let Err(e) = drop_exact(recv, len.into_inner() as usize).await {
                abort_send(send, proto::H3_FRAME_ERROR);
                return Err(e);
            }
            continue;
        }

        return Ok((typ, len.into_inner()));
    }
}

/// Abort the read side with `code`. Already-finished streams are not an error.
pub fn abort_recv(recv: &mut quinn::RecvStream, code: u64) {
    let code = quinn::VarInt::try_from(code).unwrap_or(quinn::VarInt::MAX);
    let _ = recv.stop(code);
}

/// Abort the write side with `code`.
pub fn abort_send(send: &mut quinn::SendStream, code: u64) {
    let code = quinn::VarInt::try_from(code).unwrap_or(quinn::VarInt::MAX);
    let _ = send.reset(code);
}

/// Abort both sides of a bidirectional stream with the same code.
pub fn abort_both(send: &mut quinn::SendStream, recv: &mut quinn::RecvStream, code: u64) {
    abort_send(send, code);
    abort_recv(recv, code);
}

/// Read the next capsule off a stream, one DATA frame at a time.
///
/// `Capsule::decode` is written against an in-memory `Buf` and expects to find
/// the *next* frame already buffered when it skips a grease capsule. Since we
/// only ever hand it exactly one frame's worth of bytes, a grease capsule
/// makes it fail with `UnexpectedEnd` after consuming that frame; that's
/// exactly the signal to go read another frame off the stream.
pub async fn read_capsule(recv: &mut quinn::RecvStream) -> Result<Capsule, Error> {
    loop {
        let (typ, len) = read_frame_header(recv).await?;
        if typ != Frame::DATA {
            abort_recv(recv, webtransport_proto::H3_FRAME_UNEXPECTED);
            return Err(Error::InvalidData(format!(
                "expected a DATA frame for a capsule, got {typ:?}"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        read_exact(recv, &mut payload).await?;

        let mut framed = Vec::with_capacity(payload.len() + 16);
        Frame::DATA.encode(&mut framed);
        VarInt::try_from(payload.len())?.encode(&mut framed);
        framed.extend_from_slice(&payload);

        match Capsule::read(&mut framed.as_slice()) {
            Ok(capsule) => return Ok(capsule),
            Err(CapsuleError::UnexpectedEnd) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
