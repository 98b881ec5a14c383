//! An established WebTransport session: one per extended-CONNECT request that
//! was accepted, multiplexed alongside any number of siblings over the same
//! QUIC connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use webtransport_proto::{self as proto, Capsule};

use crate::connection::{ConnectionHandle, QueuedStream};
use crate::{wire, Error, RecvStream, SendStream};

/// The terminal reason a session ended, as reported by the peer's
/// `CLOSE_WEBTRANSPORT_SESSION` capsule, or a synthesized `(0, "")` if the
/// request stream simply reached its end without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u32,
    pub message: String,
}

type EndResult = Result<CloseInfo, Error>;

pub struct Session {
    handle: ConnectionHandle,
    session_id: u64,
    send: Arc<AsyncMutex<quinn::SendStream>>,
    streams: AsyncMutex<mpsc::UnboundedReceiver<QueuedStream>>,
    datagrams: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    datagram_registered: Arc<AtomicBool>,
    end: watch::Receiver<Option<EndResult>>,
}

impl Session {
    pub(crate) fn new(
        handle: ConnectionHandle,
        session_id: u64,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let (datagrams_tx, datagrams_rx) = mpsc::unbounded_channel();
        let datagram_registered = Arc::new(AtomicBool::new(false));
        let (end_tx, end_rx) = watch::channel(None);

        handle.register_session(session_id, streams_tx, datagrams_tx);

        tokio::spawn(control_reader(
            handle.clone(),
            session_id,
            recv,
            datagram_registered.clone(),
            end_tx,
        ));

        Self {
            handle,
            session_id,
            send: Arc::new(AsyncMutex::new(send)),
            streams: AsyncMutex::new(streams_rx),
            datagrams: AsyncMutex::new(datagrams_rx),
            datagram_registered,
            end: end_rx,
        }
    }

    /// The session's ID: the HTTP/3 stream ID of its CONNECT request.
    pub fn id(&self) -> u64 {
        self.session_id
    }

    /// Pull the next peer-opened bidirectional stream.
    ///
    /// Resolves to `None` once the session's request stream has ended and no
    /// further streams will arrive.
    pub async fn accept_bi(&self) -> Option<Result<(SendStream, RecvStream), Error>> {
        let mut streams = self.streams.lock().await;
        loop {
            match streams.recv().await? {
                QueuedStream::Bi(send, recv) => {
                    return Some(Ok((SendStream::new(send), RecvStream::new(recv))))
                }
                QueuedStream::Uni(mut recv) => {
                    wire::abort_recv(&mut recv, proto::H3_STREAM_CREATION_ERROR);
                }
            }
        }
    }

    /// Pull the next peer-opened unidirectional stream.
    pub async fn accept_uni(&self) -> Option<Result<RecvStream, Error>> {
        let mut streams = self.streams.lock().await;
        loop {
            match streams.recv().await? {
                QueuedStream::Uni(recv) => return Some(Ok(RecvStream::new(recv))),
                QueuedStream::Bi(mut send, mut recv) => {
                    wire::abort_both(&mut send, &mut recv, proto::H3_STREAM_CREATION_ERROR);
                }
            }
        }
    }

    /// Open a new unidirectional stream to the peer, writing the
    /// `WEBTRANSPORT_STREAM` preamble immediately.
    pub async fn open_uni(&self) -> Result<SendStream, Error> {
        let send = self.handle.open_uni(self.session_id).await?;
        Ok(SendStream::new(send))
    }

    /// Open a new bidirectional stream to the peer, writing the
    /// `WEBTRANSPORT_STREAM` preamble immediately.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), Error> {
        let (send, recv) = self.handle.open_bi(self.session_id).await?;
        Ok((SendStream::new(send), RecvStream::new(recv)))
    }

    /// Send a datagram, prefixed with the session's quarter-ID varint.
    /// Requires that the peer has sent `REGISTER_DATAGRAM_NO_CONTEXT` first.
    pub async fn send_datagram(&self, payload: &[u8]) -> Result<(), Error> {
        if !self.datagram_registered.load(Ordering::SeqCst) {
            return Err(Error::InvalidOperation(
                "peer has not registered for datagrams on this session",
            ));
        }
        self.handle.send_datagram(self.session_id, payload).await
    }

    /// Receive the next datagram addressed to this session, payload only (the
    /// quarter-ID prefix has already been stripped by the connection).
    pub async fn receive_datagram(&self) -> Option<Bytes> {
        let mut datagrams = self.datagrams.lock().await;
        datagrams.recv().await
    }

    /// Close the session. `code == 0` with no message sends a bare FIN;
    /// otherwise a `CLOSE_WEBTRANSPORT_SESSION` capsule precedes it.
    pub async fn close(&self, code: u32, message: Option<&str>) -> Result<(), Error> {
        if let Some(message) = message {
            if message.len() > proto::MAX_CLOSE_MESSAGE {
                return Err(Error::ArgumentError("close message exceeds 1024 bytes"));
            }
        }

        let mut send = self.send.lock().await;
        if code == 0 && message.is_none() {
            send.finish()?;
            return Ok(());
        }

        let capsule = Capsule::CloseWebTransportSession {
            code,
            message: message.unwrap_or_default().to_string(),
        };
        let mut buf = Vec::new();
        capsule.encode(&mut buf);

        if let Err(e) = send.write_all(&buf).await {
            wire::abort_send(&mut send, proto::H3_REQUEST_CANCELLED);
            return Err(e.into());
        }
        send.finish()?;
        Ok(())
    }

    /// Wait for the session to end, returning the peer's close reason (or a
    /// synthesized graceful `(0, "")` if the request stream just ran out),
    /// or the error that tore it down.
    pub async fn closed(&self) -> EndResult {
        let mut end = self.end.clone();
        loop {
            if let Some(result) = end.borrow().clone() {
                return result;
            }
            if end.changed().await.is_err() {
                return Ok(CloseInfo {
                    code: 0,
                    message: String::new(),
                });
            }
        }
    }
}

async fn control_reader(
    handle: ConnectionHandle,
    session_id: u64,
    mut recv: quinn::RecvStream,
    datagram_registered: Arc<AtomicBool>,
    end: watch::Sender<Option<EndResult>>,
) {
    let result = loop {
        match wire::read_capsule(&mut recv).await {
            Ok(Capsule::RegisterDatagramNoContext) => {
                datagram_registered.store(true, Ordering::SeqCst);
            }
            Ok(Capsule::CloseWebTransportSession { code, message }) => {
                let mut trailing = [0u8; 1];
                match recv.read(&mut trailing).await {
                    Ok(None) => break Ok(CloseInfo { code, message }),
                    _ => {
                        break Err(Error::InvalidOperation(
                            "data followed the CLOSE_WEBTRANSPORT_SESSION capsule",
                        ))
                    }
                }
            }
            Ok(Capsule::Unknown { .. }) => continue,
            Err(Error::UnexpectedEof) => {
                break Ok(CloseInfo {
                    code: 0,
                    message: String::new(),
                })
            }
            Err(e @ Error::CloseMessageTooLong) => {
                wire::abort_recv(&mut recv, proto::H3_MESSAGE_ERROR);
                break Err(e);
            }
            Err(e) => {
                wire::abort_recv(&mut recv, proto::H3_GENERAL_PROTOCOL_ERROR);
                break Err(e);
            }
        }
    };

    let _ = end.send(Some(result));
    handle.remove_session(session_id);
}
