//! The per-QUIC-connection HTTP/3 + WebTransport state machine.
//!
//! A [`Connection`] owns the peer's inbound control stream, our own outbound
//! control stream, the map of live [`Session`](crate::Session)s keyed by their
//! request-stream id, and the GOAWAY watermarks. It is the sole mutator of
//! the session map: sessions themselves only ever read it indirectly, through
//! the [`ConnectionHandle`] they're handed at creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Buf, Bytes};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use webtransport_proto::{self as proto, Frame, StreamUni, VarInt};

use crate::{wire, AcceptRequest, Error};

/// No GOAWAY has been observed or sent; every new stream is still acceptable.
const UNBOUNDED: u64 = u64::MAX;

/// A stream the classifier has determined belongs to a known session, still
/// carrying its native quinn identity. The session unwraps it into our
/// [`crate::SendStream`]/[`crate::RecvStream`] when it's pulled off the queue.
pub(crate) enum QueuedStream {
    Bi(quinn::SendStream, quinn::RecvStream),
    Uni(quinn::RecvStream),
}

/// What the connection needs to hand a registered session: somewhere to push
/// newly classified peer-opened streams and routed datagrams.
pub(crate) struct SessionSlot {
    pub streams: mpsc::UnboundedSender<QueuedStream>,
    pub datagrams: mpsc::UnboundedSender<Bytes>,
}

/// A HEADERS frame seen on a fresh bidirectional stream, still unparsed.
/// Parsing (and the QPACK decode it implies) is deferred to whoever calls
/// [`Connection::accept_request`], so the classify loop never blocks on it.
pub(crate) struct PendingRequest {
    pub header_block_size: u64,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
}

struct Shared {
    conn: quinn::Connection,
    sessions: StdMutex<HashMap<u64, SessionSlot>>,
    control_send: AsyncMutex<quinn::SendStream>,
    peer_goaway: AtomicU64,
    local_goaway: AtomicU64,
    last_accepted_stream_id: AtomicU64,
    goaway_sent: AtomicBool,
}

/// A cheap, cloneable handle into the connection engine. Held by every
/// [`Session`](crate::Session) and [`AcceptRequest`] so they can open new
/// streams, send datagrams, and register/deregister themselves without
/// needing a reference back to the owning [`Connection`] (which would form a
/// cycle: the connection owns its sessions via the map, so the sessions only
/// get a non-owning handle).
#[derive(Clone)]
pub(crate) struct ConnectionHandle(Arc<Shared>);

impl ConnectionHandle {
    pub fn quic(&self) -> &quinn::Connection {
        &self.0.conn
    }

    pub fn register_session(
        &self,
        stream_id: u64,
        streams: mpsc::UnboundedSender<QueuedStream>,
        datagrams: mpsc::UnboundedSender<Bytes>,
    ) {
        self.0
            .sessions
            .lock()
            .unwrap()
            .insert(stream_id, SessionSlot { streams, datagrams });
    }

    pub fn remove_session(&self, stream_id: u64) {
        self.0.sessions.lock().unwrap().remove(&stream_id);
    }

    pub async fn send_datagram(&self, session_id: u64, payload: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(8 + payload.len());
        VarInt::try_from(session_id / 4)?.encode(&mut buf);
        buf.extend_from_slice(payload);
        self.0.conn.send_datagram(Bytes::from(buf))?;
        Ok(())
    }

    pub async fn open_uni(&self, session_id: u64) -> Result<quinn::SendStream, Error> {
        let mut send = self.0.conn.open_uni().await?;
        let mut header = Vec::new();
        StreamUni::WEBTRANSPORT.encode(&mut header);
        VarInt::try_from(session_id)?.encode(&mut header);
        if let Err(e) = send.write_all(&header).await {
            wire::abort_send(&mut send, error_code(&e));
            return Err(e.into());
        }
        Ok(send)
    }

    pub async fn open_bi(
        &self,
        session_id: u64,
    ) -> Result<(quinn::SendStream, quinn::RecvStream), Error> {
        let (mut send, mut recv) = self.0.conn.open_bi().await?;
        let mut header = Vec::new();
        Frame::WEBTRANSPORT.encode(&mut header);
        VarInt::try_from(session_id)?.encode(&mut header);
        if let Err(e) = send.write_all(&header).await {
            wire::abort_both(&mut send, &mut recv, error_code(&e));
            return Err(e.into());
        }
        Ok((send, recv))
    }
}

fn error_code(_e: &quinn::WriteError) -> u64 {
    proto::H3_INTERNAL_ERROR
}

/// A server-side HTTP/3 connection, multiplexing zero or more WebTransport
/// sessions over a single QUIC connection.
pub struct Connection {
    handle: ConnectionHandle,
    requests: AsyncMutex<mpsc::UnboundedReceiver<PendingRequest>>,
}

impl Connection {
    /// Perform the HTTP/3 + WebTransport handshake on a freshly accepted QUIC
    /// connection (ALPN already negotiated to `h3` by the transport layer)
    /// and spawn the tasks that drive it for its lifetime.
    pub async fn accept(conn: quinn::Connection) -> Result<Self, Error> {
        let mut peer_control = conn.accept_uni().await?;
        let stream_type = wire::read_varint(&mut peer_control).await?;
        if stream_type != StreamUni::CONTROL.0 {
            wire::abort_recv(&mut peer_control, proto::H3_STREAM_CREATION_ERROR);
            return Err(Error::InvalidData(
                "peer control stream did not start with stream type 0".into(),
            ));
        }

        let (typ, len) = wire::read_frame_header(&mut peer_control).await?;
        if typ != Frame::SETTINGS {
            wire::abort_recv(&mut peer_control, proto::H3_MISSING_SETTINGS);
            return Err(Error::InvalidData("expected a SETTINGS frame".into()));
        }
        let mut body = vec![0u8; len as usize];
        wire::read_exact(&mut peer_control, &mut body).await?;
        let settings = proto::Settings::decode_frame(body.as_slice())?;
        if !settings.supports_webtransport() {
            wire::abort_recv(&mut peer_control, proto::H3_MISSING_SETTINGS);
            return Err(Error::InvalidData(
                "peer did not enable H3_DATAGRAM and WEBTRANSPORT".into(),
            ));
        }

        let mut control_send = conn.open_uni().await?;
        control_send
            .write_all(&proto::SERVER_SETTINGS_BYTES)
            .await?;

        let shared = Arc::new(Shared {
            conn: conn.clone(),
            sessions: StdMutex::new(HashMap::new()),
            control_send: AsyncMutex::new(control_send),
            peer_goaway: AtomicU64::new(UNBOUNDED),
            local_goaway: AtomicU64::new(UNBOUNDED),
            last_accepted_stream_id: AtomicU64::new(0),
            goaway_sent: AtomicBool::new(false),
        });
        let handle = ConnectionHandle(shared);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        tokio::spawn(control_reader(handle.clone(), peer_control));
        tokio::spawn(classify_loop(handle.clone(), requests_tx));
        tokio::spawn(datagram_loop(handle.clone()));

        Ok(Self {
            handle,
            requests: AsyncMutex::new(requests_rx),
        })
    }

    /// Pull the next extended-CONNECT request off the FIFO, parsing its
    /// QPACK header block lazily. Requests that fail to parse or don't meet
    /// the acceptance predicate are aborted and skipped; the connection
    /// itself survives.
    pub async fn accept_request(&self) -> Option<AcceptRequest> {
        let mut requests = self.requests.lock().await;
        loop {
            let pending = requests.recv().await?;
            let PendingRequest {
                header_block_size,
                mut send,
                mut recv,
            } = pending;

            let mut body = vec![0u8; header_block_size as usize];
            if wire::read_exact(&mut recv, &mut body).await.is_err() {
                wire::abort_both(&mut send, &mut recv, proto::H3_GENERAL_PROTOCOL_ERROR);
                continue;
            }

            let fields = match proto::RequestFields::decode(&mut body.as_slice()) {
                Ok(fields) if fields.is_complete() => fields,
                _ => {
                    wire::abort_both(&mut send, &mut recv, proto::H3_GENERAL_PROTOCOL_ERROR);
                    continue;
                }
            };

            let stream_id: u64 = send.id().into();
            return Some(AcceptRequest::new(
                self.handle.clone(),
                stream_id,
                fields.authority.unwrap(),
                fields.path.unwrap(),
                fields.origin.unwrap(),
                fields.version.unwrap(),
                send,
                recv,
            ));
        }
    }

    /// Begin graceful shutdown: advertise the last stream id we accepted and
    /// refuse anything opened after it. May only be called once.
    pub async fn goaway(&self) -> Result<(), Error> {
        if self
            .handle
            .0
            .goaway_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::InvalidOperation("GOAWAY already sent"));
        }

        let last = self.handle.0.last_accepted_stream_id.load(Ordering::SeqCst);
        self.handle.0.local_goaway.store(last, Ordering::SeqCst);

        let mut buf = Vec::new();
        Frame::GOAWAY.encode(&mut buf);
        let mut body = Vec::new();
        VarInt::try_from(last)?.encode(&mut body);
        VarInt::try_from(body.len())?.encode(&mut buf);
        buf.extend_from_slice(&body);

        let mut control = self.handle.0.control_send.lock().await;
        control.write_all(&buf).await?;
        Ok(())
    }

    /// Wait for the underlying QUIC connection to close.
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.handle.0.conn.closed().await
    }
}

async fn control_reader(handle: ConnectionHandle, mut recv: quinn::RecvStream) {
    loop {
        let (typ, len) = match wire::read_frame_header(&mut recv).await {
            Ok(v) => v,
            Err(_) => {
                handle
                    .0
                    .conn
                    .close(proto::H3_CLOSED_CRITICAL_STREAM.try_into().unwrap(), b"");
                return;
            }
        };

        if typ != Frame::GOAWAY {
            // Any other frame on the control stream is skipped; only GOAWAY
            // and grease (already filtered by `read_frame_header`) matter
            // here, so treat the rest as opaque.
            if wire::drop_exact(&mut recv, len as usize).await.is_err() {
                return;
            }
            continue;
        }

        let mut body = vec![0u8; len as usize];
        if wire::read_exact(&mut recv, &mut body).await.is_err() {
            return;
        }
        let id = match VarInt::decode(&mut body.as_slice()) {
            Ok(id) => id.into_inner(),
            Err(_) => {
                handle
                    .0
                    .conn
                    .close(proto::H3_FRAME_ERROR.try_into().unwrap(), b"");
                return;
            }
        };

        let prev = handle.0.peer_goaway.load(Ordering::SeqCst);
        if id > prev {
            handle
                .0
                .conn
                .close(proto::H3_ID_ERROR.try_into().unwrap(), b"");
            return;
        }
        handle.0.peer_goaway.store(id, Ordering::SeqCst);
    }
}

async fn classify_loop(handle: ConnectionHandle, requests: mpsc::UnboundedSender<PendingRequest>) {
    loop {
        tokio::select! {
            bi = handle.0.conn.accept_bi() => {
                let Ok((send, recv)) = bi else { return };
                tokio::spawn(classify_bi(handle.clone(), requests.clone(), send, recv));
            }
            uni = handle.0.conn.accept_uni() => {
                let Ok(recv) = uni else { return };
                tokio::spawn(classify_uni(handle.clone(), recv));
            }
        }
    }
}

fn record_accepted(handle: &ConnectionHandle, id: u64) -> bool {
    handle
        .0
        .last_accepted_stream_id
        .fetch_max(id, Ordering::SeqCst);
    id <= handle.0.local_goaway.load(Ordering::SeqCst)
}

async fn classify_bi(
    handle: ConnectionHandle,
    requests: mpsc::UnboundedSender<PendingRequest>,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) {
    let id: u64 = send.id().into();
    if !record_accepted(&handle, id) {
        wire::abort_both(&mut send, &mut recv, proto::H3_REQUEST_REJECTED);
        return;
    }

    let (typ, len) = match wire::read_frame_header_bidi(&mut send, &mut recv).await {
        Ok(v) => v,
        Err(_) => return,
    };

    if typ == Frame::WEBTRANSPORT {
        // draft's two-varint form: WEBTRANSPORT_STREAM type, then a bare
        // session-id varint with no length field. We've already consumed a
        // varint as `len` above by reusing the frame-header reader; treat it
        // as the session id directly, per this crate's reading of the draft.
        let session_id = len;
        route_bi(&handle, session_id, send, recv);
        return;
    }

    if typ == Frame::HEADERS {
        if let Err(mpsc::error::SendError(PendingRequest {
            mut send,
            mut recv,
            ..
        })) = requests.send(PendingRequest {
            header_block_size: len,
            send,
            recv,
        }) {
            // The request FIFO's receiver is gone: the connection is shutting
            // down, or the queue has no room left for more pending requests.
            wire::abort_both(&mut send, &mut recv, proto::H3_EXCESSIVE_LOAD);
        }
        return;
    }

    wire::abort_both(&mut send, &mut recv, proto::H3_FRAME_UNEXPECTED);
}

async fn classify_uni(handle: ConnectionHandle, mut recv: quinn::RecvStream) {
    let id: u64 = recv.id().into();
    if !record_accepted(&handle, id) {
        wire::abort_recv(&mut recv, proto::H3_REQUEST_REJECTED);
        return;
    }

    let typ = match wire::read_varint(&mut recv).await {
        Ok(t) => t,
        Err(_) => return,
    };
    let stream_type = StreamUni(typ);

    if stream_type == StreamUni::WEBTRANSPORT {
        let session_id = match wire::read_varint(&mut recv).await {
            Ok(v) => v.into_inner(),
            Err(_) => return,
        };
        route_uni(&handle, session_id, recv);
        return;
    }

    if stream_type.is_grease() {
        wire::abort_recv(&mut recv, stream_type.0.into_inner());
        return;
    }

    wire::abort_recv(&mut recv, proto::H3_STREAM_CREATION_ERROR);
}

fn route_bi(
    handle: &ConnectionHandle,
    session_id: u64,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
) {
    let sender = {
        let sessions = handle.0.sessions.lock().unwrap();
        sessions.get(&session_id).map(|slot| slot.streams.clone())
    };

    let Some(sender) = sender else {
        let (mut send, mut recv) = (send, recv);
        wire::abort_both(&mut send, &mut recv, proto::H3_ID_ERROR);
        return;
    };

    if let Err(mpsc::error::SendError(queued)) = sender.send(QueuedStream::Bi(send, recv)) {
        // The session task exited between our lookup and this send; abort
        // the stream rather than leaving it dangling.
        if let QueuedStream::Bi(mut send, mut recv) = queued {
            wire::abort_both(
                &mut send,
                &mut recv,
                proto::H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED,
            );
        }
    }
}

fn route_uni(handle: &ConnectionHandle, session_id: u64, recv: quinn::RecvStream) {
    let sender = {
        let sessions = handle.0.sessions.lock().unwrap();
        sessions.get(&session_id).map(|slot| slot.streams.clone())
    };

    let Some(sender) = sender else {
        let mut recv = recv;
        wire::abort_recv(&mut recv, proto::H3_ID_ERROR);
        return;
    };

    if let Err(mpsc::error::SendError(queued)) = sender.send(QueuedStream::Uni(recv)) {
        if let QueuedStream::Uni(mut recv) = queued {
            wire::abort_recv(&mut recv, proto::H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED);
        }
    }
}

async fn datagram_loop(handle: ConnectionHandle) {
    loop {
        let datagram = match handle.0.conn.read_datagram().await {
            Ok(d) => d,
            Err(_) => return,
        };

        let mut cursor = datagram.as_ref();
        let qid = match VarInt::decode(&mut cursor) {
            Ok(v) => v.into_inner(),
            Err(_) => continue,
        };
        let consumed = datagram.len() - cursor.remaining();
        let session_id = qid * 4;

        let sessions = handle.0.sessions.lock().unwrap();
        if let Some(slot) = sessions.get(&session_id) {
            let payload = datagram.slice(consumed..);
            let _ = slot.datagrams.send(payload);
        }
        // Unknown session id: silently dropped, per spec.
    }
}
