//! The handoff point between a parsed extended-CONNECT request and either an
//! established [`Session`] or a rejection.

use webtransport_proto::{self as proto};

use crate::connection::ConnectionHandle;
use crate::{wire, Error, Session};

/// A pending WebTransport session request, held until the application calls
/// [`AcceptRequest::accept`] or [`AcceptRequest::reject`]. Dropping it without
/// calling either rejects it.
pub struct AcceptRequest {
    handle: ConnectionHandle,
    stream_id: u64,
    authority: String,
    path: String,
    origin: String,
    version: String,
    streams: Option<(quinn::SendStream, quinn::RecvStream)>,
}

impl AcceptRequest {
    pub(crate) fn new(
        handle: ConnectionHandle,
        stream_id: u64,
        authority: String,
        path: String,
        origin: String,
        version: String,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        Self {
            handle,
            stream_id,
            authority,
            path,
            origin,
            version,
            streams: Some((send, recv)),
        }
    }

    /// The `:authority` pseudo-header of the CONNECT request.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The `:path` pseudo-header of the CONNECT request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `origin` header of the CONNECT request.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The negotiated `sec-webtransport-http3-draft` version suffix.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Accept the request: write a `200` response and register a new
    /// [`Session`] in the connection's session map under this request's
    /// stream id.
    pub async fn accept(mut self) -> Result<Session, Error> {
        let (mut send, recv) = self.streams.take().ok_or(Error::InvalidOperation(
            "request expired: accept/reject already called",
        ))?;

        let mut response = Vec::new();
        proto::encode_accept_response(&mut response, &self.version);
        if let Err(e) = send.write_all(&response).await {
            wire::abort_send(&mut send, proto::H3_INTERNAL_ERROR);
            return Err(e.into());
        }

        Ok(Session::new(
            self.handle.clone(),
            self.stream_id,
            send,
            recv,
        ))
    }

    /// Reject the request, aborting both stream sides with
    /// `H3_REQUEST_REJECTED`.
    pub fn reject(mut self) {
        if let Some((mut send, mut recv)) = self.streams.take() {
            wire::abort_both(&mut send, &mut recv, proto::H3_REQUEST_REJECTED);
        }
    }
}

impl Drop for AcceptRequest {
    fn drop(&mut self) {
        if let Some((mut send, mut recv)) = self.streams.take() {
            wire::abort_both(&mut send, &mut recv, proto::H3_REQUEST_REJECTED);
        }
    }
}
