use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{qpack, Frame, VarInt};

/// The draft-02 protocol version suffix this engine negotiates and advertises.
pub const DRAFT_SUFFIX: &str = "02";

#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("expected a HEADERS frame, got {0:?}")]
    UnexpectedFrame(Frame),

    #[error("qpack error: {0}")]
    Qpack(#[from] qpack::DecodeError),

    #[error("extended-CONNECT request is missing a required pseudo-header")]
    Incomplete,
}

/// The pseudo-headers of a parsed extended-CONNECT WebTransport request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub authority: String,
    pub path: String,
    pub origin: String,
    pub version: String,
}

impl ConnectRequest {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ConnectError> {
        let (typ, mut data) = Frame::read(buf).map_err(|_| ConnectError::UnexpectedEnd)?;
        if typ != Frame::HEADERS {
            return Err(ConnectError::UnexpectedFrame(typ));
        }

        let fields = qpack::RequestFields::decode(&mut data)?;
        if !fields.is_complete() {
            return Err(ConnectError::Incomplete);
        }

        Ok(Self {
            authority: fields.authority.unwrap(),
            path: fields.path.unwrap(),
            origin: fields.origin.unwrap(),
            version: fields.version.unwrap(),
        })
    }

    /// Encode this request as the HEADERS frame an extended-CONNECT client
    /// would send: the mirror image of [`Self::decode`]. Useful to any test
    /// harness driving this crate's server side with a synthesized client.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut tmp = Vec::new();
        tmp.push(0);
        tmp.push(0);

        qpack::encode_indexed_static(&mut tmp, 15); // :method CONNECT
        qpack::encode_indexed_static(&mut tmp, 23); // :scheme https
        qpack::encode_literal_with_literal_name(&mut tmp, ":authority", &self.authority);
        qpack::encode_literal_with_literal_name(&mut tmp, ":path", &self.path);
        qpack::encode_literal_with_literal_name(&mut tmp, ":protocol", "webtransport");
        qpack::encode_literal_with_literal_name(&mut tmp, "origin", &self.origin);
        qpack::encode_literal_with_literal_name(
            &mut tmp,
            &format!("sec-webtransport-http3-draft{}", self.version),
            "1",
        );

        Frame::HEADERS.encode(buf);
        VarInt::try_from(tmp.len()).unwrap().encode(buf);
        buf.put_slice(&tmp);
    }
}

/// The response header block sent by `accept()`: required-insert-count=0,
/// delta-base=0, indexed static field 25 (`:status 200`), then the version
/// header as a literal field with a literal name (no Huffman).
///
/// `version` is the draft suffix negotiated from the request (the
/// lexicographically greatest `sec-webtransport-http3-draft*` the client
/// offered), so the response always echoes back what the client asked for.
pub fn encode_accept_response<B: BufMut>(buf: &mut B, version: &str) {
    let mut tmp = Vec::new();
    tmp.push(0);
    tmp.push(0);

    qpack::encode_indexed_static(&mut tmp, 25);
    qpack::encode_literal_with_literal_name(
        &mut tmp,
        &format!("sec-webtransport-http3-draft{version}"),
        "1",
    );

    Frame::HEADERS.encode(buf);
    VarInt::try_from(tmp.len()).unwrap().encode(buf);
    buf.put_slice(&tmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_connect_request() {
        let request = ConnectRequest {
            authority: "example:4433".to_string(),
            path: "/test".to_string(),
            origin: "https://example".to_string(),
            version: "02".to_string(),
        };

        let mut buf = Vec::new();
        request.encode(&mut buf);

        let mut cursor = buf.as_slice();
        let decoded = ConnectRequest::decode(&mut cursor).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn accept_response_matches_wire_shape() {
        let mut buf = Vec::new();
        encode_accept_response(&mut buf, DRAFT_SUFFIX);

        assert_eq!(buf[0], Frame::HEADERS.0.into_inner() as u8);
    }
}
