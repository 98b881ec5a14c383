// Minimal QPACK: static table and literals only, no dynamic table.
//
// This is sufficient (and only sufficient) for decoding a single extended-CONNECT
// request header block and encoding the matching response header block. Refusing
// to acknowledge the QPACK encoder lets us skip the dynamic table entirely.

use bytes::Buf;
use thiserror::Error;

use crate::huffman::{self, HpackStringDecode};

const MAX_LITERAL_LEN: usize = 8192;
const MAX_DECODED_LEN: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of header block")]
    UnexpectedEnd,

    #[error("required insert count and delta base must be zero")]
    InvalidPreamble,

    #[error("reference to the dynamic table, which is not supported")]
    DynamicReference,

    #[error("unsupported QPACK instruction")]
    UnsupportedInstruction,

    #[error("header field literal exceeds the maximum size")]
    HeaderFieldTooLarge,

    #[error("invalid utf-8 in header field")]
    InvalidUtf8,

    #[error("huffman decode error: {0}")]
    Huffman(String),

    #[error(":method must be CONNECT")]
    WrongMethod,

    #[error(":scheme must be https")]
    WrongScheme,

    #[error(":protocol must be webtransport")]
    WrongProtocol,
}

impl From<huffman::Error> for DecodeError {
    fn from(e: huffman::Error) -> Self {
        DecodeError::Huffman(e.to_string())
    }
}

/// The pseudo-headers of an extended-CONNECT WebTransport request, accumulated
/// while walking a literal/static-only QPACK header block.
#[derive(Debug, Default, Clone)]
pub struct RequestFields {
    pub scheme: Option<String>,
    pub method_connect: Option<bool>,
    pub protocol: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub origin: Option<String>,
    pub version: Option<String>,
}

impl RequestFields {
    /// True once every pseudo-header required by the extended-CONNECT acceptance
    /// predicate has been observed.
    pub fn is_complete(&self) -> bool {
        self.scheme.as_deref() == Some("https")
            && self.method_connect == Some(true)
            && self.protocol.as_deref() == Some("webtransport")
            && self.version.is_some()
            && self.authority.is_some()
            && self.path.is_some()
            && self.origin.is_some()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        if buf.remaining() < 2 {
            return Err(DecodeError::UnexpectedEnd);
        }
        if buf.get_u8() != 0 || buf.get_u8() != 0 {
            return Err(DecodeError::InvalidPreamble);
        }

        let mut fields = RequestFields::default();

        while buf.has_remaining() {
            let first = peek_u8(buf)?;

            if first & 0xc0 == 0xc0 {
                let index = decode_prefix_int(buf, 6)?;
                match index {
                    1 => fields.path = Some("/".to_string()),
                    15 => fields.method_connect = Some(true),
                    16..=21 => return Err(DecodeError::WrongMethod),
                    22 => return Err(DecodeError::WrongScheme),
                    23 => fields.scheme = Some("https".to_string()),
                    _ => {} // recognized-but-uninteresting or unknown: nothing to store
                }
            } else if first & 0xc0 == 0x40 {
                let is_static = first & 0x10 != 0;
                if !is_static {
                    return Err(DecodeError::DynamicReference);
                }

                let index = decode_prefix_int(buf, 4)?;
                let value = decode_string(buf)?;

                match index {
                    0 => fields.authority = Some(value),
                    1 => fields.path = Some(value),
                    90 => fields.origin = Some(value),
                    _ => {}
                }
            } else if first & 0xe0 == 0x20 {
                let name_huffman = first & 0x08 != 0;
                let name_len = decode_prefix_int(buf, 3)? as usize;
                let name = decode_literal(buf, name_len, name_huffman)?;

                let value = decode_string(buf)?;

                if name == ":protocol" {
                    if value != "webtransport" {
                        return Err(DecodeError::WrongProtocol);
                    }
                    fields.protocol = Some(value);
                } else if name == ":authority" {
                    fields.authority = Some(value);
                } else if name == ":path" {
                    fields.path = Some(value);
                } else if name == "origin" {
                    fields.origin = Some(value);
                } else if let Some(suffix) = name.strip_prefix("sec-webtransport-http3-draft") {
                    if value == "1" {
                        fields.version = match fields.version.take() {
                            Some(best) if best >= suffix => Some(best),
                            _ => Some(suffix.to_string()),
                        };
                    }
                }
                // other literal-named fields are read (to stay aligned with the
                // stream) and otherwise ignored.
            } else {
                return Err(DecodeError::UnsupportedInstruction);
            }
        }

        Ok(fields)
    }
}

fn peek_u8<B: Buf>(buf: &B) -> Result<u8, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.chunk()[0])
}

/// HPACK-style prefixed integer: the low `prefix_bits` of the already-peeked
/// first byte hold the value (or, if all set, a continuation follows).
fn decode_prefix_int<B: Buf>(buf: &mut B, prefix_bits: u32) -> Result<u64, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::UnexpectedEnd);
    }

    let mask = (1u8 << prefix_bits) - 1;
    let first = buf.get_u8();
    let mut value = (first & mask) as u64;

    if value < mask as u64 {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let byte = buf.get_u8();
        value += ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::HeaderFieldTooLarge);
        }
    }

    Ok(value)
}

/// Decode a 7-bit-prefixed (Huffman-flagged) string literal.
fn decode_string<B: Buf>(buf: &mut B) -> Result<String, DecodeError> {
    let first = peek_u8(buf)?;
    let huffman = first & 0x80 != 0;
    let len = decode_prefix_int(buf, 7)? as usize;
    decode_literal(buf, len, huffman)
}

fn decode_literal<B: Buf>(buf: &mut B, len: usize, huffman: bool) -> Result<String, DecodeError> {
    if len > MAX_LITERAL_LEN {
        return Err(DecodeError::HeaderFieldTooLarge);
    }
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEnd);
    }

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);

    let decoded = if huffman {
        raw.hpack_decode().collect::<Result<Vec<u8>, _>>()?
    } else {
        raw
    };

    if decoded.len() > MAX_DECODED_LEN {
        return Err(DecodeError::HeaderFieldTooLarge);
    }

    String::from_utf8(decoded).map_err(|_| DecodeError::InvalidUtf8)
}

/// Encode `required insert count = 0, delta base = 0`, followed by the indexed
/// static field at `index` (top two bits `11`, 6-bit prefix).
pub fn encode_indexed_static(buf: &mut Vec<u8>, index: u64) {
    encode_prefix_int(buf, 0xc0, 6, index);
}

/// Encode a literal field with a literal name, without Huffman coding.
pub fn encode_literal_with_literal_name(buf: &mut Vec<u8>, name: &str, value: &str) {
    encode_prefix_int(buf, 0x20, 3, name.len() as u64);
    buf.extend_from_slice(name.as_bytes());

    encode_prefix_int(buf, 0x00, 7, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

fn encode_prefix_int(buf: &mut Vec<u8>, pattern: u8, prefix_bits: u32, value: u64) {
    let mask = (1u8 << prefix_bits) - 1;

    if value < mask as u64 {
        buf.push(pattern | value as u8);
        return;
    }

    buf.push(pattern | mask);
    let mut value = value - mask as u64;
    while value >= 0x80 {
        buf.push(((value & 0x7f) | 0x80) as u8);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request_block() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0);
        buf.push(0);

        encode_indexed_static(&mut buf, 15); // :method CONNECT
        encode_indexed_static(&mut buf, 23); // :scheme https

        encode_literal_with_literal_name(&mut buf, ":authority", "example:4433");
        encode_literal_with_literal_name(&mut buf, ":path", "/test");
        encode_literal_with_literal_name(&mut buf, ":protocol", "webtransport");
        encode_literal_with_literal_name(&mut buf, "origin", "https://example");
        encode_literal_with_literal_name(&mut buf, "sec-webtransport-http3-draft02", "1");

        buf
    }

    #[test]
    fn decodes_connect_request() {
        let block = connect_request_block();
        let mut cursor = block.as_slice();
        let fields = RequestFields::decode(&mut cursor).unwrap();

        assert_eq!(fields.scheme.as_deref(), Some("https"));
        assert_eq!(fields.method_connect, Some(true));
        assert_eq!(fields.protocol.as_deref(), Some("webtransport"));
        assert_eq!(fields.version.as_deref(), Some("02"));
        assert!(fields.is_complete());
    }

    #[test]
    fn rejects_non_connect_method() {
        let mut buf = vec![0, 0];
        encode_indexed_static(&mut buf, 16);

        let mut cursor = buf.as_slice();
        assert_eq!(
            RequestFields::decode(&mut cursor),
            Err(DecodeError::WrongMethod)
        );
    }

    #[test]
    fn rejects_plain_http_scheme() {
        let mut buf = vec![0, 0];
        encode_indexed_static(&mut buf, 22);

        let mut cursor = buf.as_slice();
        assert_eq!(
            RequestFields::decode(&mut cursor),
            Err(DecodeError::WrongScheme)
        );
    }

    #[test]
    fn rejects_bad_preamble() {
        let buf = vec![1, 0];
        let mut cursor = buf.as_slice();
        assert_eq!(
            RequestFields::decode(&mut cursor),
            Err(DecodeError::InvalidPreamble)
        );
    }

    #[test]
    fn rejects_dynamic_table_reference() {
        let mut buf = vec![0, 0];
        // literal with name reference, dynamic (T bit unset)
        buf.push(0x40);
        buf.push(0); // zero-length value

        let mut cursor = buf.as_slice();
        assert_eq!(
            RequestFields::decode(&mut cursor),
            Err(DecodeError::DynamicReference)
        );
    }

    #[test]
    fn picks_lexicographically_greatest_version() {
        let mut buf = vec![0, 0];
        encode_literal_with_literal_name(&mut buf, "sec-webtransport-http3-draft02", "1");
        encode_literal_with_literal_name(&mut buf, "sec-webtransport-http3-draft07", "1");
        encode_literal_with_literal_name(&mut buf, "sec-webtransport-http3-draft03", "1");

        let mut cursor = buf.as_slice();
        let fields = RequestFields::decode(&mut cursor).unwrap();
        assert_eq!(fields.version.as_deref(), Some("07"));
    }

    #[test]
    fn response_header_block_matches_wire_shape() {
        let mut buf = Vec::new();
        buf.push(0);
        buf.push(0);
        encode_indexed_static(&mut buf, 25);
        encode_literal_with_literal_name(&mut buf, "sec-webtransport-http3-draft02", "1");

        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 0);
        assert_eq!(buf[2], 0xc0 | 25);
    }
}
