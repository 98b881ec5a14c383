// A capsule is carried as the sole payload of an HTTP/3 DATA frame (draft-ietf-webtrans-http3-02
// section 4.1.1). We don't (yet) support a generic capsule stream; a caller reads exactly one
// capsule at a time from a bidirectional stream's buffered bytes, skipping any reserved/grease
// capsules it finds along the way.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::{Frame, VarInt, VarIntUnexpectedEnd};

pub const REGISTER_DATAGRAM_NO_CONTEXT: u64 = 0xff37a2;
pub const WEBTRANSPORT_DATAGRAM: u64 = 0xff7c00;
pub const CLOSE_WEBTRANSPORT_SESSION: u64 = 0x2843;

const RESERVED_CONTEXT_CAPSULES: [u64; 4] = [0xff37a1, 0xff37a3, 0xff37a4, 0xff37a5];

pub const MAX_CLOSE_MESSAGE: usize = 1024;
const MAX_CLOSE_CAPSULE: usize = 4 + MAX_CLOSE_MESSAGE;

/// Reserved capsule type, per the draft's extension mechanism: `41*N + 23`.
pub fn is_grease(capsule_type: u64) -> bool {
    capsule_type >= 23 && (capsule_type - 23) % 41 == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    RegisterDatagramNoContext,
    CloseWebTransportSession { code: u32, message: String },
    Unknown { typ: VarInt, payload: Bytes },
}

impl Capsule {
    /// Read the next meaningful capsule, transparently consuming any grease
    /// capsules that precede it.
    pub fn read<B: Buf>(buf: &mut B) -> Result<Self, CapsuleError> {
        loop {
            let (typ, mut payload) =
                Frame::read(buf).map_err(|_| CapsuleError::UnexpectedEnd)?;
            if typ != Frame::DATA {
                return Err(CapsuleError::UnexpectedFrame(typ));
            }

            let frame_length = payload.limit();

            let capsule_type = VarInt::decode(&mut payload)?;
            let capsule_length = VarInt::decode(&mut payload)?;
            let length = capsule_length.into_inner() as usize;

            let header_size = capsule_type.size() + capsule_length.size();
            if frame_length != header_size + length {
                return Err(CapsuleError::LengthMismatch);
            }

            let capsule_type = capsule_type.into_inner();

            if is_grease(capsule_type) {
                if payload.remaining() < length {
                    return Err(CapsuleError::UnexpectedEnd);
                }
                payload.advance(length);
                continue;
            }

            if RESERVED_CONTEXT_CAPSULES.contains(&capsule_type) {
                return Err(CapsuleError::ReservedType(capsule_type));
            }

            return match capsule_type {
                REGISTER_DATAGRAM_NO_CONTEXT => {
                    if length != 4 || payload.remaining() < 4 {
                        return Err(CapsuleError::NotSupported);
                    }
                    let format = VarInt::decode(&mut payload)
                        .map_err(|_| CapsuleError::NotSupported)?
                        .into_inner();
                    if format != WEBTRANSPORT_DATAGRAM {
                        return Err(CapsuleError::NotSupported);
                    }
                    Ok(Capsule::RegisterDatagramNoContext)
                }
                CLOSE_WEBTRANSPORT_SESSION => {
                    if length > MAX_CLOSE_CAPSULE {
                        return Err(CapsuleError::MessageTooLong);
                    }
                    if payload.remaining() < 4 || length < 4 {
                        return Err(CapsuleError::UnexpectedEnd);
                    }
                    let code = payload.get_u32();

                    let message_len = length - 4;
                    if payload.remaining() < message_len {
                        return Err(CapsuleError::UnexpectedEnd);
                    }
                    let mut message = vec![0u8; message_len];
                    payload.copy_to_slice(&mut message);
                    let message =
                        String::from_utf8(message).map_err(|_| CapsuleError::InvalidUtf8)?;

                    Ok(Capsule::CloseWebTransportSession { code, message })
                }
                typ => {
                    let mut bytes = vec![0u8; payload.remaining()];
                    payload.copy_to_slice(&mut bytes);
                    Ok(Capsule::Unknown {
                        typ: VarInt::from_u64(typ).map_err(|_| CapsuleError::LengthMismatch)?,
                        payload: Bytes::from(bytes),
                    })
                }
            };
        }
    }

    /// Encode this capsule wrapped in its carrying DATA frame.
    ///
    /// Callers are responsible for enforcing `message.len() <= MAX_CLOSE_MESSAGE`
    /// before encoding a close capsule; this never truncates.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut payload = Vec::new();

        match self {
            Self::RegisterDatagramNoContext => {
                VarInt::from_u64(REGISTER_DATAGRAM_NO_CONTEXT)
                    .unwrap()
                    .encode(&mut payload);
                VarInt::from_u32(4).encode(&mut payload);
                VarInt::from_u64(WEBTRANSPORT_DATAGRAM)
                    .unwrap()
                    .encode(&mut payload);
            }
            Self::CloseWebTransportSession { code, message } => {
                VarInt::from_u64(CLOSE_WEBTRANSPORT_SESSION)
                    .unwrap()
                    .encode(&mut payload);
                VarInt::from_u32((4 + message.len()) as u32).encode(&mut payload);
                payload.put_u32(*code);
                payload.extend_from_slice(message.as_bytes());
            }
            Self::Unknown { typ, payload: data } => {
                typ.encode(&mut payload);
                VarInt::try_from(data.len()).unwrap().encode(&mut payload);
                payload.extend_from_slice(data);
            }
        }

        Frame::DATA.encode(buf);
        VarInt::try_from(payload.len()).unwrap().encode(buf);
        buf.put_slice(&payload);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapsuleError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,

    #[error("expected a DATA frame, found {0:?}")]
    UnexpectedFrame(Frame),

    #[error("capsule length does not match the carrying frame's length")]
    LengthMismatch,

    #[error("capsule content is not supported")]
    NotSupported,

    #[error("close message exceeds the maximum size")]
    MessageTooLong,

    #[error("invalid utf-8 in close message")]
    InvalidUtf8,

    #[error("reserved draft capsule type: {0:#x}")]
    ReservedType(u64),

    #[error("varint decode error: {0}")]
    VarInt(#[from] VarIntUnexpectedEnd),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_roundtrip() {
        let original = Capsule::CloseWebTransportSession {
            code: 12345,
            message: "bye".to_string(),
        };

        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cursor = buf.as_slice();
        let decoded = Capsule::read(&mut cursor).unwrap();
        assert_eq!(original, decoded);
        assert!(cursor.is_empty());
    }

    #[test]
    fn close_empty_message() {
        let original = Capsule::CloseWebTransportSession {
            code: 0,
            message: String::new(),
        };

        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cursor = buf.as_slice();
        assert_eq!(Capsule::read(&mut cursor).unwrap(), original);
    }

    #[test]
    fn close_too_large_is_rejected() {
        let mut buf = Vec::new();
        Frame::DATA.encode(&mut buf);

        let mut payload = Vec::new();
        VarInt::from_u64(CLOSE_WEBTRANSPORT_SESSION)
            .unwrap()
            .encode(&mut payload);
        VarInt::from_u32(1200).encode(&mut payload);
        payload.extend(std::iter::repeat(0u8).take(1200));

        VarInt::try_from(payload.len()).unwrap().encode(&mut buf);
        buf.extend_from_slice(&payload);

        let mut cursor = buf.as_slice();
        assert_eq!(Capsule::read(&mut cursor), Err(CapsuleError::MessageTooLong));
    }

    #[test]
    fn invalid_utf8_message_is_rejected() {
        let mut buf = Vec::new();
        Frame::DATA.encode(&mut buf);

        let mut payload = Vec::new();
        VarInt::from_u64(CLOSE_WEBTRANSPORT_SESSION)
            .unwrap()
            .encode(&mut payload);
        VarInt::from_u32(5).encode(&mut payload);
        payload.put_u32(0);
        payload.push(0xff);

        VarInt::try_from(payload.len()).unwrap().encode(&mut buf);
        buf.extend_from_slice(&payload);

        let mut cursor = buf.as_slice();
        assert_eq!(Capsule::read(&mut cursor), Err(CapsuleError::InvalidUtf8));
    }

    #[test]
    fn register_datagram_no_context_roundtrip() {
        let original = Capsule::RegisterDatagramNoContext;
        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cursor = buf.as_slice();
        assert_eq!(Capsule::read(&mut cursor).unwrap(), original);
    }

    #[test]
    fn reserved_context_capsule_is_rejected() {
        let mut buf = Vec::new();
        Frame::DATA.encode(&mut buf);

        let mut payload = Vec::new();
        VarInt::from_u64(0xff37a1).unwrap().encode(&mut payload);
        VarInt::from_u32(0).encode(&mut payload);

        VarInt::try_from(payload.len()).unwrap().encode(&mut buf);
        buf.extend_from_slice(&payload);

        let mut cursor = buf.as_slice();
        assert_eq!(
            Capsule::read(&mut cursor),
            Err(CapsuleError::ReservedType(0xff37a1))
        );
    }

    #[test]
    fn grease_capsule_is_skipped() {
        let mut buf = Vec::new();

        // grease capsule: type 23 + 41*0 = 23
        Frame::DATA.encode(&mut buf);
        let mut grease_payload = Vec::new();
        VarInt::from_u64(23).unwrap().encode(&mut grease_payload);
        VarInt::from_u32(3).encode(&mut grease_payload);
        grease_payload.extend_from_slice(b"xyz");
        VarInt::try_from(grease_payload.len())
            .unwrap()
            .encode(&mut buf);
        buf.extend_from_slice(&grease_payload);

        Capsule::CloseWebTransportSession {
            code: 1,
            message: "ok".to_string(),
        }
        .encode(&mut buf);

        let mut cursor = buf.as_slice();
        let capsule = Capsule::read(&mut cursor).unwrap();
        assert_eq!(
            capsule,
            Capsule::CloseWebTransportSession {
                code: 1,
                message: "ok".to_string()
            }
        );
    }

    #[test]
    fn unknown_capsule_roundtrip() {
        let original = Capsule::Unknown {
            typ: VarInt::from_u64(0x9999).unwrap(),
            payload: Bytes::from_static(b"hi"),
        };

        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cursor = buf.as_slice();
        assert_eq!(Capsule::read(&mut cursor).unwrap(), original);
    }
}
