use bytes::{buf::Take, Buf, BufMut};

use crate::{VarInt, VarIntUnexpectedEnd};

/// An HTTP/3 frame type, sent as the first varint on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(pub VarInt);

impl Frame {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Frame(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    /// Read a `(type, length)` frame header and return the type along with a
    /// `Buf` limited to exactly `length` bytes of payload.
    ///
    /// Callers are expected to consume the returned payload fully; a frame
    /// whose payload wasn't entirely read is a protocol error, since frame
    /// boundaries must be preserved.
    pub fn read<B: Buf>(buf: &mut B) -> Result<(Self, Take<&mut B>), VarIntUnexpectedEnd> {
        let typ = Frame::decode(buf)?;
        let len = VarInt::decode(buf)?;

        let len = len.into_inner() as usize;
        if buf.remaining() < len {
            return Err(VarIntUnexpectedEnd);
        }

        Ok((typ, buf.take(len)))
    }

    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

macro_rules! frames {
    {$($name:ident = $val:expr,)*} => {
        impl Frame {
            $(pub const $name: Frame = Frame(VarInt::from_u32($val));)*
        }
    }
}

frames! {
    DATA = 0x00,
    HEADERS = 0x01,
    SETTINGS = 0x04,
    GOAWAY = 0x07,
    WEBTRANSPORT = 0x41,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_exact_payload() {
        let mut buf = Vec::new();
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(3).encode(&mut buf);
        buf.extend_from_slice(b"abc");

        let mut cursor = buf.as_slice();
        let (typ, mut payload) = Frame::read(&mut cursor).unwrap();
        assert_eq!(typ, Frame::DATA);
        assert_eq!(payload.remaining(), 3);
        let mut out = vec![0u8; 3];
        payload.copy_to_slice(&mut out);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn grease_frame_types() {
        assert!(Frame(VarInt::from_u32(0x21)).is_grease());
        assert!(Frame(VarInt::from_u32(0x40)).is_grease());
        assert!(!Frame::DATA.is_grease());
        assert!(!Frame::WEBTRANSPORT.is_grease());
    }

    #[test]
    fn short_payload_is_error() {
        let mut buf = Vec::new();
        Frame::DATA.encode(&mut buf);
        VarInt::from_u32(10).encode(&mut buf);
        buf.extend_from_slice(b"ab");

        let mut cursor = buf.as_slice();
        assert!(Frame::read(&mut cursor).is_err());
    }
}
