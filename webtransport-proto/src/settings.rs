use std::collections::HashMap;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{Frame, StreamUni, VarInt, VarIntUnexpectedEnd};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Setting(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    H3_DATAGRAM = 0xffd277,
    ENABLE_WEBTRANSPORT = 0x2b603742,
}

impl std::fmt::Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Setting::H3_DATAGRAM => write!(f, "H3_DATAGRAM"),
            Setting::ENABLE_WEBTRANSPORT => write!(f, "ENABLE_WEBTRANSPORT"),
            x if x.is_grease() => write!(f, "GREASE[{:#x}]", x.0.into_inner()),
            x => write!(f, "UNKNOWN[{:#x}]", x.0.into_inner()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("control stream did not start with stream type 0, got {0:?}")]
    UnexpectedStreamType(StreamUni),

    #[error("expected a SETTINGS frame, got {0:?}")]
    UnexpectedFrame(Frame),

    #[error("malformed settings payload")]
    InvalidSize,
}

/// A map of SETTINGS ids to values, restricted to draft-02's two required ids.
#[derive(Default, Debug, Clone)]
pub struct Settings(HashMap<Setting, VarInt>);

/// The fixed byte sequence the server writes on its outbound control stream:
/// stream type 0, a SETTINGS frame enabling H3_DATAGRAM and WEBTRANSPORT.
pub const SERVER_SETTINGS_BYTES: [u8; 13] = [
    0x00, 0x04, 0x0A, 0x80, 0xFF, 0xD2, 0x77, 0x01, 0xAB, 0x60, 0x37, 0x42, 0x01,
];

impl Settings {
    pub fn enable_webtransport() -> Self {
        let mut settings = Settings::default();
        settings.0.insert(Setting::H3_DATAGRAM, VarInt::from_u32(1));
        settings
            .0
            .insert(Setting::ENABLE_WEBTRANSPORT, VarInt::from_u32(1));
        settings
    }

    /// Parse the SETTINGS frame body found after the control stream's leading
    /// stream-type varint and frame header have already been consumed.
    pub fn decode_frame<B: Buf>(mut data: B) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        while data.has_remaining() {
            let id = Setting::decode(&mut data).map_err(|_| SettingsError::InvalidSize)?;
            let value = VarInt::decode(&mut data).map_err(|_| SettingsError::InvalidSize)?;
            if !id.is_grease() {
                settings.0.insert(id, value);
            }
        }
        Ok(settings)
    }

    /// Read the peer control stream: stream type `0`, then one SETTINGS frame.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, SettingsError> {
        let typ = StreamUni::decode(buf).map_err(|_| SettingsError::UnexpectedEnd)?;
        if typ != StreamUni::CONTROL {
            return Err(SettingsError::UnexpectedStreamType(typ));
        }

        let (typ, data) = Frame::read(buf).map_err(|_| SettingsError::UnexpectedEnd)?;
        if typ != Frame::SETTINGS {
            return Err(SettingsError::UnexpectedFrame(typ));
        }

        Self::decode_frame(data)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        StreamUni::CONTROL.encode(buf);
        Frame::SETTINGS.encode(buf);

        let mut tmp = Vec::new();
        for (id, value) in &self.0 {
            id.encode(&mut tmp);
            value.encode(&mut tmp);
        }

        VarInt::from_u32(tmp.len() as u32).encode(buf);
        buf.put_slice(&tmp);
    }

    /// True once both ids required by draft-02 are present and set to 1.
    pub fn supports_webtransport(&self) -> bool {
        self.0.get(&Setting::H3_DATAGRAM).map(|v| v.into_inner()) == Some(1)
            && self
                .0
                .get(&Setting::ENABLE_WEBTRANSPORT)
                .map(|v| v.into_inner())
                == Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_settings_bytes_match_wire_spec() {
        let mut buf = Vec::new();
        Settings::enable_webtransport().encode(&mut buf);
        assert_eq!(buf, SERVER_SETTINGS_BYTES);
    }

    #[test]
    fn decode_server_settings_bytes() {
        let mut cursor = &SERVER_SETTINGS_BYTES[..];
        let settings = Settings::decode(&mut cursor).unwrap();
        assert!(settings.supports_webtransport());
        assert!(cursor.is_empty());
    }

    #[test]
    fn grease_ids_are_ignored() {
        let mut buf = Vec::new();
        Setting(VarInt::from_u32(0x40)).encode(&mut buf); // 0x40 - 0x21 = 0x1f -> grease
        VarInt::from_u32(12345).encode(&mut buf);

        let settings = Settings::decode_frame(buf.as_slice()).unwrap();
        assert!(!settings.supports_webtransport());
    }

    #[test]
    fn missing_required_id_does_not_support_webtransport() {
        let mut buf = Vec::new();
        Setting::H3_DATAGRAM.encode(&mut buf);
        VarInt::from_u32(1).encode(&mut buf);

        let settings = Settings::decode_frame(buf.as_slice()).unwrap();
        assert!(!settings.supports_webtransport());
    }
}
