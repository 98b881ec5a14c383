//! Named HTTP/3 + WebTransport application error codes, shared between the
//! QUIC transport's stream/connection aborts and the capsule-close protocol.
//!
//! These live in the ordinary HTTP/3 application error-code space (RFC 9114
//! section 8.1), not the legacy per-session remapped space used by earlier
//! WebTransport drafts.

pub const H3_NO_ERROR: u64 = 0x100;
pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
pub const H3_INTERNAL_ERROR: u64 = 0x102;
pub const H3_STREAM_CREATION_ERROR: u64 = 0x103;
pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x104;
pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
pub const H3_FRAME_ERROR: u64 = 0x106;
pub const H3_EXCESSIVE_LOAD: u64 = 0x107;
pub const H3_ID_ERROR: u64 = 0x108;
pub const H3_MISSING_SETTINGS: u64 = 0x10a;
pub const H3_REQUEST_REJECTED: u64 = 0x10b;
pub const H3_REQUEST_CANCELLED: u64 = 0x10c;
pub const H3_MESSAGE_ERROR: u64 = 0x10e;
pub const H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED: u64 = 0x3994bd84;

/// Reserved/grease code points: `(t - 0x21) % 0x1f == 0` for frame and stream
/// types, `41*N + 23` for capsules. Frame/stream grease is exposed as
/// `is_grease()` on the relevant wire types; this one covers the codes
/// themselves, useful when classifying a code from outside a `Frame`.
pub fn is_grease_code(code: u64) -> bool {
    if code < 0x21 {
        return false;
    }
    (code - 0x21) % 0x1f == 0
}
