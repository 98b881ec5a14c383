//! A server-side HTTP/3 + WebTransport engine built on top of [`quinn`].
//!
//! A single QUIC connection may multiplex any number of WebTransport
//! sessions, each one keyed by the stream ID of the extended-CONNECT request
//! that established it. [`Connection::accept`] drives the HTTP/3 handshake
//! and spawns the background tasks that classify incoming streams and route
//! datagrams; [`Connection::accept_request`] then yields one
//! [`AcceptRequest`] per extended-CONNECT attempt for the application to
//! accept or reject.

mod cert;
mod connection;
mod crypto;
mod error;
mod recv;
mod request;
mod send;
mod server;
mod session;
#[cfg(test)]
mod tests;
mod wire;

pub use cert::{CertOptions, CertRing, Clock, IssuedCert};
pub use connection::Connection;
pub use error::{Error, ReadExactError, ReadToEndError};
pub use recv::RecvStream;
pub use request::AcceptRequest;
pub use send::SendStream;
pub use server::{Server, ServerBuilder};
pub use session::{CloseInfo, Session};

/// The ALPN token negotiated for HTTP/3.
pub const ALPN: &[u8] = b"h3";
