use thiserror::Error;

/// The unified error surface of the connection/session engine (see the error
/// kinds enumerated for the protocol core). A `PeerAbort` carries the raw H3
/// application error code the peer (or we) used to abort a stream/connection.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("header field too large")]
    HeaderFieldTooLarge,

    #[error("close message exceeds the capsule size limit")]
    CloseMessageTooLong,

    #[error("argument error: {0}")]
    ArgumentError(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("peer aborted with code {0:#x}")]
    PeerAbort(u64),

    #[error("varint out of range")]
    OutOfRange,

    #[error("quic connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("quic write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("quic read error: {0}")]
    Read(#[from] quinn::ReadError),

    #[error("quic closed stream: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("quic send-datagram error: {0}")]
    SendDatagram(#[from] quinn::SendDatagramError),

    #[error("io error: {0}")]
    Io(std::sync::Arc<std::io::Error>),

    #[error("rustls error: {0}")]
    Rustls(#[from] quinn::rustls::Error),
}

impl From<webtransport_proto::VarIntUnexpectedEnd> for Error {
    fn from(_: webtransport_proto::VarIntUnexpectedEnd) -> Self {
        Error::UnexpectedEof
    }
}

impl From<webtransport_proto::VarIntBoundsExceeded> for Error {
    fn from(_: webtransport_proto::VarIntBoundsExceeded) -> Self {
        Error::OutOfRange
    }
}

impl From<webtransport_proto::QpackError> for Error {
    fn from(e: webtransport_proto::QpackError) -> Self {
        use webtransport_proto::QpackError::*;
        match e {
            UnexpectedEnd => Error::UnexpectedEof,
            HeaderFieldTooLarge => Error::HeaderFieldTooLarge,
            WrongMethod => Error::InvalidOperation(":method must be CONNECT"),
            WrongScheme => Error::InvalidOperation(":scheme must be https"),
            WrongProtocol => Error::InvalidOperation(":protocol must be webtransport"),
            InvalidPreamble | DynamicReference | UnsupportedInstruction | InvalidUtf8
            | Huffman(_) => Error::InvalidData(e.to_string()),
        }
    }
}

impl From<webtransport_proto::ConnectError> for Error {
    fn from(e: webtransport_proto::ConnectError) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<webtransport_proto::CapsuleError> for Error {
    fn from(e: webtransport_proto::CapsuleError) -> Self {
        use webtransport_proto::CapsuleError::*;
        match e {
            UnexpectedEnd => Error::UnexpectedEof,
            MessageTooLong => Error::CloseMessageTooLong,
            NotSupported => Error::NotSupported("unrecognized datagram registration".into()),
            ReservedType(_) => Error::InvalidOperation("unexpected capsule type"),
            _ => Error::InvalidData(e.to_string()),
        }
    }
}

impl From<webtransport_proto::SettingsError> for Error {
    fn from(e: webtransport_proto::SettingsError) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(std::sync::Arc::new(e))
    }
}

/// An error returned by [`crate::RecvStream::read_exact`]. Mirrors
/// [`quinn::ReadExactError`] but folds the underlying read error into
/// [`Error`].
#[derive(Clone, Error, Debug)]
pub enum ReadExactError {
    #[error("finished early, read {0} bytes")]
    FinishedEarly(usize),

    #[error("read error: {0}")]
    Read(#[from] Error),
}

impl From<quinn::ReadExactError> for ReadExactError {
    fn from(e: quinn::ReadExactError) -> Self {
        match e {
            quinn::ReadExactError::FinishedEarly(n) => ReadExactError::FinishedEarly(n),
            quinn::ReadExactError::ReadError(e) => ReadExactError::Read(e.into()),
        }
    }
}

/// An error returned by [`crate::RecvStream::read_to_end`].
#[derive(Clone, Error, Debug)]
pub enum ReadToEndError {
    #[error("response too long")]
    TooLong,

    #[error("read error: {0}")]
    Read(#[from] Error),
}

impl From<quinn::ReadToEndError> for ReadToEndError {
    fn from(e: quinn::ReadToEndError) -> Self {
        match e {
            quinn::ReadToEndError::TooLong => ReadToEndError::TooLong,
            quinn::ReadToEndError::Read(e) => ReadToEndError::Read(e.into()),
        }
    }
}
