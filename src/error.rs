//! strongly typed library error with stable string codes.

use std::{convert::Infallible, error, fmt, io, sync::Arc};

/// error type emitted to request handlers and returned from client operations.
///
/// every variant maps to a stable identifier via [Error::code], so callers can
/// match on failure classes without depending on enum layout.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// request options or client configuration failed validation.
    InvalidArgument(String),
    /// per phase timeout. see [TimeoutError] for the phase.
    Timeout(TimeoutError),
    /// the request was aborted by its abort signal.
    Aborted,
    /// the client was destroyed before the request could complete.
    Destroyed,
    /// the client was closed and no longer accepts new requests.
    Closed,
    /// socket level failure. connect errors, resets and early EOF land here.
    Socket(SocketError),
    /// non failure connection teardown, e.g. protocol upgrade or servername change.
    Informational(&'static str),
    /// response header section exceeded the configured cap.
    HeadersOverflow,
    /// response advertised trailers that never arrived.
    TrailerMismatch,
    /// request body byte count diverged from the declared content-length.
    ContentLengthMismatch,
    /// the operation is recognized but deliberately unsupported.
    NotSupported(&'static str),
    /// malformed response bytes. carries an `HPE_` prefixed parser code.
    Parse(ParseError),
    /// tls handshake failure.
    Tls(TlsError),
    /// opaque error propagated from a caller supplied body stream.
    Std(Arc<dyn error::Error + Send + Sync>),
}

impl Error {
    /// stable string identifier for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "UND_ERR_INVALID_ARG",
            Self::Timeout(t) => t.code(),
            Self::Aborted => "UND_ERR_ABORTED",
            Self::Destroyed => "UND_ERR_DESTROYED",
            Self::Closed => "UND_ERR_CLOSED",
            Self::Socket(_) => "UND_ERR_SOCKET",
            Self::Informational(_) => "UND_ERR_INFO",
            Self::HeadersOverflow => "UND_ERR_HEADERS_OVERFLOW",
            Self::TrailerMismatch => "UND_ERR_TRAILER_MISMATCH",
            Self::ContentLengthMismatch => "UND_ERR_CONTENT_LENGTH_MISMATCH",
            Self::NotSupported(_) => "UND_ERR_NOT_SUPPORTED",
            Self::Parse(p) => p.code,
            Self::Tls(TlsError::AltNameInvalid) => "ERR_TLS_CERT_ALTNAME_INVALID",
            Self::Tls(TlsError::Other(_)) => "UND_ERR_SOCKET",
            Self::Std(_) => "UND_ERR_SOCKET",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn socket_msg(msg: &'static str) -> Self {
        Self::Socket(SocketError {
            message: msg.into(),
            source: None,
        })
    }

    /// whether the failure class is transient at the socket layer. transient
    /// failures leave queued requests in place for a reconnect attempt,
    /// anything else fails the whole backlog when nothing is running.
    pub(crate) fn is_transient_socket(&self) -> bool {
        match self {
            Self::Informational(_) => true,
            Self::Socket(e) => match e.source.as_deref().map(io::Error::kind) {
                Some(
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::BrokenPipe,
                ) => true,
                Some(_) => false,
                // resets and early EOF recorded without an io source.
                None => true,
            },
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Timeout(t) => fmt::Display::fmt(t, f),
            Self::Aborted => f.write_str("request aborted"),
            Self::Destroyed => f.write_str("the client is destroyed"),
            Self::Closed => f.write_str("the client is closed"),
            Self::Socket(e) => fmt::Display::fmt(e, f),
            Self::Informational(msg) => f.write_str(msg),
            Self::HeadersOverflow => f.write_str("response header section exceeds configured size"),
            Self::TrailerMismatch => f.write_str("advertised trailers missing from response"),
            Self::ContentLengthMismatch => f.write_str("request body does not match declared content-length"),
            Self::NotSupported(msg) => write!(f, "{msg} is not supported"),
            Self::Parse(p) => fmt::Display::fmt(p, f),
            Self::Tls(t) => fmt::Display::fmt(t, f),
            Self::Std(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Socket(e) => e.source.as_deref().map(|e| e as _),
            Self::Std(e) => Some(&**e as _),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Socket(SocketError {
            message: e.to_string(),
            source: Some(Arc::new(e)),
        })
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Std(Arc::from(e))
    }
}

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

/// per phase timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Connect,
    Headers,
    Body,
}

impl TimeoutError {
    pub fn code(self) -> &'static str {
        match self {
            Self::Connect => "UND_ERR_CONNECT_TIMEOUT",
            Self::Headers => "UND_ERR_HEADERS_TIMEOUT",
            Self::Body => "UND_ERR_BODY_TIMEOUT",
        }
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("socket connect timeout"),
            Self::Headers => f.write_str("response headers timeout"),
            Self::Body => f.write_str("response body timeout"),
        }
    }
}

impl error::Error for TimeoutError {}

impl From<TimeoutError> for Error {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

/// socket failure with an optional io source.
#[derive(Debug, Clone)]
pub struct SocketError {
    pub(crate) message: String,
    pub(crate) source: Option<Arc<io::Error>>,
}

impl SocketError {
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket error: {}", self.message)
    }
}

impl error::Error for SocketError {}

/// malformed response bytes, identified by an `HPE_` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub(crate) code: &'static str,
    pub(crate) message: &'static str,
}

impl ParseError {
    pub(crate) const STATUS: Self = Self::new("HPE_INVALID_STATUS", "invalid status code");
    pub(crate) const VERSION: Self = Self::new("HPE_INVALID_VERSION", "invalid http version");
    pub(crate) const HEADER_TOKEN: Self = Self::new("HPE_INVALID_HEADER_TOKEN", "invalid header");
    pub(crate) const CONTENT_LENGTH: Self = Self::new("HPE_INVALID_CONTENT_LENGTH", "invalid content-length");
    pub(crate) const CHUNK_SIZE: Self = Self::new("HPE_INVALID_CHUNK_SIZE", "invalid chunk size");
    pub(crate) const TRANSFER_ENCODING: Self = Self::new("HPE_INVALID_TRANSFER_ENCODING", "invalid transfer-encoding");
    pub(crate) const UNEXPECTED_UPGRADE: Self = Self::new("HPE_INVALID_CONSTANT", "unexpected server upgrade");
    pub(crate) const UNEXPECTED_RESPONSE: Self = Self::new("HPE_INVALID_CONSTANT", "response without matching request");

    pub(crate) const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl error::Error for ParseError {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        let p = match e {
            httparse::Error::Status => ParseError::STATUS,
            httparse::Error::Version => ParseError::VERSION,
            httparse::Error::TooManyHeaders => return Self::HeadersOverflow,
            _ => ParseError::HEADER_TOKEN,
        };
        Self::Parse(p)
    }
}

/// tls handshake failure.
#[derive(Debug, Clone)]
pub enum TlsError {
    /// certificate does not cover the requested servername.
    AltNameInvalid,
    Other(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AltNameInvalid => f.write_str("tls certificate does not match servername"),
            Self::Other(msg) => write!(f, "tls error: {msg}"),
        }
    }
}

impl error::Error for TlsError {}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Self::Tls(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Aborted.code(), "UND_ERR_ABORTED");
        assert_eq!(Error::Timeout(TimeoutError::Headers).code(), "UND_ERR_HEADERS_TIMEOUT");
        assert_eq!(Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).code(), "UND_ERR_SOCKET");
        assert!(Error::Parse(ParseError::CHUNK_SIZE).code().starts_with("HPE_"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::from(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transient_socket());
        assert!(Error::socket_msg("other side closed").is_transient_socket());
        assert!(!Error::Timeout(TimeoutError::Connect).is_transient_socket());
        assert!(!Error::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient_socket());
    }
}
