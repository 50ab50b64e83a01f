use std::fmt;
use std::io;

/// Type-erased error, usable as a catch-all at API boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results produced by the transaction engine.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The closed error taxonomy of the transaction engine.
///
/// Every failure that crosses a component boundary is expressed as one of
/// these values, independent of which transport or OS primitive produced it.
/// The retry policy never inspects anything else; see [`NetError::class`].
pub enum NetError {
    /// Connection reset by the peer.
    ConnectionReset,
    /// Connection closed by the peer (FIN) before or during the exchange.
    ConnectionClosed,
    /// Connection aborted locally.
    ConnectionAborted,
    /// Operation attempted on a socket that is no longer connected.
    ///
    /// Typically a reuse race: the pool handed out a connection that died
    /// between the liveness check and first use.
    SocketNotConnected,
    /// The peer closed the connection without sending a single response byte.
    EmptyResponse,
    /// Connection attempt actively refused.
    ConnectionRefused,
    /// Connection attempt failed for an unclassified transport reason.
    ConnectionFailed,
    /// Name resolution produced no usable address.
    NameNotResolved,
    /// The peer network is unreachable.
    AddressUnreachable,
    /// Operation timed out.
    TimedOut,

    /// A liveness ping on a multiplexed session went unanswered.
    MuxPingFailed,
    /// The peer refused the stream (but the session itself is alive).
    StreamRefused,
    /// Handshake of an (alternative) transport failed before any stream
    /// could be created.
    TransportHandshakeFailed,
    /// In-session protocol violation on a multiplexed session.
    MuxProtocolError,

    /// The origin demands HTTP/1.1; the chosen dialect was wrong.
    Http11Required,
    /// The proxy demands HTTP/1.1 on the proxy leg.
    ProxyHttp11Required,

    /// The peer certificate failed validation.
    CertificateInvalid,
    /// Generic TLS protocol failure.
    TlsProtocolError,
    /// The peer requested a client certificate that we have not supplied.
    ClientAuthCertNeeded,
    /// The peer rejected the client certificate we supplied.
    ClientAuthCertRejected,

    /// A proxy demanded authentication during tunnel establishment.
    ProxyAuthRequested,
    /// A 407 was received while no proxy is in use.
    UnexpectedProxyAuth,

    /// Could not reach or negotiate with the configured proxy.
    ProxyConnectionFailed,
    /// CONNECT tunnel establishment through the proxy failed.
    TunnelConnectionFailed,
    /// The response headers belong to an in-progress CONNECT tunnel,
    /// not to the real response; the body cannot be read.
    TunnelResponseInProgress,

    /// The response could not be interpreted as HTTP.
    InvalidResponse,
    /// Declared content encodings cannot be decoded.
    ContentDecodingFailed,
    /// The peer cannot service this request method.
    MethodNotSupported,

    /// The operation was cancelled by its owner.
    Aborted,
    /// Programming-contract violation; carries a short description.
    Unexpected(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Retry-policy partition of [`NetError`].
pub enum ErrorClass {
    /// Failure of a known-reused connection before any response byte:
    /// retried with a fresh connection, without consuming retry budget
    /// (the pool itself bounds this loop).
    ReusedConnectionRace,
    /// Protocol-level failure: retried transparently against the bounded
    /// retry budget.
    BoundedProtocol,
    /// The peer requires HTTP/1.1: retried unconditionally with the
    /// dialect forced, never counted.
    ForceHttp11,
    /// Certificate / TLS failure: never silently retried with the same
    /// identity.
    Security,
    /// An authentication negotiation is required before continuing.
    AuthRequired,
    /// Not recoverable by the engine.
    Fatal,
}

impl NetError {
    /// Classify this error for the retry policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionReset
            | Self::ConnectionClosed
            | Self::ConnectionAborted
            | Self::SocketNotConnected
            | Self::EmptyResponse => ErrorClass::ReusedConnectionRace,
            Self::MuxPingFailed
            | Self::StreamRefused
            | Self::TransportHandshakeFailed
            | Self::MuxProtocolError => ErrorClass::BoundedProtocol,
            Self::Http11Required | Self::ProxyHttp11Required => ErrorClass::ForceHttp11,
            Self::CertificateInvalid
            | Self::TlsProtocolError
            | Self::ClientAuthCertNeeded
            | Self::ClientAuthCertRejected => ErrorClass::Security,
            Self::ProxyAuthRequested => ErrorClass::AuthRequired,
            Self::ConnectionRefused
            | Self::ConnectionFailed
            | Self::NameNotResolved
            | Self::AddressUnreachable
            | Self::TimedOut
            | Self::UnexpectedProxyAuth
            | Self::ProxyConnectionFailed
            | Self::TunnelConnectionFailed
            | Self::TunnelResponseInProgress
            | Self::InvalidResponse
            | Self::ContentDecodingFailed
            | Self::MethodNotSupported
            | Self::Aborted
            | Self::Unexpected(_) => ErrorClass::Fatal,
        }
    }

    /// True for errors that indicate the supplied client certificate is the
    /// problem (as opposed to one not being supplied at all).
    #[must_use]
    pub fn is_client_certificate_error(&self) -> bool {
        matches!(self, Self::ClientAuthCertRejected)
    }

    /// True for errors a proxy chain fallback can plausibly route around.
    #[must_use]
    pub fn is_proxy_fallback_candidate(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused
                | Self::ConnectionFailed
                | Self::ConnectionReset
                | Self::ConnectionClosed
                | Self::ConnectionAborted
                | Self::NameNotResolved
                | Self::AddressUnreachable
                | Self::TimedOut
                | Self::ProxyConnectionFailed
                | Self::TunnelConnectionFailed
        )
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::SocketNotConnected => write!(f, "socket is not connected"),
            Self::EmptyResponse => write!(f, "peer closed connection without a response"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionFailed => write!(f, "connection attempt failed"),
            Self::NameNotResolved => write!(f, "name not resolved"),
            Self::AddressUnreachable => write!(f, "address unreachable"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::MuxPingFailed => write!(f, "multiplexed session ping failed"),
            Self::StreamRefused => write!(f, "stream refused by peer"),
            Self::TransportHandshakeFailed => write!(f, "transport handshake failed"),
            Self::MuxProtocolError => write!(f, "multiplexed session protocol error"),
            Self::Http11Required => write!(f, "peer requires http/1.1"),
            Self::ProxyHttp11Required => write!(f, "proxy requires http/1.1"),
            Self::CertificateInvalid => write!(f, "peer certificate is invalid"),
            Self::TlsProtocolError => write!(f, "tls protocol error"),
            Self::ClientAuthCertNeeded => write!(f, "peer requested a client certificate"),
            Self::ClientAuthCertRejected => write!(f, "peer rejected the client certificate"),
            Self::ProxyAuthRequested => write!(f, "proxy authentication requested"),
            Self::UnexpectedProxyAuth => {
                write!(f, "unexpected proxy authentication on a direct connection")
            }
            Self::ProxyConnectionFailed => write!(f, "could not connect to proxy"),
            Self::TunnelConnectionFailed => write!(f, "tunnel establishment through proxy failed"),
            Self::TunnelResponseInProgress => {
                write!(f, "response headers belong to an in-progress tunnel")
            }
            Self::InvalidResponse => write!(f, "invalid http response"),
            Self::ContentDecodingFailed => write!(f, "content decoding failed"),
            Self::MethodNotSupported => write!(f, "method not supported by peer"),
            Self::Aborted => write!(f, "operation aborted"),
            Self::Unexpected(what) => write!(f, "unexpected engine state: {what}"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::NotConnected => Self::SocketNotConnected,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::ConnectionFailed,
        }
    }
}
