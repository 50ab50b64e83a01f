use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use strand_net::address::Destination;
use strand_net::proxy::{ProxyChain, ProxyServer};
use strand_net::tls::{CertificateRequestInfo, SecurityConfig, SecurityInfo};
use strand_net::{AlternativeService, NetError, NetResult, NextProto};

use crate::auth::AuthController;
use crate::pool::SessionKey;
use crate::request::RequestPriority;
use crate::response::ResponseHeaders;
use crate::stream::{HttpStream, StreamKind};

#[derive(Clone)]
/// Everything a connection attempt needs to open and negotiate one
/// connection (direct or through a proxy hop).
pub struct ConnectParams {
    pub destination: Destination,
    pub proxy: ProxyServer,
    pub security: SecurityConfig,
    pub proxy_security: SecurityConfig,
    pub priority: RequestPriority,
    pub stream_kind: StreamKind,
    /// When set, connect to this advertised endpoint with its protocol
    /// instead of negotiating against the origin directly.
    pub alternative: Option<AlternativeService>,
    /// Tunnel-auth controller to reuse when restarting a CONNECT handshake
    /// after the caller supplied proxy credentials.
    pub proxy_auth: Option<Arc<dyn AuthController>>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("destination", &self.destination)
            .field("proxy", &self.proxy)
            .field("security", &self.security)
            .field("proxy_security", &self.proxy_security)
            .field("priority", &self.priority)
            .field("stream_kind", &self.stream_kind)
            .field("alternative", &self.alternative)
            .field("proxy_auth", &self.proxy_auth.is_some())
            .finish()
    }
}

/// A pooled multiplexed session: one negotiated connection able to carry
/// many concurrent streams, shared across transactions.
pub trait MuxSession: Send + Sync {
    fn protocol(&self) -> NextProto;

    /// Whether the session can still accept new streams.
    fn is_open(&self) -> bool;

    /// Open one more stream on this session.
    fn create_stream(&self, kind: StreamKind) -> NetResult<Box<dyn HttpStream>>;

    /// Tear the session down; used on cancellation, where a
    /// partially-negotiated connection must not stay pooled.
    fn close(&self);
}

/// Outcome of a successful connection attempt.
pub enum NegotiatedConnection {
    /// Sequential connection: the stream is the connection.
    Http1(Box<dyn HttpStream>),
    /// Multiplexed session, shareable through the session pool. Aliases
    /// are extra pool keys the session may serve (IP-based pooling).
    Mux {
        session: Arc<dyn MuxSession>,
        aliases: Vec<SessionKey>,
    },
}

impl fmt::Debug for NegotiatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http1(_) => f.write_str("NegotiatedConnection::Http1"),
            Self::Mux { session, aliases } => f
                .debug_struct("NegotiatedConnection::Mux")
                .field("protocol", &session.protocol())
                .field("aliases", aliases)
                .finish(),
        }
    }
}

/// Failure of a connection attempt, with enough structure for the job to
/// route each case differently.
pub enum ConnectError {
    /// The proxy demanded authentication during tunnel establishment.
    /// Resumable: the owner may restart just the tunnel handshake after
    /// credentials arrive at the supplied controller.
    NeedsProxyAuth {
        response: ResponseHeaders,
        controller: Arc<dyn AuthController>,
    },
    /// The peer requested a client certificate.
    NeedsClientAuth { cert_request: CertificateRequestInfo },
    /// The handshake failed on certificate validation.
    Certificate {
        error: NetError,
        security_info: SecurityInfo,
    },
    /// Anything else, already mapped into the taxonomy.
    Net(NetError),
}

impl ConnectError {
    /// The taxonomy error this failure surfaces as when not handled
    /// specially.
    #[must_use]
    pub fn as_net_error(&self) -> NetError {
        match self {
            Self::NeedsProxyAuth { .. } => NetError::ProxyAuthRequested,
            Self::NeedsClientAuth { .. } => NetError::ClientAuthCertNeeded,
            Self::Certificate { error, .. } => *error,
            Self::Net(error) => *error,
        }
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeedsProxyAuth { response, .. } => f
                .debug_struct("ConnectError::NeedsProxyAuth")
                .field("status", &response.status)
                .finish_non_exhaustive(),
            Self::NeedsClientAuth { cert_request } => f
                .debug_struct("ConnectError::NeedsClientAuth")
                .field("cert_request", cert_request)
                .finish(),
            Self::Certificate {
                error,
                security_info,
            } => f
                .debug_struct("ConnectError::Certificate")
                .field("error", error)
                .field("security_info", security_info)
                .finish(),
            Self::Net(error) => f.debug_tuple("ConnectError::Net").field(error).finish(),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_net_error(), f)
    }
}

impl std::error::Error for ConnectError {}

impl From<NetError> for ConnectError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}

/// Opens and negotiates connections. Socket allocation, name resolution and
/// handshake mechanics all live behind this boundary; the engine only
/// decides when to call it and what to do with the outcome.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        params: ConnectParams,
    ) -> BoxFuture<'_, Result<NegotiatedConnection, ConnectError>>;

    /// Open up to `streams` idle connections without producing a stream.
    fn preconnect(&self, params: ConnectParams, streams: usize) -> BoxFuture<'_, NetResult<()>>;
}

/// Resolves the proxy configuration for a request uri.
pub trait ProxyResolver: Send + Sync {
    fn resolve<'a>(&'a self, uri: &'a http::Uri) -> BoxFuture<'a, NetResult<ProxyChain>>;
}

#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
/// Resolver that always routes directly.
pub struct DirectProxyResolver;

impl DirectProxyResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProxyResolver for DirectProxyResolver {
    fn resolve<'a>(&'a self, _uri: &'a http::Uri) -> BoxFuture<'a, NetResult<ProxyChain>> {
        Box::pin(async { Ok(ProxyChain::direct()) })
    }
}
