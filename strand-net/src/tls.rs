use std::fmt;
use std::sync::Arc;

use crate::address::HostPort;
use crate::error::NetError;
use crate::proto::NextProto;

#[derive(Clone, PartialEq, Eq)]
/// A client certificate and its private key, selected in answer to a
/// certificate challenge. The contents are opaque to the engine.
pub struct ClientIdentity {
    cert: Arc<[u8]>,
    key: Arc<[u8]>,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(cert: impl Into<Arc<[u8]>>, key: impl Into<Arc<[u8]>>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn certificate(&self) -> &[u8] {
        &self.cert
    }

    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for ClientIdentity {
    // key material stays out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Per-attempt security configuration for one leg (destination or proxy).
pub struct SecurityConfig {
    /// Skip certificate revocation checking for this attempt.
    pub disable_cert_revocation_checking: bool,
    /// Restrict negotiation to http/1.1 (set after a downgrade signal).
    pub force_http11: bool,
    /// Offer this client certificate during the handshake.
    pub client_identity: Option<ClientIdentity>,
    /// A client-certificate decision has been made, including the decision
    /// to continue without one (`client_identity == None`).
    pub send_client_cert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Summary of a completed security handshake, reported by the stream.
pub struct SecurityInfo {
    pub protocol_version: Option<TlsVersion>,
    pub alpn: Option<NextProto>,
    pub peer_certificate_der: Option<Arc<[u8]>>,
    /// Set when the peer certificate carries a validation error.
    pub cert_error: Option<NetError>,
}

impl SecurityInfo {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.protocol_version.is_some()
    }

    #[must_use]
    pub fn is_cert_status_error(&self) -> bool {
        self.cert_error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer's request for a client certificate, surfaced to the caller.
pub struct CertificateRequestInfo {
    /// Which endpoint issued the challenge.
    pub host_port: HostPort,
    /// True when the challenge came from the proxy leg.
    pub is_proxy: bool,
}
