use std::net::SocketAddr;
use std::time::Instant;

use http::{HeaderMap, StatusCode, Version};

use strand_net::tls::{CertificateRequestInfo, SecurityInfo};
use strand_net::{AlternativeService, NextProto};

use crate::auth::AuthChallengeInfo;

#[derive(Debug, Clone)]
/// Parsed response head as reported by the stream.
pub struct ResponseHeaders {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHeaders {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
        }
    }

    /// True for non-final 1xx heads (which the engine skips over).
    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }
}

#[derive(Debug, Clone, Default)]
/// Timing marks for one attempt.
pub struct LoadTiming {
    pub request_start: Option<Instant>,
    pub send_start: Option<Instant>,
    pub send_end: Option<Instant>,
    pub receive_headers_end: Option<Instant>,
}

#[derive(Debug, Default)]
/// Everything known about the response of the current attempt.
///
/// Created fresh per attempt and reset wholesale on any retry or restart;
/// only the transaction-level auth state survives across attempts.
pub struct HttpResponseInfo {
    pub headers: Option<ResponseHeaders>,
    pub security_info: Option<SecurityInfo>,
    pub timing: LoadTiming,
    /// Wire protocol the winning connection actually negotiated.
    pub negotiated_protocol: Option<NextProto>,
    pub was_fetched_via_proxy: bool,
    /// Set when the connection had already served a previous request.
    pub was_reused: bool,
    /// The alternative service the winning connection went through, if any.
    pub alternative_service_used: Option<AlternativeService>,
    /// Pending credential challenge the caller must answer.
    pub auth_challenge: Option<AuthChallengeInfo>,
    /// Pending client-certificate request the caller must answer.
    pub cert_request: Option<CertificateRequestInfo>,
    pub remote_endpoint: Option<SocketAddr>,
}

impl HttpResponseInfo {
    /// Response status, once headers are present.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.headers.as_ref().map(|h| h.status)
    }
}
