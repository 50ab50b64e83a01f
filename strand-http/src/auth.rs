use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::HeaderMap;

use strand_net::NetResult;
use strand_net::address::{Destination, HostPort};

use crate::request::HttpRequestInfo;
use crate::response::{HttpResponseInfo, ResponseHeaders};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which endpoint an authentication negotiation is with.
pub enum AuthTarget {
    Proxy,
    Server,
}

impl AuthTarget {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Proxy => 0,
            Self::Server => 1,
        }
    }
}

impl fmt::Display for AuthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => f.write_str("proxy"),
            Self::Server => f.write_str("server"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
/// Credentials supplied by the caller in answer to a challenge.
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    // password stays out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed challenge surfaced to the caller as part of a 401/407 response.
pub struct AuthChallengeInfo {
    pub challenger: HostPort,
    pub is_proxy: bool,
    pub scheme: String,
    pub realm: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a controller concluded from a challenge.
pub enum ChallengeDisposition {
    /// The controller holds a handler able to produce credentials; the
    /// transaction must wait for `restart_with_auth` before proceeding.
    CanRespond,
    /// Nothing can be done automatically; the raw 401/407 becomes the
    /// final response so the caller can show it.
    SurfaceResponse,
}

/// Opaque credential negotiator for one auth target.
///
/// Scheme implementations live outside the engine; the transaction only
/// drives this call contract. Controllers are shared by handle and keep
/// their negotiation state behind interior mutability.
pub trait AuthController: Send + Sync {
    /// Whether an identity is available (cached or supplied).
    fn have_auth(&self) -> bool;

    /// Produce a token for the next request if an identity is available.
    /// May suspend, e.g. on a credential service round trip.
    fn maybe_generate_auth_token<'a>(
        &'a self,
        request: &'a HttpRequestInfo,
    ) -> BoxFuture<'a, NetResult<()>>;

    /// Attach the `Authorization` / `Proxy-Authorization` header for the
    /// generated token, if any.
    fn add_authorization_header(&self, headers: &mut HeaderMap);

    /// Digest a 401/407 head; records the pending challenge on `response`.
    fn handle_challenge(
        &self,
        headers: &ResponseHeaders,
        response: &mut HttpResponseInfo,
    ) -> NetResult<ChallengeDisposition>;

    /// Adopt caller-supplied credentials for the pending challenge.
    fn reset_auth(&self, credentials: Credentials);

    /// The challenge awaiting credentials, if one is pending.
    fn challenge_info(&self) -> Option<AuthChallengeInfo>;
}

/// Creates [`AuthController`]s on demand, one per {target, destination}.
pub trait AuthControllerFactory: Send + Sync {
    fn create(&self, target: AuthTarget, destination: &Destination) -> Arc<dyn AuthController>;
}

#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
/// Factory producing controllers that never answer a challenge: every
/// 401/407 surfaces to the caller as a final response.
pub struct NullAuthControllerFactory;

impl NullAuthControllerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AuthControllerFactory for NullAuthControllerFactory {
    fn create(&self, _target: AuthTarget, _destination: &Destination) -> Arc<dyn AuthController> {
        Arc::new(NullAuthController)
    }
}

struct NullAuthController;

impl AuthController for NullAuthController {
    fn have_auth(&self) -> bool {
        false
    }

    fn maybe_generate_auth_token<'a>(
        &'a self,
        _request: &'a HttpRequestInfo,
    ) -> BoxFuture<'a, NetResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn add_authorization_header(&self, _headers: &mut HeaderMap) {}

    fn handle_challenge(
        &self,
        _headers: &ResponseHeaders,
        _response: &mut HttpResponseInfo,
    ) -> NetResult<ChallengeDisposition> {
        Ok(ChallengeDisposition::SurfaceResponse)
    }

    fn reset_auth(&self, _credentials: Credentials) {}

    fn challenge_info(&self) -> Option<AuthChallengeInfo> {
        None
    }
}
