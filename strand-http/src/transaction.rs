use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use http::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, HOST, HeaderName, HeaderValue, PRAGMA,
    TRANSFER_ENCODING,
};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace};

use strand_net::address::Destination;
use strand_net::proxy::ProxyChain;
use strand_net::tls::{ClientIdentity, SecurityConfig};
use strand_net::{AlternativeService, ErrorClass, NetError, NetResult, parse_alt_svc_header};

use crate::auth::{
    AuthController, AuthControllerFactory, AuthTarget, ChallengeDisposition, Credentials,
};
use crate::body::UploadBody;
use crate::job::{JobController, JobRequestParams, StreamEvent, StreamRequest, TunnelAuthResumer};
use crate::request::{HttpRequestInfo, LoadFlags, RequestHead, RequestPriority};
use crate::response::{HttpResponseInfo, ResponseHeaders};
use crate::session::NetworkSession;
use crate::stream::{HttpStream, StreamKind};

/// Cap on transparent retries for protocol-level failures. Reused-connection
/// races are not counted against this: the pool bounds that loop by itself.
const MAX_RETRY_ATTEMPTS: u8 = 2;

/// Buffer size for draining a response body before an auth resend.
const DRAIN_BUFFER_SIZE: usize = 16 * 1024;

/// Bounds for the best-effort background drain on teardown.
const BACKGROUND_DRAIN_LIMIT: u64 = 64 * 1024;
const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Coarse progress indicator exposed to the caller.
pub enum LoadState {
    Idle,
    Throttled,
    WaitingForConnection,
    SendingRequest,
    WaitingForResponse,
    ReadingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Throttle,
    NotifyBeforeCreateStream,
    CreateStream,
    WaitForStream,
    InitStream,
    GenerateProxyAuthToken,
    GenerateServerAuthToken,
    InitRequestBody,
    BuildRequest,
    SendRequest,
    ReadHeaders,
    DrainBodyForAuthRestart,
    Done,
}

/// The per-request orchestrator: drives one logical HTTP exchange from
/// submission to body delivery, delegating connection attempts to jobs and
/// recovering transparently from every failure the policy allows.
///
/// The caller drives it with [`start`], then [`read`], with the restart
/// entry points for challenges that need out-of-band input.
///
/// [`start`]: Transaction::start
/// [`read`]: Transaction::read
pub struct Transaction {
    session: Arc<NetworkSession>,
    state: State,

    request: Option<Arc<HttpRequestInfo>>,
    destination: Option<Destination>,
    load_flags: LoadFlags,
    stream_kind: StreamKind,
    priority: RequestPriority,

    response: HttpResponseInfo,
    upload: Option<UploadBody>,
    request_head: Option<RequestHead>,

    stream: Option<Box<dyn HttpStream>>,
    stream_request: Option<StreamRequest>,
    proxy: ProxyChain,

    server_security: SecurityConfig,
    proxy_security: SecurityConfig,

    auth_controllers: [Option<Arc<dyn AuthController>>; 2],
    pending_auth_target: Option<AuthTarget>,
    tunnel_resumer: Option<TunnelAuthResumer>,
    establishing_tunnel: bool,

    headers_valid: bool,
    done_reading: bool,
    retry_attempts: u8,
    enable_ip_pooling: bool,
    enable_alternative_services: bool,
    used_alternative: Option<AlternativeService>,
    retried_alternative: Option<AlternativeService>,
    applied_cached_client_cert: bool,

    throttle_permit: Option<OwnedSemaphorePermit>,
    before_create_stream_hook: Option<Box<dyn FnOnce() + Send>>,

    total_received: u64,
    total_sent: u64,
}

impl Transaction {
    #[must_use]
    pub fn new(session: Arc<NetworkSession>) -> Self {
        Self {
            session,
            state: State::Idle,
            request: None,
            destination: None,
            load_flags: LoadFlags::default(),
            stream_kind: StreamKind::Basic,
            priority: RequestPriority::default(),
            response: HttpResponseInfo::default(),
            upload: None,
            request_head: None,
            stream: None,
            stream_request: None,
            proxy: ProxyChain::direct(),
            server_security: SecurityConfig::default(),
            proxy_security: SecurityConfig::default(),
            auth_controllers: [None, None],
            pending_auth_target: None,
            tunnel_resumer: None,
            establishing_tunnel: false,
            headers_valid: false,
            done_reading: false,
            retry_attempts: 0,
            enable_ip_pooling: true,
            enable_alternative_services: true,
            used_alternative: None,
            retried_alternative: None,
            applied_cached_client_cert: false,
            throttle_permit: None,
            before_create_stream_hook: None,
            total_received: 0,
            total_sent: 0,
        }
    }

    /// Hook invoked once, before the first connection attempt.
    pub fn set_before_create_stream_callback(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.before_create_stream_hook = Some(hook);
    }

    /// Begin the exchange. Completes once final response headers are
    /// available — which may be a 401/407 carrying a pending challenge —
    /// or with the first unrecoverable error.
    pub async fn start(&mut self, request: Arc<HttpRequestInfo>) -> NetResult<()> {
        if self.state != State::Idle {
            return Err(NetError::Unexpected("transaction already started"));
        }
        let destination = Destination::from_uri(&request.uri)?;
        debug!("transaction: starting {} {}", request.method, request.uri);

        self.priority = request.priority;
        self.load_flags = request.load_flags;
        self.stream_kind = request.stream_kind;
        if self
            .load_flags
            .contains(LoadFlags::DISABLE_CERT_REVOCATION_CHECKING)
        {
            self.server_security.disable_cert_revocation_checking = true;
            self.proxy_security.disable_cert_revocation_checking = true;
        }
        self.destination = Some(destination);
        self.request = Some(request);
        self.response.timing.request_start = Some(Instant::now());
        self.state = State::Throttle;
        self.run().await
    }

    /// Read response body bytes; `Ok(0)` is the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> NetResult<usize> {
        if self.establishing_tunnel {
            // the headers the caller sees belong to the proxy's CONNECT
            // response, not to the real request
            return Err(NetError::TunnelResponseInProgress);
        }
        if !self.headers_valid {
            return Err(NetError::Unexpected("read before response headers"));
        }
        if self.done_reading {
            return Ok(0);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::Unexpected("read without a stream"))?;

        match stream.read_response_body(buf).await {
            Ok(0) => {
                self.done_reading = true;
                self.finish_reading(true);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(error) => {
                self.done_reading = true;
                self.finish_reading(false);
                Err(error)
            }
        }
    }

    /// Answer a pending 401/407 challenge. Fails fast when no challenge is
    /// pending; resumes the parked tunnel job for proxy challenges raised
    /// during CONNECT.
    pub async fn restart_with_auth(&mut self, credentials: Credentials) -> NetResult<()> {
        let Some(target) = self.pending_auth_target.take() else {
            return Err(NetError::Unexpected(
                "restart_with_auth without pending auth target",
            ));
        };
        debug!("transaction: restarting with credentials for {target}");
        let controller = self.auth_controllers[target.index()]
            .clone()
            .ok_or(NetError::Unexpected("pending auth without controller"))?;
        controller.reset_auth(credentials);

        if target == AuthTarget::Proxy
            && let Some(resumer) = self.tunnel_resumer.take()
        {
            // tunnel case: only the tunnel handshake restarts, not the
            // whole connection search
            self.reset_state_for_auth_restart();
            resumer.resume();
            self.state = State::WaitForStream;
        } else {
            self.prepare_for_auth_restart();
        }
        self.run().await
    }

    /// Answer a pending client-certificate request; `None` records the
    /// decision to continue without one.
    pub async fn restart_with_certificate(
        &mut self,
        identity: Option<ClientIdentity>,
    ) -> NetResult<()> {
        let Some(cert_request) = self.response.cert_request.clone() else {
            return Err(NetError::Unexpected(
                "restart_with_certificate without pending certificate request",
            ));
        };
        debug!(
            "transaction: restarting with client certificate for {}",
            cert_request.host_port
        );
        let config = if cert_request.is_proxy {
            &mut self.proxy_security
        } else {
            &mut self.server_security
        };
        config.send_client_cert = true;
        config.client_identity = identity.clone();
        self.session
            .client_auth_cache()
            .insert(cert_request.host_port, identity);

        self.reset_state_for_restart();
        self.state = State::CreateStream;
        self.run().await
    }

    /// Restart after a handshake error the caller chose to ignore; the
    /// security configuration is left as it was.
    pub async fn restart_ignoring_last_error(&mut self) -> NetResult<()> {
        debug!("transaction: restarting, ignoring last error");
        self.reset_state_for_restart();
        self.state = State::CreateStream;
        self.run().await
    }

    /// Propagate a new priority to the active job and stream. Tolerates
    /// arbitrary timing, including a transaction about to be torn down.
    pub fn set_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
        if let Some(request) = &self.stream_request {
            request.set_priority(priority);
        }
        if let Some(stream) = &mut self.stream {
            stream.set_priority(priority);
        }
    }

    #[must_use]
    pub fn response_info(&self) -> &HttpResponseInfo {
        &self.response
    }

    #[must_use]
    pub fn load_state(&self) -> LoadState {
        match self.state {
            State::Throttle => LoadState::Throttled,
            State::NotifyBeforeCreateStream | State::CreateStream | State::WaitForStream => {
                LoadState::WaitingForConnection
            }
            State::InitStream
            | State::GenerateProxyAuthToken
            | State::GenerateServerAuthToken
            | State::InitRequestBody
            | State::BuildRequest
            | State::SendRequest => LoadState::SendingRequest,
            State::ReadHeaders | State::DrainBodyForAuthRestart => LoadState::WaitingForResponse,
            State::Idle | State::Done => {
                if self.headers_valid && !self.done_reading && self.stream.is_some() {
                    LoadState::ReadingResponse
                } else {
                    LoadState::Idle
                }
            }
        }
    }

    /// Bytes received over every connection this exchange used, including
    /// attempts that were retired by a transparent retry.
    #[must_use]
    pub fn total_received_bytes(&self) -> u64 {
        self.total_received
            + self
                .stream
                .as_ref()
                .map_or(0, |stream| stream.total_received_bytes())
    }

    #[must_use]
    pub fn total_sent_bytes(&self) -> u64 {
        self.total_sent
            + self
                .stream
                .as_ref()
                .map_or(0, |stream| stream.total_sent_bytes())
    }

    // -- the outer loop ----------------------------------------------------

    async fn run(&mut self) -> NetResult<()> {
        loop {
            let state = self.state;
            let rv = match state {
                State::Idle | State::Done => {
                    return Err(NetError::Unexpected("transaction loop entered while idle"));
                }
                State::Throttle => self.do_throttle().await,
                State::NotifyBeforeCreateStream => self.do_notify_before_create_stream(),
                State::CreateStream => self.do_create_stream().await,
                State::WaitForStream => self.do_wait_for_stream().await,
                State::InitStream => self.do_init_stream().await,
                State::GenerateProxyAuthToken => self.do_generate_proxy_auth_token().await,
                State::GenerateServerAuthToken => self.do_generate_server_auth_token().await,
                State::InitRequestBody => self.do_init_request_body().await,
                State::BuildRequest => self.do_build_request(),
                State::SendRequest => self.do_send_request().await,
                State::ReadHeaders => self.do_read_headers().await,
                State::DrainBodyForAuthRestart => self.do_drain_body_for_auth_restart().await,
            };
            match rv {
                Ok(State::Done) => {
                    self.state = State::Done;
                    return Ok(());
                }
                Ok(next) => self.state = next,
                Err(error) => {
                    self.state = State::Done;
                    debug!("transaction: failing with {error}");
                    return Err(error);
                }
            }
        }
    }

    async fn do_throttle(&mut self) -> NetResult<State> {
        if !self.load_flags.contains(LoadFlags::IGNORE_LIMITS) {
            self.throttle_permit = Some(self.session.throttler().admit().await?);
        }
        Ok(State::NotifyBeforeCreateStream)
    }

    fn do_notify_before_create_stream(&mut self) -> NetResult<State> {
        if let Some(hook) = self.before_create_stream_hook.take() {
            hook();
        }
        Ok(State::CreateStream)
    }

    async fn do_create_stream(&mut self) -> NetResult<State> {
        // a disabled IP-pooling state always implies alternatives are off
        // too; both are only cleared together after a misdirected request
        debug_assert!(self.enable_ip_pooling || !self.enable_alternative_services);

        let request = self
            .request
            .clone()
            .ok_or(NetError::Unexpected("create stream without request"))?;
        let destination = self
            .destination
            .clone()
            .ok_or(NetError::Unexpected("create stream without destination"))?;

        let params = JobRequestParams {
            destination,
            uri: request.uri.clone(),
            priority: self.priority,
            stream_kind: self.stream_kind,
            security: self.server_security.clone(),
            proxy_security: self.proxy_security.clone(),
            enable_ip_pooling: self.enable_ip_pooling,
            enable_alternative_services: self.enable_alternative_services,
        };
        let pending = JobController::request_stream(self.session.clone(), params).await?;
        self.stream_request = Some(pending);
        Ok(State::WaitForStream)
    }

    async fn do_wait_for_stream(&mut self) -> NetResult<State> {
        let pending = self
            .stream_request
            .as_mut()
            .ok_or(NetError::Unexpected("waiting without a stream request"))?;

        match pending.next_event().await {
            StreamEvent::Ready {
                stream,
                proxy,
                used_alternative,
            } => {
                trace!("transaction: stream ready via {proxy}");
                self.proxy = proxy;
                self.response.was_fetched_via_proxy = !self.proxy.is_direct();
                self.response.alternative_service_used = used_alternative.clone();
                self.used_alternative = used_alternative;
                self.stream = Some(stream);
                Ok(State::InitStream)
            }
            StreamEvent::Failed(error) => self.handle_io_error(error),
            StreamEvent::CertificateError {
                error,
                security_info,
            } => {
                self.response.security_info = Some(security_info);
                Err(error)
            }
            StreamEvent::NeedsClientAuth(cert_request) => {
                if !self.applied_cached_client_cert
                    && let Some(decision) = self
                        .session
                        .client_auth_cache()
                        .lookup(&cert_request.host_port)
                {
                    // a previous decision for this destination still
                    // stands; apply it and restart once
                    debug!(
                        "transaction: applying cached client certificate decision for {}",
                        cert_request.host_port
                    );
                    self.applied_cached_client_cert = true;
                    let config = if cert_request.is_proxy {
                        &mut self.proxy_security
                    } else {
                        &mut self.server_security
                    };
                    config.send_client_cert = true;
                    config.client_identity = decision;
                    self.reset_state_for_restart();
                    return Ok(State::CreateStream);
                }
                self.response.cert_request = Some(cert_request);
                Err(NetError::ClientAuthCertNeeded)
            }
            StreamEvent::NeedsProxyAuth {
                response,
                controller,
                resumer,
            } => {
                // the CONNECT response becomes the visible response until
                // the caller supplies credentials
                self.establishing_tunnel = true;
                self.headers_valid = true;
                self.response.headers = Some(response);
                self.response.auth_challenge = controller.challenge_info();
                self.auth_controllers[AuthTarget::Proxy.index()] = Some(controller);
                self.pending_auth_target = Some(AuthTarget::Proxy);
                self.tunnel_resumer = Some(resumer);
                Ok(State::Done)
            }
            StreamEvent::PreconnectsComplete(_) => {
                Err(NetError::Unexpected("preconnect event on a transaction"))
            }
        }
    }

    async fn do_init_stream(&mut self) -> NetResult<State> {
        let request = self
            .request
            .clone()
            .ok_or(NetError::Unexpected("init stream without request"))?;
        let priority = self.priority;
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::Unexpected("init stream without stream"))?;
        match stream.initialize(&request, priority).await {
            Ok(()) => Ok(State::GenerateProxyAuthToken),
            Err(error) => self.handle_io_error(error),
        }
    }

    async fn do_generate_proxy_auth_token(&mut self) -> NetResult<State> {
        if self.should_apply_proxy_auth() {
            let request = self
                .request
                .clone()
                .ok_or(NetError::Unexpected("auth token without request"))?;
            let controller = self.auth_controller(AuthTarget::Proxy)?;
            controller.maybe_generate_auth_token(&request).await?;
        }
        Ok(State::GenerateServerAuthToken)
    }

    async fn do_generate_server_auth_token(&mut self) -> NetResult<State> {
        if self.should_apply_server_auth() {
            let request = self
                .request
                .clone()
                .ok_or(NetError::Unexpected("auth token without request"))?;
            let controller = self.auth_controller(AuthTarget::Server)?;
            controller.maybe_generate_auth_token(&request).await?;
        }
        Ok(State::InitRequestBody)
    }

    async fn do_init_request_body(&mut self) -> NetResult<State> {
        let request = self
            .request
            .clone()
            .ok_or(NetError::Unexpected("request body without request"))?;
        self.upload = request.upload.clone();
        if let Some(upload) = &mut self.upload {
            upload.init().await?;
        }
        Ok(State::BuildRequest)
    }

    fn do_build_request(&mut self) -> NetResult<State> {
        let request = self
            .request
            .clone()
            .ok_or(NetError::Unexpected("build request without request"))?;
        let destination = self
            .destination
            .clone()
            .ok_or(NetError::Unexpected("build request without destination"))?;

        let using_proxy_without_tunnel = self.using_proxy_without_tunnel();
        let mut headers = http::HeaderMap::new();

        headers.insert(
            HOST,
            HeaderValue::from_str(&destination.host_header_value())
                .map_err(|_| NetError::Unexpected("destination host is not a valid header"))?,
        );

        // a proxy hop needs to be told to keep its side open too
        if using_proxy_without_tunnel {
            headers.insert(
                HeaderName::from_static("proxy-connection"),
                HeaderValue::from_static("keep-alive"),
            );
        } else {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        if let Some(upload) = &self.upload {
            match upload.content_length() {
                Some(len) => {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
                None => {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }
            }
        } else if request.method == http::Method::POST || request.method == http::Method::PUT {
            // an empty body still needs an explicit zero length
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }

        if self.load_flags.contains(LoadFlags::BYPASS_CACHE) {
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        } else if self.load_flags.contains(LoadFlags::VALIDATE_CACHE) {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        }

        if self.should_apply_proxy_auth()
            && let Some(controller) = &self.auth_controllers[AuthTarget::Proxy.index()]
            && controller.have_auth()
        {
            controller.add_authorization_header(&mut headers);
        }
        if self.should_apply_server_auth()
            && let Some(controller) = &self.auth_controllers[AuthTarget::Server.index()]
            && controller.have_auth()
        {
            controller.add_authorization_header(&mut headers);
        }

        // caller headers merge last and win over everything above
        for (name, value) in &request.extra_headers {
            headers.insert(name.clone(), value.clone());
        }

        let target = if using_proxy_without_tunnel {
            request.uri.to_string()
        } else {
            request
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned())
        };

        self.request_head = Some(RequestHead {
            method: request.method.clone(),
            target,
            headers,
        });
        Ok(State::SendRequest)
    }

    async fn do_send_request(&mut self) -> NetResult<State> {
        self.response.timing.send_start = Some(Instant::now());
        let head = self
            .request_head
            .as_ref()
            .ok_or(NetError::Unexpected("send without built request"))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::Unexpected("send without stream"))?;

        let result = stream
            .send_request(head, self.upload.as_mut(), &mut self.response)
            .await;
        self.response.timing.send_end = Some(Instant::now());
        match result {
            Ok(()) => Ok(State::ReadHeaders),
            Err(error) => self.handle_io_error(error),
        }
    }

    async fn do_read_headers(&mut self) -> NetResult<State> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::Unexpected("read headers without stream"))?;

        match stream.read_response_headers(&mut self.response).await {
            Ok(()) => {}
            // a close with a parsed head is still a usable response
            Err(NetError::ConnectionClosed) if self.response.headers.is_some() => {}
            Err(error) => return self.handle_io_error(error),
        }

        let (status, informational) = {
            let headers = self
                .response
                .headers
                .as_ref()
                .ok_or(NetError::InvalidResponse)?;
            (headers.status, headers.is_informational())
        };

        // non-final heads are skipped, except for upgrade streams where the
        // caller is the one driving the upgrade dance
        if informational && self.stream_kind != StreamKind::Upgrade {
            trace!("transaction: skipping informational response {status}");
            self.response.headers = None;
            return Ok(State::ReadHeaders);
        }

        let (connection_reused, security_info, negotiated_protocol, remote_endpoint) = {
            let stream = self
                .stream
                .as_ref()
                .ok_or(NetError::Unexpected("read headers without stream"))?;
            (
                stream.is_connection_reused(),
                stream.security_info(),
                stream.negotiated_protocol(),
                stream.remote_endpoint(),
            )
        };

        // a stale reused socket can answer with 408 before dying; retry on
        // a fresh connection like a reuse race
        if status == StatusCode::REQUEST_TIMEOUT && connection_reused {
            debug!("transaction: 408 on a reused connection, resending");
            self.reset_connection_and_request_for_resend();
            return Ok(State::CreateStream);
        }

        if status == StatusCode::MISDIRECTED_REQUEST
            && (self.enable_ip_pooling || self.enable_alternative_services)
        {
            debug!("transaction: misdirected request, retrying with pooling options off");
            self.enable_ip_pooling = false;
            self.enable_alternative_services = false;
            self.reset_connection_and_request_for_resend();
            return Ok(State::CreateStream);
        }

        if self
            .destination
            .as_ref()
            .is_some_and(Destination::is_secure)
        {
            self.response.security_info = security_info;
            let cert_clean = self
                .response
                .security_info
                .as_ref()
                .is_some_and(|info| info.is_valid() && !info.is_cert_status_error());
            if cert_clean {
                self.process_alternative_services();
            }
        }

        self.handle_auth_challenge()?;

        self.headers_valid = true;
        self.response.negotiated_protocol = Some(negotiated_protocol);
        self.response.was_reused = connection_reused;
        self.response.remote_endpoint = remote_endpoint;
        self.response.timing.receive_headers_end = Some(Instant::now());
        self.throttle_permit = None;

        // the request descriptor is only needed until final headers; keep
        // it across an auth restart, release it otherwise
        if self.pending_auth_target.is_none() {
            self.request = None;
        }
        Ok(State::Done)
    }

    async fn do_drain_body_for_auth_restart(&mut self) -> NetResult<State> {
        let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];
        let mut drained = true;
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or(NetError::Unexpected("drain without stream"))?;
            match stream.read_response_body(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => {
                    drained = false;
                    break;
                }
            }
        }

        let keep_alive = drained
            && self
                .stream
                .as_ref()
                .is_some_and(|s| s.is_response_body_complete() && s.can_reuse_connection());

        self.reset_state_for_auth_restart();
        if keep_alive {
            trace!("transaction: reusing connection for auth resend");
            if let Some(stream) = self.stream.take() {
                self.total_received += stream.total_received_bytes();
                self.total_sent += stream.total_sent_bytes();
                self.stream = Some(stream.renew_for_auth());
            }
            Ok(State::InitStream)
        } else {
            self.close_stream(true);
            Ok(State::CreateStream)
        }
    }

    // -- retry policy ------------------------------------------------------

    /// Decide what to do about an I/O-level failure: convert it into a
    /// transparent resend (`Ok(CreateStream)`) or propagate it as final.
    fn handle_io_error(&mut self, error: NetError) -> NetResult<State> {
        self.handle_client_auth_error(error);

        match error.class() {
            ErrorClass::ReusedConnectionRace => {
                // uncounted: the pool runs out of stale connections on its
                // own, which bounds this loop
                if self.should_resend_request() {
                    debug!("transaction: restarting after reuse race ({error})");
                    self.reset_connection_and_request_for_resend();
                    return Ok(State::CreateStream);
                }
            }
            ErrorClass::BoundedProtocol => {
                if error == NetError::MuxProtocolError {
                    return self.handle_mux_protocol_error(error);
                }
                if !self.has_exceeded_max_retries() {
                    debug!("transaction: restarting after protocol error ({error})");
                    self.retry_attempts += 1;
                    self.reset_connection_and_request_for_resend();
                    return Ok(State::CreateStream);
                }
            }
            ErrorClass::ForceHttp11 => {
                self.handle_http11_required(error);
                return Ok(State::CreateStream);
            }
            ErrorClass::Security | ErrorClass::AuthRequired | ErrorClass::Fatal => {}
        }
        Err(error)
    }

    /// An in-session protocol error can only be retried before any response
    /// bytes arrived, and only when an alternative service was in play; the
    /// retry then runs with alternatives disabled (or just counted, if the
    /// service was already marked broken while we were in flight).
    fn handle_mux_protocol_error(&mut self, error: NetError) -> NetResult<State> {
        if self.response.headers.is_some() {
            return Err(error);
        }
        let Some(alt) = self.used_alternative.clone() else {
            return Err(error);
        };
        if self.has_exceeded_max_retries() {
            return Err(error);
        }
        if self
            .session
            .properties()
            .is_alternative_service_broken(&alt)
        {
            debug!("transaction: retrying after protocol error on now-broken {alt}");
            self.retry_attempts += 1;
            self.reset_connection_and_request_for_resend();
            return Ok(State::CreateStream);
        }
        if self
            .session
            .config()
            .retry_without_alt_svc_on_protocol_errors
        {
            debug!("transaction: retrying without alternative services after error on {alt}");
            self.enable_alternative_services = false;
            self.retried_alternative = Some(alt);
            self.retry_attempts += 1;
            self.reset_connection_and_request_for_resend();
            return Ok(State::CreateStream);
        }
        Err(error)
    }

    fn handle_http11_required(&mut self, error: NetError) {
        debug!("transaction: peer requires http/1.1, retrying ({error})");
        if error == NetError::Http11Required {
            self.server_security.force_http11 = true;
            if let Some(destination) = &self.destination {
                self.session
                    .properties()
                    .set_http11_required(destination.address.clone());
            }
        } else {
            self.proxy_security.force_http11 = true;
        }
        self.reset_connection_and_request_for_resend();
    }

    /// The peer may ask for client renegotiation at any point; a failure
    /// while we were sending a client certificate invalidates the cached
    /// decision for this destination.
    fn handle_client_auth_error(&mut self, error: NetError) {
        if self.server_security.send_client_cert
            && (error == NetError::TlsProtocolError || error.is_client_certificate_error())
            && let Some(destination) = &self.destination
        {
            self.session
                .client_auth_cache()
                .remove(&destination.address);
        }
    }

    /// Resend only when the connection was known reused and no response
    /// bytes have been parsed yet.
    fn should_resend_request(&self) -> bool {
        let connection_is_proven = self
            .stream
            .as_ref()
            .is_some_and(|stream| stream.is_connection_reused());
        connection_is_proven && self.response.headers.is_none()
    }

    fn has_exceeded_max_retries(&self) -> bool {
        self.retry_attempts >= MAX_RETRY_ATTEMPTS
    }

    // -- auth --------------------------------------------------------------

    fn should_apply_proxy_auth(&self) -> bool {
        self.using_proxy_without_tunnel()
    }

    fn should_apply_server_auth(&self) -> bool {
        !self.load_flags.contains(LoadFlags::DO_NOT_SEND_AUTH_DATA)
    }

    fn using_proxy_without_tunnel(&self) -> bool {
        !self.proxy.is_direct()
            && self
                .destination
                .as_ref()
                .is_some_and(|destination| !destination.is_secure())
    }

    fn auth_controller(&mut self, target: AuthTarget) -> NetResult<Arc<dyn AuthController>> {
        let index = target.index();
        if self.auth_controllers[index].is_none() {
            let destination = self
                .destination
                .as_ref()
                .ok_or(NetError::Unexpected("auth controller without destination"))?;
            self.auth_controllers[index] =
                Some(self.session.auth_factory().create(target, destination));
        }
        self.auth_controllers[index]
            .clone()
            .ok_or(NetError::Unexpected("auth controller not created"))
    }

    fn handle_auth_challenge(&mut self) -> NetResult<()> {
        let Some(headers) = self.response.headers.clone() else {
            return Ok(());
        };
        let status = headers.status;
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::PROXY_AUTHENTICATION_REQUIRED
        {
            return Ok(());
        }

        let target = if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            AuthTarget::Proxy
        } else {
            AuthTarget::Server
        };
        // a proxy challenge on a direct route is never legitimate; an
        // origin must not impersonate an intermediary
        if target == AuthTarget::Proxy && self.proxy.is_direct() {
            return Err(NetError::UnexpectedProxyAuth);
        }
        if target == AuthTarget::Server && !self.should_apply_server_auth() {
            return Ok(());
        }

        let controller = self.auth_controller(target)?;
        match controller.handle_challenge(&headers, &mut self.response)? {
            ChallengeDisposition::CanRespond => {
                debug!("transaction: {target} auth challenge pending on caller");
                self.pending_auth_target = Some(target);
                self.response.auth_challenge = controller.challenge_info();
            }
            ChallengeDisposition::SurfaceResponse => {
                trace!("transaction: surfacing {status} to the caller");
            }
        }
        Ok(())
    }

    fn prepare_for_auth_restart(&mut self) {
        let can_keep_alive = self
            .stream
            .as_ref()
            .is_some_and(|stream| stream.can_reuse_connection());
        if can_keep_alive {
            // drain what is left of the challenge body so the connection
            // can carry the resend
            self.state = State::DrainBodyForAuthRestart;
        } else {
            self.close_stream(true);
            self.reset_state_for_auth_restart();
            self.state = State::CreateStream;
        }
    }

    // -- alt-svc -----------------------------------------------------------

    fn process_alternative_services(&mut self) {
        let Some(destination) = self.destination.clone() else {
            return;
        };
        let Some(headers) = &self.response.headers else {
            return;
        };
        let mut services = Vec::new();
        for value in headers.headers.get_all(http::header::ALT_SVC) {
            if let Ok(value) = value.to_str() {
                services.extend(parse_alt_svc_header(value, &destination));
            }
        }
        if !services.is_empty() {
            trace!("transaction: recording {} alternative service(s)", services.len());
            self.session
                .properties()
                .set_alternative_services(destination, services);
        }
    }

    // -- resets & teardown -------------------------------------------------

    fn close_stream(&mut self, not_reusable: bool) {
        if let Some(mut stream) = self.stream.take() {
            self.total_received += stream.total_received_bytes();
            self.total_sent += stream.total_sent_bytes();
            stream.close(not_reusable);
        }
    }

    fn reset_connection_and_request_for_resend(&mut self) {
        self.close_stream(true);
        self.stream_request = None;
        self.reset_state_for_auth_restart();
        if let Some(upload) = &mut self.upload {
            upload.reset();
        }
    }

    fn reset_state_for_restart(&mut self) {
        self.close_stream(true);
        self.stream_request = None;
        self.reset_state_for_auth_restart();
    }

    /// Clear per-attempt state; auth controllers and the retry ledger
    /// survive.
    fn reset_state_for_auth_restart(&mut self) {
        let request_start = self.response.timing.request_start;
        self.pending_auth_target = None;
        self.headers_valid = false;
        self.establishing_tunnel = false;
        self.request_head = None;
        self.used_alternative = None;
        self.response = HttpResponseInfo::default();
        self.response.timing.request_start = request_start;
    }

    fn finish_reading(&mut self, success: bool) {
        if let Some(stream) = &mut self.stream {
            let keep_alive = stream.is_response_body_complete() && stream.can_reuse_connection();
            stream.close(!keep_alive);
        }
        // a success after retrying without alternatives confirms that the
        // alternative itself was the problem
        if success
            && !self.enable_alternative_services
            && let Some(alt) = self.retried_alternative.take()
        {
            self.session.properties().mark_alternative_service_broken(alt);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // dropping `stream_request` cancels in-flight jobs, which close
        // (never pool) their partially negotiated connections
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if self.done_reading {
            // already closed by finish_reading; just release it
            return;
        }
        if !self.headers_valid {
            stream.close(true);
            return;
        }
        if stream.is_response_body_complete() {
            let keep_alive = stream.can_reuse_connection();
            stream.close(!keep_alive);
            return;
        }
        // best effort: drain in the background so the connection can still
        // be reused; when that is impossible, just close it
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            trace!("transaction: handing stream off for background drain");
            handle.spawn(drain_and_close(stream));
        } else {
            stream.close(true);
        }
    }
}

/// Drain an abandoned response body within fixed bounds, then close the
/// stream, reusable when the drain completed.
async fn drain_and_close(mut stream: Box<dyn HttpStream>) {
    let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];
    let mut total: u64 = 0;
    let drained = tokio::time::timeout(BACKGROUND_DRAIN_TIMEOUT, async {
        loop {
            match stream.read_response_body(&mut buf).await {
                Ok(0) => break true,
                Ok(n) => {
                    total += n as u64;
                    if total > BACKGROUND_DRAIN_LIMIT {
                        break false;
                    }
                }
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    let keep_alive = drained && stream.can_reuse_connection();
    stream.close(!keep_alive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_cap_is_two() {
        assert_eq!(MAX_RETRY_ATTEMPTS, 2);
    }

    #[test]
    fn state_is_a_plain_tag() {
        assert_eq!(std::mem::size_of::<State>(), 1);
    }
}
