//! Scripted mock implementations of the engine's boundary traits.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use http::StatusCode;
use parking_lot::Mutex;

use strand_http::auth::{
    AuthChallengeInfo, AuthController, AuthControllerFactory, AuthTarget, ChallengeDisposition,
    Credentials,
};
use strand_http::body::UploadBody;
use strand_http::connect::{
    ConnectError, ConnectParams, Connector, MuxSession, NegotiatedConnection, ProxyResolver,
};
use strand_http::request::{HttpRequestInfo, RequestHead, RequestPriority};
use strand_http::response::{HttpResponseInfo, ResponseHeaders};
use strand_http::session::NetworkSession;
use strand_http::stream::{HttpStream, StreamKind};
use strand_http::Transaction;
use strand_net::address::{Destination, HostPort};
use strand_net::proxy::ProxyChain;
use strand_net::tls::SecurityInfo;
use strand_net::{AlternativeService, NetError, NetResult, NextProto};

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub alt_connects: AtomicUsize,
    pub preconnects: AtomicUsize,
    pub sends: AtomicUsize,
    pub header_reads: AtomicUsize,
    pub closes: AtomicUsize,
    pub not_reusable_closes: AtomicUsize,
    pub sent_heads: Mutex<Vec<RequestHead>>,
    pub connect_params: Mutex<Vec<ConnectParams>>,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn alt_connects(&self) -> usize {
        self.alt_connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn header_reads(&self) -> usize {
        self.header_reads.load(Ordering::SeqCst)
    }

    pub fn last_head(&self) -> RequestHead {
        self.sent_heads.lock().last().cloned().expect("a sent head")
    }
}

pub fn response_headers(status: u16) -> ResponseHeaders {
    ResponseHeaders::new(
        StatusCode::from_u16(status).expect("valid status"),
        HeaderMap::new(),
    )
}

enum ScriptedHeaders {
    Head(ResponseHeaders),
    Error(NetError),
    /// Headers were parsed, then the read failed.
    Partial(ResponseHeaders, NetError),
}

/// A scripted one-exchange stream.
pub struct MockStream {
    headers: VecDeque<ScriptedHeaders>,
    send_error: Option<NetError>,
    body: Bytes,
    body_end_error: Option<NetError>,
    pos: usize,
    reused: bool,
    reusable: bool,
    proto: NextProto,
    alt_used: Option<AlternativeService>,
    security: Option<SecurityInfo>,
    renewed: Option<Box<MockStream>>,
    counters: Arc<Counters>,
}

impl MockStream {
    pub fn with_status(status: u16) -> Self {
        Self {
            headers: VecDeque::from([ScriptedHeaders::Head(response_headers(status))]),
            send_error: None,
            body: Bytes::new(),
            body_end_error: None,
            pos: 0,
            reused: false,
            reusable: false,
            proto: NextProto::Http11,
            alt_used: None,
            security: None,
            renewed: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn ok(body: &'static str) -> Self {
        let mut stream = Self::with_status(200);
        stream.body = Bytes::from_static(body.as_bytes());
        stream
    }

    pub fn with_headers_error(error: NetError) -> Self {
        let mut stream = Self::with_status(200);
        stream.headers = VecDeque::from([ScriptedHeaders::Error(error)]);
        stream
    }

    pub fn with_send_error(error: NetError) -> Self {
        let mut stream = Self::with_status(200);
        stream.send_error = Some(error);
        stream
    }

    pub fn with_partial_headers(head: ResponseHeaders, error: NetError) -> Self {
        let mut stream = Self::with_status(200);
        stream.headers = VecDeque::from([ScriptedHeaders::Partial(head, error)]);
        stream
    }

    pub fn with_informational_first(mut self) -> Self {
        self.headers
            .push_front(ScriptedHeaders::Head(response_headers(100)));
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        if let Some(ScriptedHeaders::Head(head)) = self.headers.back_mut() {
            head.headers.append(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        self
    }

    pub fn with_body(mut self, body: &'static str) -> Self {
        self.body = Bytes::from_static(body.as_bytes());
        self
    }

    pub fn with_reused(mut self, reused: bool) -> Self {
        self.reused = reused;
        self
    }

    pub fn with_reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }

    pub fn with_proto(mut self, proto: NextProto) -> Self {
        self.proto = proto;
        self
    }

    pub fn with_alt_used(mut self, alt: AlternativeService) -> Self {
        self.alt_used = Some(alt);
        self
    }

    pub fn with_security(mut self, info: SecurityInfo) -> Self {
        self.security = Some(info);
        self
    }

    pub fn with_renewed(mut self, renewed: MockStream) -> Self {
        self.renewed = Some(Box::new(renewed));
        self
    }

    fn with_counters(mut self, counters: Arc<Counters>) -> Self {
        if let Some(renewed) = self.renewed.take() {
            self.renewed = Some(Box::new(renewed.with_counters(counters.clone())));
        }
        self.counters = counters;
        self
    }
}

impl HttpStream for MockStream {
    fn initialize<'a>(
        &'a mut self,
        _request: &'a HttpRequestInfo,
        _priority: RequestPriority,
    ) -> BoxFuture<'a, NetResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_request<'a>(
        &'a mut self,
        head: &'a RequestHead,
        _body: Option<&'a mut UploadBody>,
        _response: &'a mut HttpResponseInfo,
    ) -> BoxFuture<'a, NetResult<()>> {
        Box::pin(async move {
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            self.counters.sent_heads.lock().push(head.clone());
            match self.send_error.take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    fn read_response_headers<'a>(
        &'a mut self,
        response: &'a mut HttpResponseInfo,
    ) -> BoxFuture<'a, NetResult<()>> {
        Box::pin(async move {
            self.counters.header_reads.fetch_add(1, Ordering::SeqCst);
            match self.headers.pop_front() {
                Some(ScriptedHeaders::Head(head)) => {
                    response.headers = Some(head);
                    Ok(())
                }
                Some(ScriptedHeaders::Error(error)) => Err(error),
                Some(ScriptedHeaders::Partial(head, error)) => {
                    response.headers = Some(head);
                    Err(error)
                }
                None => Err(NetError::Unexpected("no scripted response head")),
            }
        })
    }

    fn read_response_body<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, NetResult<usize>> {
        Box::pin(async move {
            if self.pos < self.body.len() {
                let n = (self.body.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.body_end_error.take() {
                Some(error) => Err(error),
                None => Ok(0),
            }
        })
    }

    fn close(&mut self, not_reusable: bool) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if not_reusable {
            self.counters.not_reusable_closes.fetch_add(1, Ordering::SeqCst);
            self.reusable = false;
        }
    }

    fn renew_for_auth(self: Box<Self>) -> Box<dyn HttpStream> {
        match self.renewed {
            Some(renewed) => renewed,
            None => self,
        }
    }

    fn can_reuse_connection(&self) -> bool {
        self.reusable
    }

    fn is_connection_reused(&self) -> bool {
        self.reused
    }

    fn is_response_body_complete(&self) -> bool {
        self.pos >= self.body.len()
    }

    fn set_priority(&mut self, _priority: RequestPriority) {}

    fn negotiated_protocol(&self) -> NextProto {
        self.proto
    }

    fn alternative_service_used(&self) -> Option<AlternativeService> {
        self.alt_used.clone()
    }

    fn security_info(&self) -> Option<SecurityInfo> {
        self.security.clone()
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 443)))
    }

    fn total_received_bytes(&self) -> u64 {
        self.pos as u64
    }

    fn total_sent_bytes(&self) -> u64 {
        0
    }
}

/// A scripted multiplexed session handing out scripted streams.
pub struct MockSession {
    streams: Mutex<VecDeque<MockStream>>,
    open: AtomicBool,
    proto: NextProto,
}

impl MockSession {
    pub fn new(proto: NextProto, streams: Vec<MockStream>, counters: &Arc<Counters>) -> Arc<Self> {
        let streams = streams
            .into_iter()
            .map(|stream| stream.with_counters(counters.clone()))
            .collect();
        Arc::new(Self {
            streams: Mutex::new(streams),
            open: AtomicBool::new(true),
            proto,
        })
    }
}

impl MuxSession for MockSession {
    fn protocol(&self) -> NextProto {
        self.proto
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn create_stream(&self, _kind: StreamKind) -> NetResult<Box<dyn HttpStream>> {
        match self.streams.lock().pop_front() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(NetError::StreamRefused),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// What one scripted connection attempt resolves to.
pub enum ConnectOutcome {
    Stream(MockStream),
    Mux(Arc<MockSession>),
    Error(ConnectError),
    Delayed(Duration, Box<ConnectOutcome>),
}

/// Scripted connector: pops one outcome per attempt, with separate scripts
/// for main and alternative-service attempts.
pub struct MockConnector {
    main: Mutex<VecDeque<ConnectOutcome>>,
    alt: Mutex<VecDeque<ConnectOutcome>>,
    pub counters: Arc<Counters>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            main: Mutex::new(VecDeque::new()),
            alt: Mutex::new(VecDeque::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn push(&self, outcome: ConnectOutcome) {
        self.main.lock().push_back(outcome);
    }

    pub fn push_alt(&self, outcome: ConnectOutcome) {
        self.alt.lock().push_back(outcome);
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        params: ConnectParams,
    ) -> BoxFuture<'_, Result<NegotiatedConnection, ConnectError>> {
        Box::pin(async move {
            let queue = if params.alternative.is_some() {
                self.counters.alt_connects.fetch_add(1, Ordering::SeqCst);
                &self.alt
            } else {
                self.counters.connects.fetch_add(1, Ordering::SeqCst);
                &self.main
            };
            self.counters.connect_params.lock().push(params);

            let mut outcome = queue
                .lock()
                .pop_front()
                .unwrap_or(ConnectOutcome::Error(ConnectError::Net(
                    NetError::ConnectionFailed,
                )));
            while let ConnectOutcome::Delayed(delay, inner) = outcome {
                tokio::time::sleep(delay).await;
                outcome = *inner;
            }
            match outcome {
                ConnectOutcome::Stream(stream) => Ok(NegotiatedConnection::Http1(Box::new(
                    stream.with_counters(self.counters.clone()),
                ))),
                ConnectOutcome::Mux(session) => Ok(NegotiatedConnection::Mux {
                    session,
                    aliases: Vec::new(),
                }),
                ConnectOutcome::Error(error) => Err(error),
                ConnectOutcome::Delayed(..) => unreachable!("Delayed outcomes are resolved above"),
            }
        })
    }

    fn preconnect(&self, _params: ConnectParams, _streams: usize) -> BoxFuture<'_, NetResult<()>> {
        Box::pin(async move {
            self.counters.preconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Controller that answers every challenge once credentials arrive.
pub struct TestAuthController {
    target: AuthTarget,
    can_respond: bool,
    have: AtomicBool,
    token: Mutex<Option<String>>,
    pub challenges: AtomicUsize,
    pub resets: AtomicUsize,
}

impl TestAuthController {
    pub fn new(target: AuthTarget, can_respond: bool) -> Arc<Self> {
        Arc::new(Self {
            target,
            can_respond,
            have: AtomicBool::new(false),
            token: Mutex::new(None),
            challenges: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }
}

impl AuthController for TestAuthController {
    fn have_auth(&self) -> bool {
        self.have.load(Ordering::SeqCst)
    }

    fn maybe_generate_auth_token<'a>(
        &'a self,
        _request: &'a HttpRequestInfo,
    ) -> BoxFuture<'a, NetResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn add_authorization_header(&self, headers: &mut HeaderMap) {
        if let Some(token) = self.token.lock().clone() {
            let name = match self.target {
                AuthTarget::Proxy => PROXY_AUTHORIZATION,
                AuthTarget::Server => AUTHORIZATION,
            };
            headers.insert(name, HeaderValue::from_str(&token).expect("valid token"));
        }
    }

    fn handle_challenge(
        &self,
        _headers: &ResponseHeaders,
        _response: &mut HttpResponseInfo,
    ) -> NetResult<ChallengeDisposition> {
        self.challenges.fetch_add(1, Ordering::SeqCst);
        if self.can_respond {
            Ok(ChallengeDisposition::CanRespond)
        } else {
            Ok(ChallengeDisposition::SurfaceResponse)
        }
    }

    fn reset_auth(&self, credentials: Credentials) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.have.store(true, Ordering::SeqCst);
        *self.token.lock() = Some(format!(
            "Basic {}:{}",
            credentials.username(),
            credentials.password()
        ));
    }

    fn challenge_info(&self) -> Option<AuthChallengeInfo> {
        Some(AuthChallengeInfo {
            challenger: HostPort::new("example.com", 443),
            is_proxy: self.target == AuthTarget::Proxy,
            scheme: "basic".to_owned(),
            realm: "test".to_owned(),
        })
    }
}

pub struct TestAuthFactory {
    pub proxy: Arc<TestAuthController>,
    pub server: Arc<TestAuthController>,
}

impl TestAuthFactory {
    pub fn new(can_respond: bool) -> Arc<Self> {
        Arc::new(Self {
            proxy: TestAuthController::new(AuthTarget::Proxy, can_respond),
            server: TestAuthController::new(AuthTarget::Server, can_respond),
        })
    }
}

impl AuthControllerFactory for TestAuthFactory {
    fn create(&self, target: AuthTarget, _destination: &Destination) -> Arc<dyn AuthController> {
        match target {
            AuthTarget::Proxy => self.proxy.clone(),
            AuthTarget::Server => self.server.clone(),
        }
    }
}

/// Resolver returning a fixed chain.
pub struct StaticProxyResolver(pub ProxyChain);

impl ProxyResolver for StaticProxyResolver {
    fn resolve<'a>(&'a self, _uri: &'a http::Uri) -> BoxFuture<'a, NetResult<ProxyChain>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

pub fn request(uri: &str) -> Arc<HttpRequestInfo> {
    Arc::new(HttpRequestInfo::get(uri.parse().expect("valid uri")))
}

pub fn alt_service(host: &str, port: u16) -> AlternativeService {
    AlternativeService::new(NextProto::H3, HostPort::new(host, port))
}

pub async fn read_body(transaction: &mut Transaction) -> NetResult<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = transaction.read(&mut buf).await?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&buf[..n]);
    }
}

pub fn session_with(connector: &Arc<MockConnector>) -> Arc<NetworkSession> {
    Arc::new(NetworkSession::new(connector.clone()))
}
