use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use strand_net::address::Destination;
use strand_net::proxy::ProxyChain;
use strand_net::tls::{CertificateRequestInfo, SecurityConfig, SecurityInfo};
use strand_net::{AlternativeService, NetError, NetResult, NextProto};

use crate::auth::AuthController;
use crate::connect::{ConnectParams, ProxyResolver};
use crate::pool::SessionKey;
use crate::request::{HttpRequestInfo, LoadFlags, RequestPriority};
use crate::response::ResponseHeaders;
use crate::session::NetworkSession;
use crate::stream::{HttpStream, StreamKind};

use super::{Job, JobDelegate, JobId, JobKind, JobShared, TunnelAuthResumer, next_job_id};

/// What the transaction passes down to obtain a stream.
#[derive(Debug, Clone)]
pub(crate) struct JobRequestParams {
    pub(crate) destination: Destination,
    pub(crate) uri: http::Uri,
    pub(crate) priority: RequestPriority,
    pub(crate) stream_kind: StreamKind,
    pub(crate) security: SecurityConfig,
    pub(crate) proxy_security: SecurityConfig,
    pub(crate) enable_ip_pooling: bool,
    pub(crate) enable_alternative_services: bool,
}

/// Outcome delivered by the controller to the owning transaction.
pub(crate) enum StreamEvent {
    Ready {
        stream: Box<dyn HttpStream>,
        proxy: ProxyChain,
        used_alternative: Option<AlternativeService>,
    },
    Failed(NetError),
    CertificateError {
        error: NetError,
        security_info: SecurityInfo,
    },
    NeedsClientAuth(CertificateRequestInfo),
    NeedsProxyAuth {
        response: ResponseHeaders,
        controller: Arc<dyn AuthController>,
        resumer: TunnelAuthResumer,
    },
    PreconnectsComplete(NetResult<()>),
}

#[derive(Clone)]
struct JobRef {
    id: JobId,
    shared: Arc<JobShared>,
}

struct CtrlInner {
    params: JobRequestParams,
    proxy: ProxyChain,
    main: Option<JobRef>,
    alternative: Option<JobRef>,
    alt_service: Option<AlternativeService>,
    /// The job whose outcome the transaction is now bound to.
    bound: Option<JobId>,
    alt_failed: bool,
    /// Main-job failure held back while the alternative is still running.
    main_failed: Option<NetError>,
    main_resumed: bool,
    wait_timer_armed: bool,
    cancelled: bool,
}

impl CtrlInner {
    fn is_main(&self, id: JobId) -> bool {
        self.main.as_ref().is_some_and(|j| j.id == id)
    }

    fn is_alternative(&self, id: JobId) -> bool {
        self.alternative.as_ref().is_some_and(|j| j.id == id)
    }

    fn is_live(&self, id: JobId) -> bool {
        self.is_main(id) || self.is_alternative(id)
    }

    fn resume_main(&mut self) {
        if self.main_resumed {
            return;
        }
        self.main_resumed = true;
        if let Some(main) = &self.main {
            trace!("job controller: resuming main job #{}", main.id);
            main.shared.resume();
        }
    }
}

/// Owns the main and (optional) alternative connection job racing to
/// produce one stream, and narrows their callbacks down to a single event
/// sequence for the transaction.
pub(crate) struct JobController {
    session: Arc<NetworkSession>,
    events: mpsc::UnboundedSender<StreamEvent>,
    inner: Mutex<CtrlInner>,
    /// Self-handle for respawning jobs and arming timers from delegate
    /// callbacks; a dead weak simply drops the work.
    weak: std::sync::Weak<Self>,
}

impl JobController {
    /// Resolve the proxy configuration and start the job(s) for one stream.
    pub(crate) async fn request_stream(
        session: Arc<NetworkSession>,
        params: JobRequestParams,
    ) -> NetResult<StreamRequest> {
        let proxy = session.proxy_resolver().resolve(&params.uri).await?;
        debug!(
            "job controller: requesting stream to {} via {proxy}",
            params.destination
        );
        let (controller, events) = Self::new(session, params, proxy);
        controller.spawn_jobs();
        Ok(StreamRequest { events, controller })
    }

    /// Open up to `streams` idle connections for `request`, without
    /// producing a stream.
    pub(crate) async fn start_preconnect(
        session: Arc<NetworkSession>,
        params: JobRequestParams,
        streams: usize,
    ) -> NetResult<StreamRequest> {
        let proxy = session.proxy_resolver().resolve(&params.uri).await?;
        let (controller, events) = Self::new(session, params, proxy);
        controller.spawn_preconnect_job(streams);
        Ok(StreamRequest { events, controller })
    }

    fn new(
        session: Arc<NetworkSession>,
        params: JobRequestParams,
        proxy: ProxyChain,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Arc::new_cyclic(|weak| Self {
            session,
            events: tx,
            inner: Mutex::new(CtrlInner {
                params,
                proxy,
                main: None,
                alternative: None,
                alt_service: None,
                bound: None,
                alt_failed: false,
                main_failed: None,
                main_resumed: false,
                wait_timer_armed: false,
                cancelled: false,
            }),
            weak: weak.clone(),
        });
        (controller, rx)
    }

    fn spawn_jobs(self: &Arc<Self>) {
        let mut inner = self.inner.lock();

        let alt_service = self.eligible_alternative(&inner.params);
        if let Some(alt) = alt_service.clone() {
            debug!("job controller: racing alternative service {alt}");
            inner.alt_service = Some(alt);
            self.spawn_job_locked(&mut inner, JobKind::Alternative, None);
        }
        self.spawn_job_locked(&mut inner, JobKind::Main, None);
    }

    fn spawn_preconnect_job(self: &Arc<Self>, streams: usize) {
        let mut inner = self.inner.lock();
        self.spawn_job_locked(&mut inner, JobKind::Main, Some(streams));
    }

    fn eligible_alternative(&self, params: &JobRequestParams) -> Option<AlternativeService> {
        if !params.enable_alternative_services
            || !params.destination.is_secure()
            || params.security.force_http11
        {
            return None;
        }
        self.session
            .properties()
            .alternative_service_for(&params.destination)
    }

    fn spawn_job_locked(self: &Arc<Self>, inner: &mut CtrlInner, kind: JobKind, preconnect: Option<usize>) {
        let params = &inner.params;
        let alternative = match kind {
            JobKind::Main => None,
            JobKind::Alternative => inner.alt_service.clone(),
        };
        let family = alternative
            .as_ref()
            .map_or(NextProto::H2, |alt| alt.protocol);

        let mut security = params.security.clone();
        if self
            .session
            .properties()
            .http11_required(&params.destination.address)
        {
            security.force_http11 = true;
        }

        let connect_params = ConnectParams {
            destination: params.destination.clone(),
            proxy: inner.proxy.current().clone(),
            security,
            proxy_security: params.proxy_security.clone(),
            priority: params.priority,
            stream_kind: params.stream_kind,
            alternative,
            proxy_auth: None,
        };
        let session_key = SessionKey {
            destination: params.destination.clone(),
            proxy: inner.proxy.current().clone(),
            family,
        };

        let id = next_job_id();
        let (job, shared) = Job::new(
            id,
            kind,
            connect_params,
            session_key,
            params.enable_ip_pooling,
            preconnect,
            self.session.config().main_job_wait,
            self.session.connector().clone(),
            self.session.pool().clone(),
            self.clone(),
        );
        let job_ref = JobRef { id, shared };
        match kind {
            JobKind::Main => inner.main = Some(job_ref),
            JobKind::Alternative => inner.alternative = Some(job_ref),
        }
        trace!("job controller: spawned {kind:?} job #{id}");
        job.spawn();
    }

    fn send(&self, event: StreamEvent) {
        // the receiver half may already be gone on cancellation
        let _ = self.events.send(event);
    }

    /// Bind the transaction's outcome to `id` and orphan the sibling.
    fn bind_locked(inner: &mut CtrlInner, id: JobId) {
        inner.bound = Some(id);
        if inner.is_main(id) {
            if let Some(alt) = &inner.alternative {
                trace!("job controller: orphaning alternative job #{}", alt.id);
                alt.shared.orphan();
            }
        } else if let Some(main) = &inner.main {
            trace!("job controller: orphaning main job #{}", main.id);
            main.shared.orphan();
        }
    }

    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        for job in inner.main.iter().chain(inner.alternative.iter()) {
            job.shared.cancel();
        }
    }

    pub(crate) fn set_priority(&self, priority: RequestPriority) {
        self.inner.lock().params.priority = priority;
    }
}

impl JobDelegate for JobController {
    fn on_stream_ready(&self, job: JobId, mut stream: Box<dyn HttpStream>) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            stream.close(true);
            return;
        }
        if !inner.is_live(job) || inner.bound.is_some_and(|b| b != job) {
            stream.close(false);
            return;
        }
        let used_alternative = if inner.is_alternative(job) {
            inner.alt_service.clone()
        } else {
            None
        };
        Self::bind_locked(&mut inner, job);
        debug!(
            "job controller: job #{job} won with {} stream",
            stream.negotiated_protocol()
        );
        self.send(StreamEvent::Ready {
            stream,
            proxy: inner.proxy.clone(),
            used_alternative,
        });
    }

    fn on_stream_failed(&self, job: JobId, error: NetError) {
        let mut inner = self.inner.lock();
        if inner.cancelled || !inner.is_live(job) || inner.bound.is_some_and(|b| b != job) {
            return;
        }

        if inner.is_alternative(job) {
            debug!("job controller: alternative job #{job} failed: {error}");
            inner.alt_failed = true;
            inner.alternative = None;
            if let Some(alt) = inner.alt_service.clone() {
                // future requests skip it; the current one falls back to
                // the main job, resumed right away
                self.session.properties().mark_alternative_service_broken(alt);
            }
            inner.resume_main();
            if let Some(main_error) = inner.main_failed.take() {
                self.send(StreamEvent::Failed(main_error));
            }
            return;
        }

        debug!("job controller: main job #{job} failed: {error}");
        if error.is_proxy_fallback_candidate()
            && let Some(next) = inner.proxy.fallback()
        {
            debug!(
                "job controller: falling back from proxy {} to {next}",
                inner.proxy
            );
            inner.proxy = next;
            inner.main = None;
            inner.main_resumed = false;
            inner.wait_timer_armed = false;
            if let Some(this) = self.weak.upgrade() {
                this.spawn_job_locked(&mut inner, JobKind::Main, None);
            }
            return;
        }

        if inner.alternative.is_some() && !inner.alt_failed {
            // hold the failure: the racing alternative may still win
            inner.main_failed = Some(error);
            return;
        }
        inner.main = None;
        self.send(StreamEvent::Failed(error));
    }

    fn on_certificate_error(&self, job: JobId, error: NetError, security_info: SecurityInfo) {
        let mut inner = self.inner.lock();
        if inner.cancelled || !inner.is_live(job) || inner.bound.is_some_and(|b| b != job) {
            return;
        }
        Self::bind_locked(&mut inner, job);
        self.send(StreamEvent::CertificateError {
            error,
            security_info,
        });
    }

    fn on_needs_client_auth(&self, job: JobId, cert_request: CertificateRequestInfo) {
        let mut inner = self.inner.lock();
        if inner.cancelled || !inner.is_live(job) || inner.bound.is_some_and(|b| b != job) {
            return;
        }
        Self::bind_locked(&mut inner, job);
        self.send(StreamEvent::NeedsClientAuth(cert_request));
    }

    fn on_needs_proxy_auth(
        &self,
        job: JobId,
        response: ResponseHeaders,
        controller: Arc<dyn AuthController>,
        resumer: TunnelAuthResumer,
    ) {
        let mut inner = self.inner.lock();
        if inner.cancelled || !inner.is_live(job) || inner.bound.is_some_and(|b| b != job) {
            return;
        }
        Self::bind_locked(&mut inner, job);
        self.send(StreamEvent::NeedsProxyAuth {
            response,
            controller,
            resumer,
        });
    }

    fn on_connection_initialized(&self, job: JobId, result: NetResult<()>) {
        match &result {
            Ok(()) => trace!("job controller: job #{job} connection initialized"),
            Err(error) => trace!("job controller: job #{job} connection failed early: {error}"),
        }
    }

    fn should_wait(&self, job: JobId) -> bool {
        let inner = self.inner.lock();
        inner.is_main(job)
            && !inner.cancelled
            && !inner.main_resumed
            && !inner.alt_failed
            && inner.alternative.is_some()
    }

    fn maybe_set_wait_time_for_main_job(&self, delay: Duration) {
        let delay = self.session.config().clamped_main_job_wait(delay);
        let mut inner = self.inner.lock();
        if inner.wait_timer_armed || inner.main_resumed {
            return;
        }
        inner.wait_timer_armed = true;
        trace!("job controller: main job stands back for {delay:?}");
        drop(inner);

        if let Some(this) = self.weak.upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut inner = this.inner.lock();
                if !inner.cancelled {
                    inner.resume_main();
                }
            });
        }
    }

    fn on_preconnects_complete(&self, job: JobId, result: NetResult<()>) {
        let inner = self.inner.lock();
        if inner.cancelled || !inner.is_live(job) {
            return;
        }
        trace!("job controller: preconnects complete for job #{job}");
        self.send(StreamEvent::PreconnectsComplete(result));
    }
}

/// A pending stream request: the transaction's handle onto the racing
/// jobs. Dropping it cancels every job still in flight, closing (never
/// pooling) their partially negotiated connections.
pub(crate) struct StreamRequest {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    controller: Arc<JobController>,
}

impl StreamRequest {
    pub(crate) async fn next_event(&mut self) -> StreamEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => StreamEvent::Failed(NetError::Aborted),
        }
    }

    pub(crate) fn set_priority(&self, priority: RequestPriority) {
        self.controller.set_priority(priority);
    }
}

impl Drop for StreamRequest {
    fn drop(&mut self) {
        self.controller.cancel();
    }
}

/// Open up to `streams` idle connections toward the destination of
/// `request`, using the pooled session if one already exists. Drives
/// connection jobs only through their connection phase; no stream is
/// produced.
pub async fn preconnect(
    session: &Arc<NetworkSession>,
    request: &HttpRequestInfo,
    streams: usize,
) -> NetResult<()> {
    let destination = Destination::from_uri(&request.uri)?;
    let params = JobRequestParams {
        destination,
        uri: request.uri.clone(),
        priority: request.priority,
        stream_kind: StreamKind::Basic,
        security: SecurityConfig {
            disable_cert_revocation_checking: request
                .load_flags
                .contains(LoadFlags::DISABLE_CERT_REVOCATION_CHECKING),
            ..SecurityConfig::default()
        },
        proxy_security: SecurityConfig::default(),
        enable_ip_pooling: true,
        enable_alternative_services: false,
    };
    let mut pending =
        JobController::start_preconnect(session.clone(), params, streams).await?;
    match pending.next_event().await {
        StreamEvent::PreconnectsComplete(result) => result,
        StreamEvent::Failed(error) => Err(error),
        _ => Err(NetError::Unexpected("unexpected preconnect event")),
    }
}
