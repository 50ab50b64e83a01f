use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use strand_net::tls::{CertificateRequestInfo, SecurityInfo};
use strand_net::{NetError, NetResult};

use crate::auth::AuthController;
use crate::connect::{ConnectError, ConnectParams, Connector, MuxSession, NegotiatedConnection};
use crate::pool::{SessionClaim, SessionKey, SessionPool, await_session};
use crate::response::ResponseHeaders;
use crate::stream::HttpStream;

mod controller;
pub(crate) use controller::{JobController, JobRequestParams, StreamEvent, StreamRequest};
pub use controller::preconnect;

pub(crate) type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_job_id() -> JobId {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Main,
    Alternative,
}

/// Signalling state shared between a job task and its owner.
///
/// Orphaning flips a flag the job checks before every delivery, so a stale
/// completion is a guaranteed no-op no matter when it fires; orphan and
/// cancel are both idempotent.
#[derive(Debug, Default)]
pub(crate) struct JobShared {
    orphaned: AtomicBool,
    cancelled: AtomicBool,
    wait_resumed: AtomicBool,
    tunnel_resumed: AtomicBool,
    wake: Notify,
}

impl JobShared {
    pub(crate) fn orphan(&self) {
        self.orphaned.store(true, Ordering::Release);
    }

    pub(crate) fn cancel(&self) {
        self.orphaned.store(true, Ordering::Release);
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Unblock a job parked in its Wait state.
    pub(crate) fn resume(&self) {
        self.wait_resumed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    fn resume_tunnel(&self) {
        self.tunnel_resumed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub(crate) fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle that restarts only the tunnel handshake of a job parked on a
/// proxy-auth challenge, once credentials have reached the controller.
pub(crate) struct TunnelAuthResumer {
    shared: Arc<JobShared>,
}

impl TunnelAuthResumer {
    pub(crate) fn resume(self) {
        self.shared.resume_tunnel();
    }
}

/// The owner side of the job contract; implemented by the controller.
///
/// Callbacks fire from the job task. A delivery for an orphaned job never
/// reaches these methods.
pub(crate) trait JobDelegate: Send + Sync {
    fn on_stream_ready(&self, job: JobId, stream: Box<dyn HttpStream>);
    fn on_stream_failed(&self, job: JobId, error: NetError);
    fn on_certificate_error(&self, job: JobId, error: NetError, security_info: SecurityInfo);
    fn on_needs_client_auth(&self, job: JobId, cert_request: CertificateRequestInfo);
    fn on_needs_proxy_auth(
        &self,
        job: JobId,
        response: ResponseHeaders,
        controller: Arc<dyn AuthController>,
        resumer: TunnelAuthResumer,
    );
    /// Early hook: the connection attempt resolved (adopted, created or
    /// failed), before stream creation.
    fn on_connection_initialized(&self, job: JobId, result: NetResult<()>);
    /// Admission gate for racing: a job that must wait parks until resumed.
    fn should_wait(&self, job: JobId) -> bool;
    /// A waiting main job proposes how long it is willing to stand back.
    fn maybe_set_wait_time_for_main_job(&self, delay: Duration);
    fn on_preconnects_complete(&self, job: JobId, result: NetResult<()>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Start,
    Wait,
    InitConnection,
    WaitingUserAction,
    CreateStream,
    Done,
}

/// One connection attempt: produces a stream for a destination (or opens
/// idle connections in preconnect mode) and reports the outcome to its
/// delegate.
pub(crate) struct Job {
    id: JobId,
    kind: JobKind,
    params: ConnectParams,
    session_key: SessionKey,
    allow_session_aliases: bool,
    /// `Some(n)`: drive only through InitConnection, opening up to `n`
    /// idle connections.
    preconnect_streams: Option<usize>,
    wait_hint: Duration,
    connector: Arc<dyn Connector>,
    pool: Arc<SessionPool>,
    delegate: Arc<dyn JobDelegate>,
    shared: Arc<JobShared>,
}

enum ConnOutcome {
    Conn(NegotiatedConnection),
    /// Terminal for this loop: the outcome has been delivered.
    Delivered,
    TunnelAuth,
}

impl Job {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        kind: JobKind,
        params: ConnectParams,
        session_key: SessionKey,
        allow_session_aliases: bool,
        preconnect_streams: Option<usize>,
        wait_hint: Duration,
        connector: Arc<dyn Connector>,
        pool: Arc<SessionPool>,
        delegate: Arc<dyn JobDelegate>,
    ) -> (Self, Arc<JobShared>) {
        let shared = Arc::new(JobShared::default());
        let job = Self {
            id,
            kind,
            params,
            session_key,
            allow_session_aliases,
            preconnect_streams,
            wait_hint,
            connector,
            pool,
            delegate,
            shared: shared.clone(),
        };
        (job, shared)
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let mut conn = None;
        let mut state = JobState::Start;
        loop {
            trace!("job #{} ({:?}): entering {state:?}", self.id, self.kind);
            state = match state {
                JobState::Start => JobState::Wait,
                JobState::Wait => {
                    if self.delegate.should_wait(self.id) {
                        self.delegate.maybe_set_wait_time_for_main_job(self.wait_hint);
                        if !self.park(|shared| shared.wait_resumed.load(Ordering::Acquire)).await
                        {
                            return;
                        }
                    }
                    JobState::InitConnection
                }
                JobState::InitConnection => match self.init_connection().await {
                    ConnOutcome::Conn(c) => {
                        conn = Some(c);
                        self.delegate_connection_initialized(Ok(()));
                        JobState::CreateStream
                    }
                    ConnOutcome::Delivered => JobState::Done,
                    ConnOutcome::TunnelAuth => JobState::WaitingUserAction,
                },
                JobState::WaitingUserAction => {
                    if !self
                        .park(|shared| shared.tunnel_resumed.swap(false, Ordering::AcqRel))
                        .await
                    {
                        return;
                    }
                    JobState::InitConnection
                }
                JobState::CreateStream => {
                    if let Some(conn) = conn.take() {
                        self.create_stream(conn);
                    }
                    JobState::Done
                }
                JobState::Done => break,
            };
        }
    }

    /// Park until `ready` holds or the job is cancelled; false on cancel.
    async fn park(&self, ready: impl Fn(&JobShared) -> bool) -> bool {
        loop {
            // register interest before checking the flags, so a signal
            // landing in between is never lost
            let mut notified = std::pin::pin!(self.shared.wake.notified());
            notified.as_mut().enable();
            if self.shared.is_cancelled() {
                trace!("job #{}: cancelled while parked", self.id);
                return false;
            }
            if ready(&self.shared) {
                return true;
            }
            notified.await;
        }
    }

    async fn init_connection(&mut self) -> ConnOutcome {
        if let Some(streams) = self.preconnect_streams {
            return self.preconnect(streams).await;
        }

        // only multiplexed-capable attempts take part in session sharing
        let mux_capable =
            self.params.alternative.is_some() || self.params.destination.is_secure();

        loop {
            let lease = if mux_capable && !self.params.security.force_http11 {
                match self
                    .pool
                    .claim(self.session_key.clone(), self.allow_session_aliases)
                {
                    SessionClaim::Session(session) => {
                        debug!(
                            "job #{}: adopting pooled session to {}",
                            self.id, self.params.destination
                        );
                        return ConnOutcome::Conn(NegotiatedConnection::Mux {
                            session,
                            aliases: Vec::new(),
                        });
                    }
                    SessionClaim::Pending(slot) => {
                        let adopted = tokio::select! {
                            adopted = await_session(slot) => adopted,
                            () = self.shared.wake.notified() => {
                                if self.shared.is_cancelled() {
                                    return ConnOutcome::Delivered;
                                }
                                None
                            }
                        };
                        match adopted {
                            Some(session) => {
                                debug!(
                                    "job #{}: adopted session created by sibling job",
                                    self.id
                                );
                                return ConnOutcome::Conn(NegotiatedConnection::Mux {
                                    session,
                                    aliases: Vec::new(),
                                });
                            }
                            // the creating job failed; try again ourselves
                            None => continue,
                        }
                    }
                    SessionClaim::Leader(lease) => Some(lease),
                }
            } else {
                None
            };

            let connector = self.connector.clone();
            let mut connecting = std::pin::pin!(connector.connect(self.params.clone()));
            let result = loop {
                tokio::select! {
                    result = connecting.as_mut() => break result,
                    () = self.shared.wake.notified() => {
                        if self.shared.is_cancelled() {
                            // drop the in-flight attempt; a partially
                            // negotiated connection cannot be trusted back
                            // into any pool
                            return ConnOutcome::Delivered;
                        }
                        // spurious wake (e.g. a resume for a state already
                        // passed); keep connecting
                    }
                }
            };

            return match result {
                Ok(NegotiatedConnection::Mux { session, aliases }) => {
                    if let Some(lease) = lease {
                        lease.publish(session.clone(), aliases.clone());
                    }
                    ConnOutcome::Conn(NegotiatedConnection::Mux { session, aliases })
                }
                Ok(conn @ NegotiatedConnection::Http1(_)) => ConnOutcome::Conn(conn),
                Err(ConnectError::NeedsProxyAuth {
                    response,
                    controller,
                }) => {
                    debug!("job #{}: proxy auth required during tunnel", self.id);
                    // keep the controller: the restarted handshake reuses it
                    self.params.proxy_auth = Some(controller.clone());
                    if !self.shared.is_orphaned() {
                        self.delegate.on_needs_proxy_auth(
                            self.id,
                            response,
                            controller,
                            TunnelAuthResumer {
                                shared: self.shared.clone(),
                            },
                        );
                    }
                    ConnOutcome::TunnelAuth
                }
                Err(ConnectError::NeedsClientAuth { cert_request }) => {
                    debug!("job #{}: client certificate requested", self.id);
                    if !self.shared.is_orphaned() {
                        self.delegate.on_needs_client_auth(self.id, cert_request);
                    }
                    ConnOutcome::Delivered
                }
                Err(ConnectError::Certificate {
                    error,
                    security_info,
                }) => {
                    debug!("job #{}: certificate error: {error}", self.id);
                    if !self.shared.is_orphaned() {
                        self.delegate
                            .on_certificate_error(self.id, error, security_info);
                    }
                    ConnOutcome::Delivered
                }
                Err(ConnectError::Net(error)) => {
                    debug!(
                        "job #{}: connection to {} failed: {error}",
                        self.id, self.params.destination
                    );
                    self.delegate_connection_initialized(Err(error));
                    if !self.shared.is_orphaned() {
                        self.delegate.on_stream_failed(self.id, error);
                    }
                    ConnOutcome::Delivered
                }
            };
        }
    }

    async fn preconnect(&mut self, streams: usize) -> ConnOutcome {
        let result = if self
            .pool
            .find(&self.session_key, self.allow_session_aliases)
            .is_some()
        {
            trace!("job #{}: preconnect satisfied by pooled session", self.id);
            Ok(())
        } else {
            self.connector
                .preconnect(self.params.clone(), streams)
                .await
        };
        if !self.shared.is_orphaned() {
            self.delegate.on_preconnects_complete(self.id, result);
        }
        ConnOutcome::Delivered
    }

    fn create_stream(&self, conn: NegotiatedConnection) {
        let stream = match conn {
            NegotiatedConnection::Http1(stream) => Ok(stream),
            NegotiatedConnection::Mux { session, .. } => {
                session.create_stream(self.params.stream_kind)
            }
        };
        match stream {
            Ok(mut stream) => {
                if self.shared.is_cancelled() {
                    stream.close(true);
                } else if self.shared.is_orphaned() {
                    // lost the race after producing a usable stream; the
                    // connection itself is still good
                    trace!("job #{}: orphaned, discarding ready stream", self.id);
                    stream.close(false);
                } else {
                    self.delegate.on_stream_ready(self.id, stream);
                }
            }
            Err(error) => {
                if !self.shared.is_orphaned() {
                    self.delegate.on_stream_failed(self.id, error);
                }
            }
        }
    }

    fn delegate_connection_initialized(&self, result: NetResult<()>) {
        if !self.shared.is_orphaned() {
            self.delegate.on_connection_initialized(self.id, result);
        }
    }
}
