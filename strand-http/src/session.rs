use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use strand_net::properties::{ClientAuthCache, ServerProperties};
use strand_net::{NetError, NetResult};

use crate::auth::{AuthControllerFactory, NullAuthControllerFactory};
use crate::connect::{Connector, DirectProxyResolver, ProxyResolver};
use crate::pool::SessionPool;

/// Default ceiling on concurrently admitted transactions.
const DEFAULT_MAX_CONCURRENT_TRANSACTIONS: usize = 256;

/// Default head start granted to a racing alternative job before the main
/// job is allowed to proceed.
const DEFAULT_MAIN_JOB_WAIT: Duration = Duration::from_millis(300);

/// Ceiling on the main-job head start, whatever a job asks for.
const MAX_MAIN_JOB_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
/// Tunables consumed (not owned) by the engine.
pub struct SessionConfig {
    /// Concurrent-transaction admission limit.
    pub max_concurrent_transactions: usize,
    /// Head start for a racing alternative job.
    pub main_job_wait: Duration,
    /// Retry once without alternative services after an in-session
    /// protocol error on one.
    pub retry_without_alt_svc_on_protocol_errors: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: DEFAULT_MAX_CONCURRENT_TRANSACTIONS,
            main_job_wait: DEFAULT_MAIN_JOB_WAIT,
            retry_without_alt_svc_on_protocol_errors: true,
        }
    }
}

impl SessionConfig {
    /// The wait a main job gets, clamped to the engine ceiling.
    #[must_use]
    pub(crate) fn clamped_main_job_wait(&self, requested: Duration) -> Duration {
        requested.min(MAX_MAIN_JOB_WAIT)
    }
}

/// Admission gate for transaction starts.
///
/// A permit is held from admission until response headers arrive, bounding
/// the number of requests in their connection/send phase.
#[derive(Debug)]
pub(crate) struct Throttler {
    permits: Arc<Semaphore>,
}

impl Throttler {
    fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    pub(crate) async fn admit(&self) -> NetResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| NetError::Aborted)
    }
}

/// Shared context every transaction runs against: the connector, the proxy
/// resolver, the auth factory, the session pool, and the cross-request
/// stores.
pub struct NetworkSession {
    connector: Arc<dyn Connector>,
    proxy_resolver: Arc<dyn ProxyResolver>,
    auth_factory: Arc<dyn AuthControllerFactory>,
    pool: Arc<SessionPool>,
    properties: Arc<ServerProperties>,
    client_auth_cache: Arc<ClientAuthCache>,
    throttler: Throttler,
    config: SessionConfig,
}

impl NetworkSession {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let config = SessionConfig::default();
        Self {
            connector,
            proxy_resolver: Arc::new(DirectProxyResolver::new()),
            auth_factory: Arc::new(NullAuthControllerFactory::new()),
            pool: Arc::new(SessionPool::new()),
            properties: Arc::new(ServerProperties::default()),
            client_auth_cache: Arc::new(ClientAuthCache::default()),
            throttler: Throttler::new(config.max_concurrent_transactions),
            config,
        }
    }

    #[must_use]
    pub fn with_proxy_resolver(mut self, resolver: Arc<dyn ProxyResolver>) -> Self {
        self.proxy_resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_auth_factory(mut self, factory: Arc<dyn AuthControllerFactory>) -> Self {
        self.auth_factory = factory;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Arc<ServerProperties>) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_client_auth_cache(mut self, cache: Arc<ClientAuthCache>) -> Self {
        self.client_auth_cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.throttler = Throttler::new(config.max_concurrent_transactions);
        self.config = config;
        self
    }

    #[must_use]
    pub fn properties(&self) -> &Arc<ServerProperties> {
        &self.properties
    }

    #[must_use]
    pub fn client_auth_cache(&self) -> &Arc<ClientAuthCache> {
        &self.client_auth_cache
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub(crate) fn proxy_resolver(&self) -> &Arc<dyn ProxyResolver> {
        &self.proxy_resolver
    }

    pub(crate) fn auth_factory(&self) -> &Arc<dyn AuthControllerFactory> {
        &self.auth_factory
    }

    pub(crate) fn throttler(&self) -> &Throttler {
        &self.throttler
    }
}

impl fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSession")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
