use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::address::{Destination, HostPort};
use crate::proto::AlternativeService;
use crate::tls::ClientIdentity;

/// How long a broken alternative service stays skipped.
const DEFAULT_BROKEN_ALTERNATIVE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct PropertiesInner {
    /// Advertised alternatives per origin, in advertisement order.
    alternatives: HashMap<Destination, Vec<AlternativeService>>,
    /// Alternatives confirmed broken, with their expiry.
    broken: HashMap<AlternativeService, Instant>,
    /// Hosts that demanded http/1.1 on a previous exchange.
    http11_required: HashSet<HostPort>,
}

#[derive(Debug)]
/// Cross-request facts about servers, shared by handle across transactions.
///
/// All access goes through `&self`; writers for any given key are expected
/// to be the single transaction currently acting on that server, so the
/// interior mutex is held only for map operations and never across awaits.
/// Broken entries expire lazily on lookup.
pub struct ServerProperties {
    inner: Mutex<PropertiesInner>,
    broken_ttl: Duration,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self::new(DEFAULT_BROKEN_ALTERNATIVE_TTL)
    }
}

impl ServerProperties {
    #[must_use]
    pub fn new(broken_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(PropertiesInner::default()),
            broken_ttl,
        }
    }

    /// Replace the advertised alternatives for `origin`.
    ///
    /// An empty list clears the advertisement.
    pub fn set_alternative_services(
        &self,
        origin: Destination,
        services: Vec<AlternativeService>,
    ) {
        let mut inner = self.inner.lock();
        if services.is_empty() {
            inner.alternatives.remove(&origin);
        } else {
            inner.alternatives.insert(origin, services);
        }
    }

    /// The first advertised alternative for `origin` that is not broken.
    #[must_use]
    pub fn alternative_service_for(&self, origin: &Destination) -> Option<AlternativeService> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.broken.retain(|_, expiry| *expiry > now);
        inner
            .alternatives
            .get(origin)?
            .iter()
            .find(|alt| !inner.broken.contains_key(*alt))
            .cloned()
    }

    /// Skip `service` for future requests until its ttl elapses.
    pub fn mark_alternative_service_broken(&self, service: AlternativeService) {
        tracing::debug!("marking alternative service broken: {service}");
        let expiry = Instant::now() + self.broken_ttl;
        self.inner.lock().broken.insert(service, expiry);
    }

    #[must_use]
    pub fn is_alternative_service_broken(&self, service: &AlternativeService) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.broken.retain(|_, expiry| *expiry > now);
        inner.broken.contains_key(service)
    }

    /// Record that `host` demanded http/1.1.
    pub fn set_http11_required(&self, host: HostPort) {
        self.inner.lock().http11_required.insert(host);
    }

    #[must_use]
    pub fn http11_required(&self, host: &HostPort) -> bool {
        self.inner.lock().http11_required.contains(host)
    }
}

#[derive(Debug, Default)]
/// Remembered client-certificate decisions per destination.
///
/// `None` records the decision to continue without a certificate, which is
/// as valid an answer to a challenge as supplying one.
pub struct ClientAuthCache {
    inner: Mutex<HashMap<HostPort, Option<ClientIdentity>>>,
}

impl ClientAuthCache {
    #[must_use]
    pub fn lookup(&self, host: &HostPort) -> Option<Option<ClientIdentity>> {
        self.inner.lock().get(host).cloned()
    }

    pub fn insert(&self, host: HostPort, identity: Option<ClientIdentity>) {
        self.inner.lock().insert(host, identity);
    }

    /// Forget the decision for `host`, typically after the peer rejected it.
    pub fn remove(&self, host: &HostPort) {
        self.inner.lock().remove(host);
    }
}
