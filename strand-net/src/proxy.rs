use std::fmt;

use crate::address::HostPort;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// One hop a request may be routed through.
pub enum ProxyServer {
    /// No proxy: connect straight to the destination.
    Direct,
    /// Plain http proxy.
    Http(HostPort),
    /// Proxy reached over a secure connection.
    Https(HostPort),
}

impl ProxyServer {
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    #[must_use]
    pub fn host_port(&self) -> Option<&HostPort> {
        match self {
            Self::Direct => None,
            Self::Http(hp) | Self::Https(hp) => Some(hp),
        }
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Http(hp) => write!(f, "http://{hp}"),
            Self::Https(hp) => write!(f, "https://{hp}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The resolved proxy configuration for one request, in fallback order.
///
/// A chain is immutable for the lifetime of one connection attempt;
/// [`ProxyChain::fallback`] yields a replacement chain advanced past the
/// failed hop rather than mutating in place.
pub struct ProxyChain {
    servers: Vec<ProxyServer>,
    cursor: usize,
}

impl ProxyChain {
    /// A chain that routes directly, with no proxy.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            servers: vec![ProxyServer::Direct],
            cursor: 0,
        }
    }

    /// A chain trying `servers` in order. An empty list degrades to direct.
    #[must_use]
    pub fn from_servers(servers: Vec<ProxyServer>) -> Self {
        if servers.is_empty() {
            Self::direct()
        } else {
            Self { servers, cursor: 0 }
        }
    }

    /// The hop in use for the current attempt.
    #[must_use]
    pub fn current(&self) -> &ProxyServer {
        self.servers
            .get(self.cursor)
            .unwrap_or(&ProxyServer::Direct)
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.current().is_direct()
    }

    /// The chain to use after the current hop failed, if any hop is left.
    #[must_use]
    pub fn fallback(&self) -> Option<Self> {
        if self.cursor + 1 < self.servers.len() {
            Some(Self {
                servers: self.servers.clone(),
                cursor: self.cursor + 1,
            })
        } else {
            None
        }
    }
}

impl fmt::Display for ProxyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.current(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_degrades_to_direct() {
        let chain = ProxyChain::from_servers(Vec::new());
        assert!(chain.is_direct());
        assert!(chain.fallback().is_none());
    }

    #[test]
    fn fallback_walks_the_chain_then_ends() {
        let chain = ProxyChain::from_servers(vec![
            ProxyServer::Https(HostPort::new("proxy-a", 443)),
            ProxyServer::Http(HostPort::new("proxy-b", 8080)),
            ProxyServer::Direct,
        ]);
        assert_eq!(
            chain.current(),
            &ProxyServer::Https(HostPort::new("proxy-a", 443))
        );

        let chain = chain.fallback().unwrap();
        assert_eq!(
            chain.current(),
            &ProxyServer::Http(HostPort::new("proxy-b", 8080))
        );

        let chain = chain.fallback().unwrap();
        assert!(chain.is_direct());
        assert!(chain.fallback().is_none());
    }
}
