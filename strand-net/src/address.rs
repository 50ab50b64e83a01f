use std::fmt;

use crate::error::{NetError, NetResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A host name (or literal address) together with a port.
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Url scheme of a request destination.
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// `http` protocol default port
    pub const HTTP_DEFAULT_PORT: u16 = 80;
    /// `https` protocol default port
    pub const HTTPS_DEFAULT_PORT: u16 = 443;

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    #[must_use]
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => Self::HTTP_DEFAULT_PORT,
            Self::Https => Self::HTTPS_DEFAULT_PORT,
        }
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// The origin a request is addressed to: scheme + host + effective port.
pub struct Destination {
    pub protocol: Protocol,
    pub address: HostPort,
}

impl Destination {
    #[must_use]
    pub fn new(protocol: Protocol, address: HostPort) -> Self {
        Self { protocol, address }
    }

    /// Extract the destination from a request [`http::Uri`].
    ///
    /// The uri must be absolute-form with an `http` or `https` scheme.
    pub fn from_uri(uri: &http::Uri) -> NetResult<Self> {
        let protocol = match uri.scheme_str() {
            Some("http") => Protocol::Http,
            Some("https") => Protocol::Https,
            _ => return Err(NetError::Unexpected("request uri without http(s) scheme")),
        };
        let host = uri
            .host()
            .ok_or(NetError::Unexpected("request uri without host"))?;
        let port = uri.port_u16().unwrap_or_else(|| protocol.default_port());
        Ok(Self {
            protocol,
            address: HostPort::new(host, port),
        })
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.protocol.is_secure()
    }

    /// Host header value for this destination: the port is included
    /// only when it differs from the scheme default.
    #[must_use]
    pub fn host_header_value(&self) -> String {
        if self.address.port() == self.protocol.default_port() {
            self.address.host().to_owned()
        } else {
            self.address.to_string()
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_from_uri_fills_default_port() {
        let uri: http::Uri = "https://example.com/index.html".parse().unwrap();
        let dest = Destination::from_uri(&uri).unwrap();
        assert_eq!(dest.protocol, Protocol::Https);
        assert_eq!(dest.address, HostPort::new("example.com", 443));
        assert_eq!(dest.host_header_value(), "example.com");
    }

    #[test]
    fn destination_keeps_explicit_port() {
        let uri: http::Uri = "http://example.com:8080/".parse().unwrap();
        let dest = Destination::from_uri(&uri).unwrap();
        assert_eq!(dest.address.port(), 8080);
        assert_eq!(dest.host_header_value(), "example.com:8080");
    }

    #[test]
    fn destination_rejects_other_schemes() {
        let uri: http::Uri = "ftp://example.com/".parse().unwrap();
        assert!(Destination::from_uri(&uri).is_err());
    }
}
