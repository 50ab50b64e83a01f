use std::fmt;

use crate::address::{Destination, HostPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Wire protocol negotiated (or about to be negotiated) for an exchange.
pub enum NextProto {
    Http11,
    H2,
    H3,
}

impl NextProto {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::H2 => "h2",
            Self::H3 => "h3",
        }
    }

    /// True for protocols that multiplex many streams over one session.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Self::H2 | Self::H3)
    }
}

impl fmt::Display for NextProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A server-advertised alternative endpoint for the same origin,
/// typically an upgrade to a faster transport.
pub struct AlternativeService {
    pub protocol: NextProto,
    pub address: HostPort,
}

impl AlternativeService {
    #[must_use]
    pub fn new(protocol: NextProto, address: HostPort) -> Self {
        Self { protocol, address }
    }
}

impl fmt::Display for AlternativeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.protocol, self.address)
    }
}

/// Parse the value of an `Alt-Svc` response header into the alternative
/// services it advertises for `origin`.
///
/// Entries whose protocol id is unknown are skipped; `clear` empties the
/// advertisement. Only the protocol id, optional host and port are
/// interpreted; parameters such as `ma` are ignored (the shared store
/// applies its own lifetime policy).
#[must_use]
pub fn parse_alt_svc_header(value: &str, origin: &Destination) -> Vec<AlternativeService> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("clear") {
        return Vec::new();
    }

    let mut services = Vec::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        let Some((proto_id, rest)) = entry.split_once('=') else {
            continue;
        };
        let protocol = match proto_id.trim() {
            "h2" => NextProto::H2,
            "h3" | "h3-29" => NextProto::H3,
            "http/1.1" => NextProto::Http11,
            _ => continue,
        };

        // authority is a quoted `[host]:port`, parameters follow after `;`
        let authority = rest.split(';').next().unwrap_or("").trim();
        let authority = authority.trim_matches('"');
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let Ok(port) = port.parse::<u16>() else {
                    continue;
                };
                (host, port)
            }
            None => continue,
        };
        let host = if host.is_empty() {
            origin.address.host()
        } else {
            host
        };

        services.push(AlternativeService::new(
            protocol,
            HostPort::new(host, port),
        ));
    }
    services
}
