use std::{fmt, net::IpAddr};

use http::{HeaderMap, HeaderName};

use crate::config::{IdentityConfig, ProxyTrust};

const UNKNOWN_CLIENT: &str = "unknown";

/// Key that rate-limit counters are bucketed by. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the caller's identity from the forwarded-for header or the peer address.
///
/// The header is client-controlled. Whether it is honoured depends on [`ProxyTrust`]:
/// with `Any` every peer may set it, with `Peers` only the listed proxy hops may.
pub struct ClientIdentityExtractor {
    header: HeaderName,
    trust: ProxyTrust,
}

impl ClientIdentityExtractor {
    pub fn new(cfg: &IdentityConfig) -> Self {
        let header = HeaderName::from_bytes(cfg.forwarded_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-forwarded-for"));

        Self {
            header,
            trust: cfg.trusted_proxies.clone(),
        }
    }

    pub fn trusts_any_peer(&self) -> bool {
        self.trust == ProxyTrust::Any
    }

    pub fn extract(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientIdentity {
        if self.header_trusted(peer)
            && let Some(forwarded) = headers
                .get(&self.header)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        {
            return ClientIdentity(forwarded.to_string());
        }

        match peer {
            Some(ip) => ClientIdentity(ip.to_string()),
            None => ClientIdentity(UNKNOWN_CLIENT.to_string()),
        }
    }

    fn header_trusted(&self, peer: Option<IpAddr>) -> bool {
        match &self.trust {
            ProxyTrust::Any => true,
            ProxyTrust::Nobody => false,
            ProxyTrust::Peers(peers) => peer.is_some_and(|ip| peers.contains(&ip)),
        }
    }
}
