use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::identity::ClientIdentity;

/// One inbound call, buffered and split into its routing components.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_ip: Option<IpAddr>,
    pub started_at: Instant,
    /// `None` when the path has no service segment or lies outside the mount prefix.
    pub target: Option<ProxyTarget>,
    pub client: Option<ClientIdentity>,
    /// Counter value reported by the rate limiter for this request.
    pub quota_used: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub service_name: String,
    /// Still percent-encoded, without the leading slash. May be empty.
    pub remaining_path: String,
}

impl ProxyRequest {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        peer_ip: Option<IpAddr>,
        path_prefix: &str,
    ) -> Self {
        let target = ProxyTarget::parse(uri.path(), path_prefix);
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            peer_ip,
            started_at: Instant::now(),
            target,
            client: None,
            quota_used: None,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.service_name.as_str())
    }
}

impl ProxyTarget {
    pub fn parse(path: &str, path_prefix: &str) -> Option<Self> {
        let path = if path_prefix.is_empty() {
            path
        } else {
            let rest = path.strip_prefix(path_prefix)?;
            if !rest.is_empty() && !rest.starts_with('/') {
                return None;
            }
            rest
        };

        let path = path.strip_prefix('/')?;
        let (service_name, remaining_path) = path.split_once('/').unwrap_or((path, ""));
        if service_name.is_empty() || remaining_path.split('/').any(is_dot_segment) {
            return None;
        }

        Some(Self {
            service_name: service_name.to_string(),
            remaining_path: remaining_path.to_string(),
        })
    }
}

/// `.` or `..`, literal or percent-encoded. URL parsing would resolve these and
/// climb out of the service's base path.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}
