use anyhow::{Context, Result, anyhow, bail};
use reqwest::Url;
use std::{
    env,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub path_prefix: String,
    pub services: Vec<ServiceConfig>,
    pub rate_limit: RateLimitConfig,
    pub identity: IdentityConfig,
    pub upstream: UpstreamConfig,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window: Duration,
    pub policy: WindowPolicy,
    pub backend: RateLimitBackendConfig,
    pub fail_open_on_error: bool,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Expiry is set by the first admitted request and left alone afterwards.
    Fixed,
    /// Every admitted request pushes the expiry out by a full window.
    Rolling,
}

#[derive(Debug, Clone)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub forwarded_header: String,
    pub trusted_proxies: ProxyTrust,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTrust {
    Any,
    Nobody,
    Peers(Vec<IpAddr>),
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. A key that is set but does not
    /// parse is an error, never a silent fallback to the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = parse_env(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?;

        let services = parse_services(&var(
            "SERVICE_MAP",
            "user_service=http://127.0.0.1:8001,product_service=http://127.0.0.1:8002",
        ))
        .context("invalid SERVICE_MAP")?;

        let path_prefix = normalize_prefix(&var("GATEWAY_PATH_PREFIX", ""));

        let max_requests = parse_env(&lookup, "RATE_LIMIT", 100u64)?;
        if max_requests == 0 {
            bail!("RATE_LIMIT must be greater than zero");
        }
        let window_secs = parse_env(&lookup, "RATE_LIMIT_TIMEOUT", 60u64)?;
        if window_secs == 0 {
            bail!("RATE_LIMIT_TIMEOUT must be greater than zero");
        }

        let policy = parse_window_policy(&var("RATE_LIMIT_WINDOW", "fixed"))?;

        let backend = match var("RATE_LIMIT_BACKEND", "memory").to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => RateLimitBackendConfig::InMemory,
            "redis" => RateLimitBackendConfig::Redis {
                url: var("REDIS_URL", "redis://127.0.0.1:6379"),
                key_prefix: var("REDIS_KEY_PREFIX", "rate_limit"),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let rate_limit = RateLimitConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
            policy,
            backend,
            fail_open_on_error: parse_env(&lookup, "RATE_LIMIT_FAIL_OPEN", false)?,
            sweep_interval: Duration::from_secs(
                parse_env(&lookup, "RATE_LIMIT_SWEEP_SECONDS", 30u64)?.max(1),
            ),
        };

        let identity = IdentityConfig {
            forwarded_header: var("FORWARDED_FOR_HEADER", "x-forwarded-for").to_ascii_lowercase(),
            trusted_proxies: parse_proxy_trust(&var("TRUSTED_PROXIES", "*"))?,
        };

        let upstream = UpstreamConfig {
            timeout: Duration::from_millis(
                parse_env(&lookup, "UPSTREAM_TIMEOUT_MS", 10_000u64)?.max(100),
            ),
            connect_timeout: Duration::from_millis(
                parse_env(&lookup, "UPSTREAM_CONNECT_TIMEOUT_MS", 2_000u64)?.max(50),
            ),
        };

        let log_format = match var("LOG_FORMAT", "compact").to_ascii_lowercase().as_str() {
            "compact" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        Ok(Self {
            bind_addr,
            path_prefix,
            services,
            rate_limit,
            identity,
            upstream,
            max_body_bytes: parse_env(&lookup, "MAX_BODY_BYTES", 2_621_440usize)?,
            log_format,
        })
    }
}

/// Parses `name=url` pairs separated by commas.
pub fn parse_services(raw: &str) -> Result<Vec<ServiceConfig>> {
    let mut out: Vec<ServiceConfig> = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (name, url) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid service entry: {chunk}"))?;
        let name = name.trim();
        if !is_service_name(name) {
            bail!("invalid service name {name:?}");
        }
        if out.iter().any(|s| s.name == name) {
            bail!("duplicate service name {name:?}");
        }

        out.push(ServiceConfig {
            name: name.to_string(),
            base_url: normalize_base_url(url.trim())
                .with_context(|| format!("invalid base URL for {name}"))?,
        });
    }

    if out.is_empty() {
        bail!("no services configured");
    }
    Ok(out)
}

pub fn is_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub fn normalize_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("unsupported scheme {}", url.scheme());
    }
    if url.host_str().is_none() {
        bail!("missing host");
    }
    if url.query().is_some() || url.fragment().is_some() {
        bail!("base URL must not carry a query or fragment");
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

pub fn parse_window_policy(raw: &str) -> Result<WindowPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(WindowPolicy::Fixed),
        "rolling" | "sliding" => Ok(WindowPolicy::Rolling),
        other => Err(anyhow!("unsupported RATE_LIMIT_WINDOW: {other}")),
    }
}

pub fn parse_proxy_trust(raw: &str) -> Result<ProxyTrust> {
    let raw = raw.trim();
    match raw.to_ascii_lowercase().as_str() {
        "*" | "any" => return Ok(ProxyTrust::Any),
        "" | "none" => return Ok(ProxyTrust::Nobody),
        _ => {}
    }

    let peers = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("invalid TRUSTED_PROXIES entry: {s}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ProxyTrust::Peers(peers))
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_env<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_map_and_strips_trailing_slash() {
        let services =
            parse_services("user_service=http://user:8000/, product_service = http://product:8000")
                .unwrap();
        assert_eq!(services, vec![
            ServiceConfig {
                name: "user_service".into(),
                base_url: "http://user:8000".into(),
            },
            ServiceConfig {
                name: "product_service".into(),
                base_url: "http://product:8000".into(),
            },
        ]);
    }

    #[test]
    fn keeps_base_path_of_service_url() {
        let services = parse_services("svc=https://backend.internal/api/v1/").unwrap();
        assert_eq!(services[0].base_url, "https://backend.internal/api/v1");
    }

    #[test]
    fn rejects_malformed_service_maps() {
        assert!(parse_services("").is_err());
        assert!(parse_services("no-equals-sign").is_err());
        assert!(parse_services("=http://a").is_err());
        assert!(parse_services("a/b=http://a").is_err());
        assert!(parse_services("svc=not a url").is_err());
        assert!(parse_services("svc=ftp://files").is_err());
        assert!(parse_services("svc=http://a?x=1").is_err());
        assert!(parse_services("svc=http://a,svc=http://b").is_err());
    }

    #[test]
    fn parses_window_policies() {
        assert_eq!(parse_window_policy("fixed").unwrap(), WindowPolicy::Fixed);
        assert_eq!(parse_window_policy("ROLLING").unwrap(), WindowPolicy::Rolling);
        assert!(parse_window_policy("leaky").is_err());
    }

    #[test]
    fn parses_proxy_trust() {
        assert_eq!(parse_proxy_trust("*").unwrap(), ProxyTrust::Any);
        assert_eq!(parse_proxy_trust("").unwrap(), ProxyTrust::Nobody);
        assert_eq!(parse_proxy_trust("none").unwrap(), ProxyTrust::Nobody);
        assert_eq!(
            parse_proxy_trust("10.0.0.1, ::1").unwrap(),
            ProxyTrust::Peers(vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()])
        );
        assert!(parse_proxy_trust("10.0.0.0/8").is_err());
    }

    fn lookup(pairs: Vec<(&'static str, &'static str)>) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = GatewayConfig::from_lookup(lookup(vec![])).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.rate_limit.max_requests, 100);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(60));
        assert_eq!(cfg.rate_limit.policy, WindowPolicy::Fixed);
        assert_eq!(cfg.max_body_bytes, 2_621_440);
        assert_eq!(cfg.identity.trusted_proxies, ProxyTrust::Any);
        assert_eq!(cfg.services.len(), 2);
    }

    #[test]
    fn reads_set_values() {
        let cfg = GatewayConfig::from_lookup(lookup(vec![
            ("RATE_LIMIT", " 5 "),
            ("RATE_LIMIT_TIMEOUT", "30"),
            ("RATE_LIMIT_WINDOW", "rolling"),
            ("UPSTREAM_TIMEOUT_MS", "1500"),
            ("MAX_BODY_BYTES", "4096"),
            ("GATEWAY_PATH_PREFIX", "api"),
            ("LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(cfg.rate_limit.max_requests, 5);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(30));
        assert_eq!(cfg.rate_limit.policy, WindowPolicy::Rolling);
        assert_eq!(cfg.upstream.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.max_body_bytes, 4096);
        assert_eq!(cfg.path_prefix, "/api");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn malformed_values_fail_instead_of_defaulting() {
        for (key, value) in [
            ("RATE_LIMIT", "1O"),
            ("RATE_LIMIT_TIMEOUT", "sixty"),
            ("RATE_LIMIT_SWEEP_SECONDS", "-1"),
            ("RATE_LIMIT_FAIL_OPEN", "yes"),
            ("UPSTREAM_TIMEOUT_MS", "10s"),
            ("UPSTREAM_CONNECT_TIMEOUT_MS", ""),
            ("MAX_BODY_BYTES", "2MB"),
            ("BIND_ADDR", "localhost"),
            ("LOG_FORMAT", "xml"),
            ("RATE_LIMIT", "0"),
        ] {
            let err = GatewayConfig::from_lookup(lookup(vec![(key, value)])).unwrap_err();
            assert!(format!("{err:#}").contains(key), "{key}={value}: {err:#}");
        }
    }

    #[test]
    fn normalizes_path_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("api"), "/api");
        assert_eq!(normalize_prefix("/api/"), "/api");
    }
}
