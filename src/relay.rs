use std::{error::Error as _, time::Duration};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{Method, header::HeaderName};
use reqwest::{Url, redirect};
use thiserror::Error;

use crate::{
    config::UpstreamConfig,
    context::ProxyRequest,
    error::{GatewayError, GatewayResult},
    resolver::ServiceRoute,
};

/// Transport failures talking to a backend. All of them are answered with 502.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Protocol(String),
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

#[derive(Clone)]
pub struct RequestRelay {
    client: reqwest::Client,
    timeout: Duration,
}

impl RequestRelay {
    pub fn new(cfg: &UpstreamConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .connect_timeout(cfg.connect_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            timeout: cfg.timeout,
        })
    }

    pub async fn forward(
        &self,
        req: &ProxyRequest,
        route: &ServiceRoute,
    ) -> GatewayResult<ProxyResponse> {
        let remaining_path = req
            .target
            .as_ref()
            .map(|t| t.remaining_path.as_str())
            .unwrap_or_default();
        let target_url = target_url(&route.base_url, remaining_path, req.query())?;

        let mut request = self
            .client
            .request(req.method.clone(), target_url)
            .timeout(self.timeout);

        if !req.body.is_empty() || !matches!(req.method, Method::GET | Method::HEAD) {
            request = request.body(req.body.clone());
        }

        for (name, value) in &req.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response.bytes().await.map_err(classify)?;

        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }
}

/// `{base}/{remaining_path}` plus the inbound query string, byte for byte.
pub fn target_url(base_url: &str, remaining_path: &str, query: Option<&str>) -> GatewayResult<Url> {
    let mut raw = format!("{base_url}/{remaining_path}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(query);
    }

    Url::parse(&raw).map_err(|e| GatewayError::Internal(format!("invalid target URL {raw}: {e}")))
}

fn classify(err: reqwest::Error) -> GatewayError {
    let detail = error_chain(&err);
    if err.is_timeout() {
        RelayError::Timeout(detail).into()
    } else if err.is_connect() {
        RelayError::Connect(detail).into()
    } else if err.is_request() || err.is_body() || err.is_decode() || err.is_redirect() {
        RelayError::Protocol(detail).into()
    } else {
        GatewayError::Internal(detail)
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !detail.contains(&text) {
            detail.push_str(": ");
            detail.push_str(&text);
        }
        source = cause.source();
    }
    detail
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
