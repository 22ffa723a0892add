use std::{
    net::IpAddr,
    sync::Arc,
};

use anyhow::{Context, anyhow};
use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::Request,
    response::{
        IntoResponse,
        Response,
    },
};
use http_body_util::LengthLimitError;
use uuid::Uuid;

use crate::{
    config::{
        GatewayConfig,
        RateLimitBackendConfig,
    },
    context::ProxyRequest,
    error::GatewayError,
    identity::ClientIdentityExtractor,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        CounterStore,
        RateLimitPolicy,
        RateLimiter,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
    },
    relay::RequestRelay,
    resolver::ServiceResolver,
};

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    resolver: ServiceResolver,
    relay: RequestRelay,
    path_prefix: String,
    max_body_bytes: usize,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn CounterStore> = match &config.rate_limit.backend {
            RateLimitBackendConfig::InMemory => {
                let store = Arc::new(InMemoryCounterStore::new());
                let _sweeper = store.spawn_sweeper(config.rate_limit.sweep_interval);
                store
            }
            RateLimitBackendConfig::Redis { url, key_prefix } => Arc::new(
                RedisCounterStore::new(url.clone(), key_prefix.clone())
                    .await
                    .map_err(|e| anyhow!(e.detail()))
                    .context("failed to connect rate-limit store")?,
            ),
        };

        Self::with_store(config, store)
    }

    /// Builds the gateway around an already constructed counter store.
    pub fn with_store(config: GatewayConfig, store: Arc<dyn CounterStore>) -> anyhow::Result<Self> {
        let resolver = ServiceResolver::new(config.services).context("invalid route table")?;
        let relay = RequestRelay::new(&config.upstream)
            .map_err(|e| anyhow!(e.detail()))
            .context("failed to build upstream client")?;

        let identity = ClientIdentityExtractor::new(&config.identity);
        if identity.trusts_any_peer() {
            tracing::warn!(
                header = %config.identity.forwarded_header,
                "client identity header is trusted from any peer; set TRUSTED_PROXIES to restrict it"
            );
        }

        let limiter = RateLimiter::new(store, RateLimitPolicy {
            max_requests: config.rate_limit.max_requests,
            window: config.rate_limit.window,
            window_policy: config.rate_limit.policy,
        });

        let middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(RateLimitMiddleware::new(
                identity,
                limiter,
                config.rate_limit.fail_open_on_error,
            )),
        ];

        for route in resolver.services() {
            tracing::info!(service = %route.name, base_url = %route.base_url, "registered service");
        }

        Ok(Self {
            middlewares,
            resolver,
            relay,
            path_prefix: config.path_prefix,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn handle_http(&self, request: Request<Body>, peer_ip: Option<IpAddr>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(err) if exceeds_length_limit(&err) => {
                return GatewayError::PayloadTooLarge.into_response();
            }
            Err(err) => {
                tracing::debug!(error = %err, "failed to buffer request body");
                return GatewayError::InvalidBody(err.to_string()).into_response();
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut req = ProxyRequest::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            peer_ip,
            &self.path_prefix,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut req).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &req, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %req.request_id,
                        middleware = middleware.name(),
                        error = %err.detail(),
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &req, err.into_response()).await;
                }
            }
        }

        let response = match self.proxy(&req).await {
            Ok(response) => response,
            Err(err) => {
                self.log_failure(&req, &err);
                err.into_response()
            }
        };

        self.finish(&executed, &req, response).await
    }

    async fn proxy(&self, req: &ProxyRequest) -> Result<Response<Body>, GatewayError> {
        let service_name = req.service_name().ok_or(GatewayError::ServiceNotFound)?;
        let route = self.resolver.resolve(service_name)?;
        let response = self.relay.forward(req, route).await?;
        Ok(response.into_response())
    }

    fn log_failure(&self, req: &ProxyRequest, err: &GatewayError) {
        match err {
            GatewayError::ServiceNotFound => tracing::debug!(
                request_id = %req.request_id,
                service = req.service_name(),
                "unknown service"
            ),
            GatewayError::Relay(relay) => tracing::warn!(
                request_id = %req.request_id,
                service = req.service_name(),
                kind = relay.kind(),
                error = %relay,
                "backend call failed"
            ),
            other => tracing::error!(
                request_id = %req.request_id,
                service = req.service_name(),
                error = %other.detail(),
                "unexpected gateway fault"
            ),
        }
    }

    async fn finish(
        &self,
        executed: &[usize],
        req: &ProxyRequest,
        mut response: Response<Body>,
    ) -> Response<Body> {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(req, &mut response).await {
                tracing::warn!(
                    request_id = %req.request_id,
                    middleware = middleware.name(),
                    error = %err.detail(),
                    "middleware post-response hook failed"
                );
            }
        }
        response
    }
}

fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        Some(err as &(dyn std::error::Error + 'static));
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}
