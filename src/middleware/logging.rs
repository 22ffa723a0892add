use async_trait::async_trait;
use axum::{body::Body, response::Response};

use crate::{
    context::ProxyRequest,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

/// One line when a request arrives and one when its response leaves.
pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, req: &mut ProxyRequest) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %req.request_id,
            method = %req.method,
            path = %req.uri.path(),
            service = req.service_name(),
            peer_ip = ?req.peer_ip,
            body_bytes = req.body.len(),
            "proxy request received"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(&self, req: &ProxyRequest, response: &mut Response<Body>) -> GatewayResult<()> {
        let status = response.status();
        let latency_ms = req.started_at.elapsed().as_millis() as u64;
        let client = req.client.as_ref().map(|c| c.as_str());

        if status.is_server_error() {
            tracing::warn!(
                request_id = %req.request_id,
                method = %req.method,
                service = req.service_name(),
                client,
                quota_used = req.quota_used,
                status = status.as_u16(),
                latency_ms,
                "proxy request failed"
            );
        } else {
            tracing::info!(
                request_id = %req.request_id,
                method = %req.method,
                service = req.service_name(),
                client,
                quota_used = req.quota_used,
                status = status.as_u16(),
                latency_ms,
                "proxy request completed"
            );
        }
        Ok(())
    }
}
