pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{body::Body, response::Response};

use crate::{context::ProxyRequest, error::GatewayResult};

/// What the gateway does after a middleware has looked at an inbound request.
pub enum ControlFlow {
    /// Hand the request to the next middleware, and finally to the relay.
    Continue,
    /// Answer immediately; no service lookup or relay happens.
    ShortCircuit(Response<Body>),
}

/// A gate in front of the relay.
///
/// `on_request` runs in registration order. `on_response` runs in reverse order,
/// only for the middlewares whose `on_request` returned `Continue`, and sees the
/// final response whether it came from the backend or from a gateway error.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, req: &mut ProxyRequest) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _req: &ProxyRequest,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
