use async_trait::async_trait;
use axum::response::IntoResponse;

use crate::{
    context::ProxyRequest,
    error::{GatewayError, GatewayResult},
    identity::ClientIdentityExtractor,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::RateLimiter,
};

/// Identifies the caller and charges one request against its quota.
///
/// The quota is consumed before the service lookup, so unknown services and
/// failed relays still count.
pub struct RateLimitMiddleware {
    identity: ClientIdentityExtractor,
    limiter: RateLimiter,
    fail_open_on_error: bool,
}

impl RateLimitMiddleware {
    pub fn new(
        identity: ClientIdentityExtractor,
        limiter: RateLimiter,
        fail_open_on_error: bool,
    ) -> Self {
        Self {
            identity,
            limiter,
            fail_open_on_error,
        }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, req: &mut ProxyRequest) -> GatewayResult<ControlFlow> {
        let client = self.identity.extract(&req.headers, req.peer_ip);
        let decision = self.limiter.check_and_increment(&client).await;
        req.client = Some(client);

        if let Ok(decision) = &decision {
            req.quota_used = Some(decision.count);
        }

        match decision {
            Ok(decision) if decision.allowed => Ok(ControlFlow::Continue),
            Ok(decision) => {
                tracing::info!(
                    request_id = %req.request_id,
                    client = req.client.as_ref().map(|c| c.as_str()),
                    count = decision.count,
                    retry_after_secs = decision.retry_after_secs,
                    "rate limit exceeded"
                );
                Ok(ControlFlow::ShortCircuit(
                    GatewayError::RateLimited {
                        retry_after_secs: decision.retry_after_secs,
                    }
                    .into_response(),
                ))
            }
            Err(err) if self.fail_open_on_error => {
                tracing::warn!(
                    request_id = %req.request_id,
                    error = %err.detail(),
                    "rate limiter backend failed; allowing request because fail-open is enabled"
                );
                Ok(ControlFlow::Continue)
            }
            Err(err) => Err(err),
        }
    }
}
