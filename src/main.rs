mod config;
mod context;
mod error;
mod gateway;
mod identity;
mod middleware;
mod ratelimit;
mod relay;
mod resolver;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    routing::any,
};
use gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let gateway = Arc::new(Gateway::from_config(cfg).await?);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "service gateway listening");

    axum::serve(listener, app(gateway).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    tracing::info!("service gateway stopped");
    Ok(())
}

/// Every method and path goes to the gateway; routing happens on the first path segment.
fn app(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(any(proxy_handler)).with_state(gateway)
}

// Dropping this future (caller hung up) also drops the in-flight backend call.
async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    });

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::to_bytes,
        extract::connect_info::MockConnectInfo,
        http::StatusCode,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::tests::{spawn_echo_backend, test_config};

    #[tokio::test]
    async fn router_sends_any_method_and_path_to_gateway() {
        let backend = spawn_echo_backend().await;
        let gateway = Gateway::from_config(test_config(&[("svcA", backend.addr)], 1))
            .await
            .unwrap();
        let app = app(Arc::new(gateway))
            .layer(MockConnectInfo(SocketAddr::from(([192, 0, 2, 20], 40_000))));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/svcA/products/7/?force=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["method"], "DELETE");
        assert_eq!(echoed["path"], "/products/7/");
        assert_eq!(echoed["query"], "force=true");

        // Same peer address, quota of one.
        let response = app
            .oneshot(Request::builder().uri("/svcA/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
