use crate::orchestrator::HomologyService;
use crate::rpc;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn build_router(service: Arc<HomologyService>) -> Router {
    Router::new()
        .route("/", post(rpc_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(service)
}

/// Caller token from `Authorization`, with an optional `Bearer`/`OAuth`
/// scheme stripped. Blank headers count as anonymous.
pub fn caller_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = ["Bearer ", "OAuth "]
        .iter()
        .find_map(|scheme| {
            raw.get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &raw[scheme.len()..])
        })
        .unwrap_or(raw)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn rpc_handler(
    State(service): State<Arc<HomologyService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(rpc::parse_error(&e.to_string()))).into_response();
        }
    };
    let token = caller_token(&headers);
    let response = rpc::handle_message(&service, &message, token.as_deref()).await;
    let status = if rpc::is_error(&response) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(response)).into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn serve(service: Arc<HomologyService>, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "homology server listening");
    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(async {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
        })
        .await
}

pub fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
