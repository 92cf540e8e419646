mod chat;
mod config;
mod db;
mod error;
mod metrics;
mod protocol;
mod store;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chat::ChatService;
use crate::config::{LogFormat, RelayConfig};
use crate::db::pool::{create_sqlite_pool, PoolConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, RelayError, REQUEST_ID_HEADER,
};
use crate::metrics::RelayMetrics;
use crate::store::MessageStore;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
struct AppState {
    service: Arc<ChatService>,
    metrics: Arc<RelayMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let pool = create_sqlite_pool(&config.database_url, PoolConfig::from_env())
        .await
        .with_context(|| format!("failed to open message database at {}", config.database_url))?;
    let store =
        Arc::new(MessageStore::open(pool).await.context("failed to initialize message store")?);
    let service = Arc::new(ChatService::new(Arc::clone(&store), config.recovery_window));
    let app = build_router(service, relay_metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        recovery_window_secs = config.recovery_window.as_secs(),
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    store.close().await;
    info!("message store closed");
    Ok(())
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
    Ok(())
}

fn build_router(service: Arc<ChatService>, metrics: Arc<RelayMetrics>) -> Router {
    let state = AppState { service: Arc::clone(&service), metrics };
    apply_middleware(
        Router::new()
            .route("/", get(index))
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .with_state(state)
            .merge(ws::router(service))
            .fallback(not_found),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn not_found() -> RelayError {
    RelayError::from_code(ErrorCode::NotFound)
}

async fn healthz(State(state): State<AppState>) -> Result<(StatusCode, &'static str), RelayError> {
    if let Err(store_error) = state.service.store().health_check().await {
        warn!(error = ?store_error, "health check failed");
        return Err(RelayError::from_code(ErrorCode::StorageUnavailable));
    }
    Ok((StatusCode::OK, "ok"))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(error = %signal_error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::chat::ChatService;
    use crate::metrics::RelayMetrics;
    use crate::store::MessageStore;

    async fn test_service() -> Arc<ChatService> {
        Arc::new(ChatService::new(
            Arc::new(MessageStore::for_tests().await),
            Duration::from_secs(120),
        ))
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        String::from_utf8(bytes.to_vec()).expect("response body should be valid utf8")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let app = build_router(test_service().await, Arc::new(RelayMetrics::default()));
        let response = app.oneshot(get_request("/healthz")).await.expect("healthz should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn request_id_is_propagated_from_client() {
        let app = build_router(test_service().await, Arc::new(RelayMetrics::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-123")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("healthz should respond");

        assert_eq!(response.headers()["x-request-id"], "req-123");
    }

    #[tokio::test]
    async fn health_check_reports_unavailable_store() {
        let service = test_service().await;
        service.store().close().await;
        let app = build_router(service, Arc::new(RelayMetrics::default()));

        let response = app.oneshot(get_request("/healthz")).await.expect("healthz should respond");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("error body should be json");
        assert_eq!(body["error"]["code"], "STORAGE_UNAVAILABLE");
        assert_eq!(body["error"]["retryable"], true);
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn index_serves_chat_page() {
        let app = build_router(test_service().await, Arc::new(RelayMetrics::default()));
        let response = app.oneshot(get_request("/")).await.expect("index should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("parley-chat.v1"));
        assert!(body.contains("/v1/ws"));
    }

    #[tokio::test]
    async fn unknown_routes_return_error_envelope() {
        let app = build_router(test_service().await, Arc::new(RelayMetrics::default()));
        let response = app.oneshot(get_request("/nope")).await.expect("fallback should respond");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("error body should be json");
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let relay_metrics = Arc::new(RelayMetrics::default());
        relay_metrics.record_message_appended(4);
        let app = build_router(test_service().await, relay_metrics);

        let response = app.oneshot(get_request("/metrics")).await.expect("metrics should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("chat_messages_appended_total 1"));
        assert!(body.contains("chat_latest_message_id 4"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));
        let response = app.oneshot(get_request("/panic")).await.expect("panic should respond");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
