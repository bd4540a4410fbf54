//! HTTP server implementation for the API

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::handlers;
use super::models::{ApiError, CorrelationId, TranscribeQuery, CORRELATION_HEADER};
use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Multipart framing allowance on top of the upload limit
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.server.cors_origins;
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::HeaderName::from_static(CORRELATION_HEADER)])
}

/// Build the application router
pub fn router(orchestrator: Arc<Orchestrator>, config: Arc<Config>) -> Router {
    let body_limit = config.upload.max_file_size_bytes().saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let cors = cors_layer(&config);

    let app_state = AppState { orchestrator, config };

    Router::new()
        .route("/health", get(health_handler))
        .route("/model/info", get(model_info_handler))
        .route("/transcribe", post(transcribe_handler))
        .route("/jobs/submit", post(submit_job_handler))
        .route("/jobs/:id/progress", get(job_progress_handler))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn(correlation_middleware)),
        )
}

/// Configure and start the HTTP server; returns after a ctrl-c
pub async fn start_http_server(orchestrator: Arc<Orchestrator>, config: Arc<Config>, port: u16) -> Result<()> {
    info!("🚀 Starting HTTP server on port {}", port);

    let addr = format!("{}:{}", config.server.host, port);
    let app = router(orchestrator, Arc::clone(&config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🌐 API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("📴 Shutdown signal received");
}

/// Tag every request with a correlation id (the caller's, if it sent one)
/// and echo it in the response
async fn correlation_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let data = handlers::health_check(&state.orchestrator).await;
    (StatusCode::OK, Json(data))
}

/// Model info handler
async fn model_info_handler(State(state): State<AppState>) -> impl IntoResponse {
    let info = state.orchestrator.engine().model_info().await;
    (StatusCode::OK, Json(info))
}

/// Synchronous transcription handler
async fn transcribe_handler(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Query(query): Query<TranscribeQuery>,
    mut multipart: Multipart,
) -> Response {
    let options = match handlers::transcribe_options(&query, &state.config) {
        Ok(options) => options,
        Err(message) => return ApiError::validation(message, &correlation_id).into_response(),
    };
    let max_size = state.config.upload.max_file_size_bytes();
    let upload = match handlers::read_upload(&mut multipart, max_size, &correlation_id).await {
        Ok(upload) => upload,
        Err(e) => return e.into_response(),
    };

    match state
        .orchestrator
        .transcribe_upload(&upload.filename, &upload.bytes, &options)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => ApiError::service(&e, &correlation_id).into_response(),
    }
}

/// Asynchronous job submission handler
async fn submit_job_handler(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Query(query): Query<TranscribeQuery>,
    mut multipart: Multipart,
) -> Response {
    let options = match handlers::transcribe_options(&query, &state.config) {
        Ok(options) => options,
        Err(message) => return ApiError::validation(message, &correlation_id).into_response(),
    };
    let max_size = state.config.upload.max_file_size_bytes();
    let upload = match handlers::read_upload(&mut multipart, max_size, &correlation_id).await {
        Ok(upload) => upload,
        Err(e) => return e.into_response(),
    };

    match state
        .orchestrator
        .submit_upload(&upload.filename, &upload.bytes, &options)
        .await
    {
        Ok(submission) => (StatusCode::OK, Json(submission)).into_response(),
        Err(e) => ApiError::service(&e, &correlation_id).into_response(),
    }
}

/// Job progress handler
async fn job_progress_handler(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    match state.orchestrator.job_progress(&id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => ApiError::not_found(format!("Job {} not found", id), &correlation_id).into_response(),
    }
}
