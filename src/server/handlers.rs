use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::models::{
    CreateSessionRequest, CreateSessionResponse, ErrorResponse, ExportResponse, FieldResponse,
    PageView, SignatureRequest, SignatureResponse, TextRequest, ToggleResponse,
};
use super::sessions;
use super::state::{ServerError, ServerState};
use crate::detection::FieldDetector;
use crate::raster::Rasterizer;
use crate::settings;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub async fn run_server(
    settings: settings::Settings,
    addr: String,
    rasterizer: Arc<dyn Rasterizer>,
    detector: Arc<dyn FieldDetector>,
) -> Result<()> {
    let state = Arc::new(ServerState::new(settings, rasterizer, detector));
    if let Some(ttl) = state.session_ttl() {
        spawn_session_sweeper(state.clone(), ttl);
    }
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind server address: {}", addr))?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_session_sweeper(state: Arc<ServerState>, ttl: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl.min(std::time::Duration::from_secs(60)));
        loop {
            interval.tick().await;
            let evicted = state.evict_idle(Instant::now()).await;
            if evicted > 0 {
                info!("dropped {} idle session(s)", evicted);
            }
        }
    });
}

pub(crate) fn router(state: Arc<ServerState>) -> Router {
    let upload_limit = state.settings.server_max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", delete(close_session))
        .route("/sessions/:id/pages/:index", get(show_page))
        .route("/sessions/:id/pages/:index/rescan", post(rescan_page))
        .route(
            "/sessions/:id/signature",
            post(set_signature).delete(clear_signature),
        )
        .route("/sessions/:id/fields/:field_id/toggle", post(toggle_field))
        .route("/sessions/:id/fields/:field_id/text", put(update_text))
        .route("/sessions/:id/export", get(export))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
        .layer(axum::middleware::from_fn(cors_middleware))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response<Body>, StatusCode> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return Ok(response);
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    Ok(response)
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type,authorization"),
    );
}

fn respond<T>(result: Result<T, ServerError>) -> ApiResult<T> {
    result
        .map(Json)
        .map_err(|err| (err.status, Json(ErrorResponse { error: err.message })))
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    respond(sessions::create_session(&state, payload).await)
}

async fn close_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    respond(
        sessions::close_session(&state, &id)
            .await
            .map(|()| serde_json::json!({ "status": "ok" })),
    )
}

async fn show_page(
    State(state): State<Arc<ServerState>>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<PageView> {
    respond(sessions::show_page(&state, &id, index).await)
}

async fn rescan_page(
    State(state): State<Arc<ServerState>>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<PageView> {
    respond(sessions::rescan_page(&state, &id, index).await)
}

async fn set_signature(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(payload): Json<SignatureRequest>,
) -> ApiResult<SignatureResponse> {
    respond(sessions::set_signature(&state, &id, payload).await)
}

async fn clear_signature(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    respond(
        sessions::clear_signature(&state, &id)
            .await
            .map(|()| serde_json::json!({ "status": "ok" })),
    )
}

async fn toggle_field(
    State(state): State<Arc<ServerState>>,
    Path((id, field_id)): Path<(String, String)>,
) -> ApiResult<ToggleResponse> {
    respond(sessions::toggle_field(&state, &id, &field_id).await)
}

async fn update_text(
    State(state): State<Arc<ServerState>>,
    Path((id, field_id)): Path<(String, String)>,
    Json(payload): Json<TextRequest>,
) -> ApiResult<FieldResponse> {
    respond(sessions::update_text(&state, &id, &field_id, payload).await)
}

async fn export(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExportResponse> {
    respond(sessions::export(&state, &id).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_keep_status_and_message() {
        let err = respond::<()>(Err(ServerError::not_found("unknown session: x"))).unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        assert_eq!(err.1.0.error, "unknown session: x");
    }

    #[test]
    fn cors_headers_allow_editing_methods() {
        let mut headers = HeaderMap::new();
        apply_cors_headers(&mut headers);
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert!(
            headers["access-control-allow-methods"]
                .to_str()
                .unwrap()
                .contains("PUT,DELETE")
        );
    }
}
