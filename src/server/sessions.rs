use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::models::{
    CreateSessionRequest, CreateSessionResponse, ExportResponse, FieldResponse, PageView,
    SignatureRequest, SignatureResponse, TextRequest, ToggleResponse,
};
use super::state::{ServerError, ServerState};
use crate::compose::{ExportOptions, compose_document};
use crate::data::{self, PDF_MIME};
use crate::fields::{Field, FieldId, FieldKind};
use crate::session::{PageSummary, PendingDetection, Session, SharedSession, detect_and_merge};
use crate::signature::{self, SignatureOptions, SignatureStyle};
use crate::toggle::{self, ToggleOutcome};

pub(crate) async fn create_session(
    state: &ServerState,
    request: CreateSessionRequest,
) -> Result<CreateSessionResponse, ServerError> {
    let encoded = request
        .data_base64
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServerError::bad_request("data_base64 is required"))?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| ServerError::bad_request(format!("invalid base64 data: {}", err)))?;
    let document = data::accept_document(bytes, request.mime.as_deref(), request.name.as_deref())
        .map_err(|err| ServerError::bad_request(err.to_string()))?;

    let mut session = Session::new();
    session
        .load_document(state.rasterizer.as_ref(), document)
        .await
        .map_err(|err| ServerError::unprocessable(format!("{:#}", err)))?;
    let pages = summaries(&session);
    let name = session.document_name().map(str::to_string);
    let id = state.insert(session.shared()).await;
    info!("session {} opened with {} page(s)", id, pages.len());
    Ok(CreateSessionResponse {
        session_id: id.to_string(),
        name,
        pages,
    })
}

pub(crate) async fn close_session(state: &ServerState, id: &str) -> Result<(), ServerError> {
    state.remove(id).await?;
    info!("session {} closed", id.trim());
    Ok(())
}

/// Shows a page, detecting its fields first when this is its first view.
pub(crate) async fn show_page(
    state: &Arc<ServerState>,
    id: &str,
    index: usize,
) -> Result<PageView, ServerError> {
    let session = state.session(id).await?;
    let (pending, prefetch) = {
        let mut guard = session.lock().await;
        let pending = guard
            .show_page(index)
            .map_err(|err| ServerError::not_found(err.to_string()))?;
        let prefetch = if state.settings.prefetch_next {
            guard.prefetch(index + 1)
        } else {
            None
        };
        (pending, prefetch)
    };
    if let Some(prefetch) = prefetch {
        spawn_detection(state, session.clone(), prefetch);
    }
    if let Some(pending) = pending {
        detect_and_merge(&session, state.detector.as_ref(), pending).await;
    }
    let guard = session.lock().await;
    page_view(&guard, index)
}

pub(crate) async fn rescan_page(
    state: &ServerState,
    id: &str,
    index: usize,
) -> Result<PageView, ServerError> {
    let session = state.session(id).await?;
    let pending = {
        let mut guard = session.lock().await;
        check_page(&guard, index)?;
        guard.request_rescan(index)
    };
    match pending {
        Some(pending) => {
            detect_and_merge(&session, state.detector.as_ref(), pending).await;
        }
        None => debug!("page {} already has a detection in flight", index + 1),
    }
    let guard = session.lock().await;
    page_view(&guard, index)
}

pub(crate) async fn set_signature(
    state: &ServerState,
    id: &str,
    request: SignatureRequest,
) -> Result<SignatureResponse, ServerError> {
    let session = state.session(id).await?;
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServerError::bad_request("name is required"))?
        .to_string();
    let mut options = SignatureOptions::from_settings(&state.settings);
    if let Some(style) = request.style.as_deref().filter(|value| !value.trim().is_empty()) {
        let style = style
            .parse::<SignatureStyle>()
            .map_err(|err| ServerError::bad_request(err.to_string()))?;
        options = options.with_style(style);
    }
    let style = options.style;
    let initials = signature::initials(&name);
    let assets = tokio::task::spawn_blocking(move || signature::generate_assets(&name, &options))
        .await
        .map_err(|err| ServerError::internal(format!("server task failed: {}", err)))??;

    let response = SignatureResponse {
        style: style.to_string(),
        initials,
        mime: assets.signature.mime.clone(),
        signature_base64: BASE64.encode(&assets.signature.bytes),
        initials_base64: BASE64.encode(&assets.initials.bytes),
    };
    session.lock().await.set_signature_assets(assets);
    Ok(response)
}

pub(crate) async fn clear_signature(state: &ServerState, id: &str) -> Result<(), ServerError> {
    let session = state.session(id).await?;
    session.lock().await.clear_signature_assets();
    Ok(())
}

pub(crate) async fn toggle_field(
    state: &ServerState,
    id: &str,
    field_id: &str,
) -> Result<ToggleResponse, ServerError> {
    let session = state.session(id).await?;
    let field_id = parse_field_id(field_id)?;
    let mut guard = session.lock().await;
    let outcome = guard.toggle_field(field_id);
    if outcome == ToggleOutcome::UnknownField {
        return Err(ServerError::not_found(format!("unknown field: {}", field_id)));
    }
    Ok(ToggleResponse {
        outcome,
        field: guard.field_overlay(field_id),
    })
}

pub(crate) async fn update_text(
    state: &ServerState,
    id: &str,
    field_id: &str,
    request: TextRequest,
) -> Result<FieldResponse, ServerError> {
    let session = state.session(id).await?;
    let field_id = parse_field_id(field_id)?;
    let mut guard = session.lock().await;
    let kind = guard
        .fields()
        .get(field_id)
        .map(Field::kind)
        .ok_or_else(|| ServerError::not_found(format!("unknown field: {}", field_id)))?;
    if kind != FieldKind::Text {
        return Err(ServerError::bad_request(format!(
            "field {} is a {} field, not a text field",
            field_id,
            kind.as_str()
        )));
    }
    guard.update_text(field_id, request.text);
    Ok(FieldResponse {
        field: guard.field_overlay(field_id),
    })
}

pub(crate) async fn export(state: &ServerState, id: &str) -> Result<ExportResponse, ServerError> {
    let session = state.session(id).await?;
    let (pages, fields, name) = {
        let guard = session.lock().await;
        let fields = toggle::export_fields(guard.fields())
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        let name = export_name(guard.document_name(), &state.settings.output_name);
        (guard.pages().to_vec(), fields, name)
    };
    let options = ExportOptions::from_settings(&state.settings);
    let pdf = tokio::task::spawn_blocking(move || {
        let fields = fields.iter().collect::<Vec<_>>();
        compose_document(&pages, &fields, &options)
    })
    .await
    .map_err(|err| ServerError::internal(format!("server task failed: {}", err)))??;
    Ok(ExportResponse {
        name,
        mime: PDF_MIME.to_string(),
        data_base64: BASE64.encode(pdf),
    })
}

fn spawn_detection(state: &Arc<ServerState>, session: SharedSession, pending: PendingDetection) {
    let detector = state.detector.clone();
    tokio::spawn(async move {
        let page = pending.key.page_index();
        let outcome = detect_and_merge(&session, detector.as_ref(), pending).await;
        debug!("prefetch for page {} finished: {:?}", page + 1, outcome);
    });
}

fn summaries(session: &Session) -> Vec<PageSummary> {
    (0..session.page_count())
        .filter_map(|index| session.page_summary(index))
        .collect()
}

fn check_page(session: &Session, index: usize) -> Result<(), ServerError> {
    if index < session.page_count() {
        Ok(())
    } else {
        Err(ServerError::not_found(format!(
            "page {} is out of range (document has {} page(s))",
            index + 1,
            session.page_count()
        )))
    }
}

fn page_view(session: &Session, index: usize) -> Result<PageView, ServerError> {
    check_page(session, index)?;
    let page = &session.pages()[index];
    let summary = session
        .page_summary(index)
        .ok_or_else(|| ServerError::internal(format!("page {} has no state", index + 1)))?;
    Ok(PageView {
        page: summary,
        current: session.current_page(),
        page_count: session.page_count(),
        mime: page.mime.clone(),
        image_base64: BASE64.encode(page.image.as_slice()),
        fields: session.overlays(index),
    })
}

fn parse_field_id(raw: &str) -> Result<FieldId, ServerError> {
    raw.parse::<FieldId>()
        .map_err(|_| ServerError::not_found(format!("unknown field: {}", raw)))
}

fn export_name(document: Option<&str>, fallback: &str) -> String {
    document
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(|stem| format!("{}-signed.pdf", stem))
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionFuture, FieldDetector};
    use crate::fields::RawDetection;
    use crate::geometry::BoundingBox;
    use crate::navigation::DetectionState;
    use crate::raster::{Page, RasterFuture, Rasterizer};
    use crate::server::handlers::router;
    use crate::settings::Settings;
    use crate::test_util::solid_png;
    use anyhow::anyhow;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const PDF_HEADER: &[u8] = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n";

    struct BlankPages(usize);

    impl Rasterizer for BlankPages {
        fn rasterize(&self, _document: data::DataAttachment) -> RasterFuture {
            let count = self.0;
            Box::pin(async move {
                if count == 0 {
                    return Err(anyhow!("no pages were rendered"));
                }
                (0..count)
                    .map(|index| Page::from_encoded(index, solid_png(60, 80, [255, 255, 255, 255])))
                    .collect()
            })
        }
    }

    #[derive(Default)]
    struct OneSignaturePerPage {
        calls: AtomicUsize,
    }

    impl FieldDetector for OneSignaturePerPage {
        fn detect(&self, _page: &Page) -> DetectionFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok::<_, anyhow::Error>(vec![
                    RawDetection::new(BoundingBox::new(100.0, 100.0, 200.0, 600.0), "signature"),
                    RawDetection::new(BoundingBox::new(300.0, 100.0, 350.0, 600.0), "text"),
                ])
            })
        }
    }

    fn state(pages: usize) -> (Arc<ServerState>, Arc<OneSignaturePerPage>) {
        state_with(
            Settings {
                prefetch_next: false,
                ..Settings::default()
            },
            pages,
        )
    }

    fn state_with(settings: Settings, pages: usize) -> (Arc<ServerState>, Arc<OneSignaturePerPage>) {
        let detector = Arc::new(OneSignaturePerPage::default());
        let state = ServerState::new(settings, Arc::new(BlankPages(pages)), detector.clone());
        (Arc::new(state), detector)
    }

    /// Serves the full router on an ephemeral port and returns its base url.
    async fn serve(state: Arc<ServerState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });
        format!("http://{}", addr)
    }

    /// A PDF-sniffing document padded to `len` bytes.
    fn padded_upload(len: usize) -> serde_json::Value {
        let mut document = PDF_HEADER.to_vec();
        document.resize(len, b' ');
        serde_json::json!({ "data_base64": BASE64.encode(&document), "name": "scan.pdf" })
    }

    fn upload() -> CreateSessionRequest {
        CreateSessionRequest {
            data_base64: Some(BASE64.encode(PDF_HEADER)),
            mime: None,
            name: Some("lease.pdf".to_string()),
        }
    }

    #[tokio::test]
    async fn non_pdf_upload_is_rejected() {
        let (state, _) = state(1);
        let request = CreateSessionRequest {
            data_base64: Some(BASE64.encode(solid_png(2, 2, [0, 0, 0, 255]))),
            ..CreateSessionRequest::default()
        };
        let err = create_session(&state, request).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("please upload a PDF file"));
        assert!(state.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn missing_or_broken_payload_is_a_bad_request() {
        let (state, _) = state(1);
        let err = create_session(&state, CreateSessionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let request = CreateSessionRequest {
            data_base64: Some("***".to_string()),
            ..CreateSessionRequest::default()
        };
        let err = create_session(&state, request).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rasterization_failure_is_unprocessable() {
        let (state, _) = state(0);
        let err = create_session(&state, upload()).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn first_view_detects_once() {
        let (state, detector) = state(2);
        let created = create_session(&state, upload()).await.unwrap();
        assert_eq!(created.pages.len(), 2);
        assert_eq!(created.pages[0].state, DetectionState::Unvisited);
        assert_eq!(created.name.as_deref(), Some("lease.pdf"));

        let view = show_page(&state, &created.session_id, 1).await.unwrap();
        assert_eq!(view.page.state, DetectionState::Detected);
        assert_eq!(view.current, 1);
        assert_eq!(view.fields.len(), 2);
        assert_eq!(view.fields[0].style, "top:10%;left:10%;width:50%;height:10%");

        show_page(&state, &created.session_id, 1).await.unwrap();
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

        rescan_page(&state, &created.session_id, 1).await.unwrap();
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_sessions_and_pages_are_not_found() {
        let (state, _) = state(1);
        let err = show_page(&state, "nope", 0).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let created = create_session(&state, upload()).await.unwrap();
        let err = show_page(&state, &created.session_id, 3).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = rescan_page(&state, &created.session_id, 3).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_and_text_follow_field_kinds() {
        let (state, _) = state(1);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        let view = show_page(&state, &session_id, 0).await.unwrap();
        let signature = view.fields[0].id.to_string();
        let text = view.fields[1].id.to_string();

        let toggled = toggle_field(&state, &session_id, &signature).await.unwrap();
        assert_eq!(toggled.outcome, ToggleOutcome::NoAssets);

        let request = SignatureRequest {
            name: Some("Jane Doe".to_string()),
            style: Some("modern".to_string()),
        };
        let created = set_signature(&state, &session_id, request).await.unwrap();
        assert_eq!(created.style, "modern");
        assert_eq!(created.initials, "JD");

        let toggled = toggle_field(&state, &session_id, &signature).await.unwrap();
        assert_eq!(toggled.outcome, ToggleOutcome::Applied);
        assert!(toggled.field.unwrap().filled);
        let toggled = toggle_field(&state, &session_id, &text).await.unwrap();
        assert_eq!(toggled.outcome, ToggleOutcome::NotToggleable);

        let request = TextRequest {
            text: "2024-01-01".to_string(),
        };
        let updated = update_text(&state, &session_id, &text, request).await.unwrap();
        assert_eq!(updated.field.unwrap().text.as_deref(), Some("2024-01-01"));

        let request = TextRequest {
            text: "x".to_string(),
        };
        let err = update_text(&state, &session_id, &signature, request)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = toggle_field(&state, &session_id, "00000000-0000-0000-0000-000000000000")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn signature_requires_a_known_style_and_name() {
        let (state, _) = state(1);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        let err = set_signature(&state, &session_id, SignatureRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let request = SignatureRequest {
            name: Some("Jane".to_string()),
            style: Some("gothic".to_string()),
        };
        let err = set_signature(&state, &session_id, request).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("gothic"));
    }

    #[tokio::test]
    async fn export_returns_named_pdf() {
        let (state, _) = state(2);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        show_page(&state, &session_id, 0).await.unwrap();
        let exported = export(&state, &session_id).await.unwrap();
        assert_eq!(exported.name, "lease-signed.pdf");
        assert_eq!(exported.mime, PDF_MIME);
        let pdf = BASE64.decode(exported.data_base64).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn multi_megabyte_uploads_reach_the_handler() {
        let (state, _) = state(1);
        let base = serve(state.clone()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/sessions", base))
            .json(&padded_upload(3 * 1024 * 1024))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let created: serde_json::Value = response.json().await.unwrap();
        assert_eq!(created["name"], "scan.pdf");
        assert_eq!(state.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn uploads_over_the_configured_limit_are_refused() {
        let settings = Settings {
            prefetch_next: false,
            server_max_upload_bytes: 16 * 1024,
            ..Settings::default()
        };
        let (state, _) = state_with(settings, 1);
        let base = serve(state.clone()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/sessions", base))
            .json(&padded_upload(32 * 1024))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn closed_sessions_are_forgotten() {
        let (state, _) = state(1);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        close_session(&state, &session_id).await.unwrap();
        assert!(state.sessions.read().await.is_empty());

        let err = show_page(&state, &session_id, 0).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = close_session(&state, &session_id).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn closing_over_http_answers_ok() {
        let (state, _) = state(1);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        let base = serve(state.clone()).await;
        let client = reqwest::Client::new();
        let url = format!("{}/sessions/{}", base, session_id);
        let response = client.delete(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let response = client.delete(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn idle_sessions_expire_after_the_ttl() {
        let (state, _) = state(1);
        let session_id = create_session(&state, upload()).await.unwrap().session_id;
        let ttl = Duration::from_secs(state.settings.session_ttl_secs);
        assert_eq!(state.evict_idle(Instant::now()).await, 0);
        show_page(&state, &session_id, 0).await.unwrap();

        let later = Instant::now() + ttl + Duration::from_secs(1);
        assert_eq!(state.evict_idle(later).await, 1);
        let err = show_page(&state, &session_id, 0).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn zero_ttl_keeps_sessions() {
        let settings = Settings {
            prefetch_next: false,
            session_ttl_secs: 0,
            ..Settings::default()
        };
        let (state, _) = state_with(settings, 1);
        create_session(&state, upload()).await.unwrap();
        let much_later = Instant::now() + Duration::from_secs(365 * 24 * 3600);
        assert_eq!(state.evict_idle(much_later).await, 0);
        assert_eq!(state.sessions.read().await.len(), 1);
    }

    #[test]
    fn export_name_falls_back_to_settings() {
        assert_eq!(export_name(Some("a/b/contract.pdf"), "out.pdf"), "contract-signed.pdf");
        assert_eq!(export_name(None, "out.pdf"), "out.pdf");
    }
}
