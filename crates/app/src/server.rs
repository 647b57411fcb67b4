use crate::api::{
    AskRequest, AskResponse, ErrorBody, HealthResponse, ModelsResponse, RootResponse,
    StatusResponse, UploadResponse,
};
use crate::state::AppState;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use docchat_core::{
    document_stats, history_from_wire, AskOptions, IngestError, QaError,
    StoreError, UploadedFile, VectorStoreStats,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum ApiError {
    InvalidRequest(String),
    NoDocuments(String),
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::NoDocuments(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn to_body(&self) -> ErrorBody {
        let (error_type, message) = match self {
            ApiError::InvalidRequest(msg) => ("invalid_request", msg),
            ApiError::NoDocuments(msg) => ("no_documents", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
        };
        ErrorBody {
            error_type: error_type.to_string(),
            message: message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), message = %self.to_body().message, "request failed");
        } else {
            warn!(status = status.as_u16(), message = %self.to_body().message, "request rejected");
        }
        (status, Json(self.to_body())).into_response()
    }
}

impl From<QaError> for ApiError {
    fn from(error: QaError) -> Self {
        match error {
            QaError::NoDocuments => ApiError::NoDocuments(error.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/ask", post(ask_handler))
        .route("/stats", get(stats_handler))
        .route("/reset", delete(reset_handler))
        .route("/models", get(models_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, "API server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn root_handler() -> Json<RootResponse> {
    let endpoints = [
        ("health", "GET /health"),
        ("upload", "POST /upload"),
        ("ask", "POST /ask"),
        ("stats", "GET /stats"),
        ("reset", "DELETE /reset"),
        ("models", "GET /models"),
    ]
    .into_iter()
    .map(|(name, route)| (name.to_string(), route.to_string()))
    .collect::<BTreeMap<_, _>>();

    Json(RootResponse {
        message: "docchat API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints,
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        vector_store_loaded: state.is_loaded().await,
    })
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::InvalidRequest(error.to_string()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|error| ApiError::InvalidRequest(error.to_string()))?;
        files.push(UploadedFile::new(name, bytes.to_vec()));
    }

    if files.is_empty() {
        return Err(ApiError::InvalidRequest("no files provided".to_string()));
    }
    if let Some(rejected) = files
        .iter()
        .find(|file| !file.has_pdf_suffix())
    {
        return Err(ApiError::InvalidRequest(format!(
            "file {} is not a PDF",
            rejected.name
        )));
    }

    let files_processed = files.len();
    let processor = Arc::clone(&state.processor);
    let chunks = tokio::task::spawn_blocking(move || processor.process_pdf_uploads(&files))
        .await
        .map_err(|error| ApiError::Internal(error.to_string()))??;

    if chunks.is_empty() {
        return Err(ApiError::Internal(
            "no text could be extracted from the uploaded files".to_string(),
        ));
    }

    state.index_chunks(&chunks).await?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        files_processed,
        total_chunks: chunks.len(),
        stats: document_stats(&chunks),
    }))
}

async fn ask_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::InvalidRequest("query must not be empty".to_string()));
    }

    let options = AskOptions {
        model: request.model,
        temperature: request.temperature,
        system_prompt: None,
        history: request
            .history
            .as_deref()
            .map(history_from_wire)
            .unwrap_or_default(),
    };
    let answer = state
        .ask(&request.query, &options, request.with_sources)
        .await?;

    Ok(Json(AskResponse {
        answer: answer.answer,
        model: answer.model,
        sources: request.with_sources.then_some(answer.sources),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<VectorStoreStats> {
    Json(state.stats().await)
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.reset().await?;
    Ok(Json(StatusResponse {
        status: "success".to_string(),
        message: "vector store reset".to_string(),
    }))
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.settings.available_models.clone(),
        default: state.settings.default_model.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{offline_state, EchoChat};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use docchat_core::{Chunk, ChunkMetadata, DocumentCount, DocumentKind};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn app() -> (TempDir, Arc<AppState>, Arc<EchoChat>) {
        let dir = tempdir().unwrap();
        let chat = Arc::new(EchoChat::default());
        let state = Arc::new(offline_state(dir.path(), Arc::clone(&chat)));
        (dir, state, chat)
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
        create_app(Arc::clone(state)).oneshot(request).await.unwrap()
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(parts: &[(&str, &str, &[u8])]) -> Request<Body> {
        let boundary = "docchat-test-boundary";
        let mut body = Vec::new();
        for (field, file_name, content) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn seed(state: &AppState, texts: &[&str]) {
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                text: text.to_string(),
                metadata: ChunkMetadata {
                    source: "guide.pdf".to_string(),
                    document_id: "doc".to_string(),
                    kind: DocumentKind::Pdf,
                    page: Some(0),
                    chunk_index: index as u64,
                    section: None,
                },
            })
            .collect();
        state.index_chunks(&chunks).await.unwrap();
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let (_dir, state, _) = app();
        let response = send(&state, Request::get("/").body(Body::empty()).unwrap()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: RootResponse = read_json(response).await;
        assert_eq!(body.endpoints["ask"], "POST /ask");
    }

    #[tokio::test]
    async fn health_reports_index_presence() {
        let (_dir, state, _) = app();
        let response = send(&state, Request::get("/health").body(Body::empty()).unwrap()).await;
        let body: HealthResponse = read_json(response).await;
        assert_eq!(body.status, "healthy");
        assert!(!body.vector_store_loaded);

        seed(&state, &["some text"]).await;
        let response = send(&state, Request::get("/health").body(Body::empty()).unwrap()).await;
        let body: HealthResponse = read_json(response).await;
        assert!(body.vector_store_loaded);
    }

    #[tokio::test]
    async fn ask_without_documents_is_a_bad_request() {
        let (_dir, state, chat) = app();
        let response = send(
            &state,
            json_request(Method::POST, "/ask", serde_json::json!({ "query": "hello" })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error_type, "no_documents");
        assert!(chat.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ask_passes_history_and_returns_sources() {
        let (_dir, state, chat) = app();
        seed(&state, &["refund policy: thirty days", "shipping: five days"]).await;

        let response = send(
            &state,
            json_request(
                Method::POST,
                "/ask",
                serde_json::json!({
                    "query": "what is the refund policy?",
                    "model": "gpt-4o",
                    "history": [
                        { "role": "user", "content": "hi" },
                        { "role": "tool", "content": "dropped" },
                        { "role": "ai", "content": "hello" }
                    ],
                    "with_sources": true
                }),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: AskResponse = read_json(response).await;
        assert_eq!(body.answer, "echo: what is the refund policy?");
        assert_eq!(body.model, "gpt-4o");
        assert_eq!(body.sources.map(|sources| sources.len()), Some(2));

        let request = chat.requests.lock().unwrap().last().cloned().unwrap();
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[1].content, "hi");
        assert_eq!(request.messages[2].content, "hello");
    }

    #[tokio::test]
    async fn ask_accepts_null_history() {
        let (_dir, state, chat) = app();
        seed(&state, &["refund policy: thirty days"]).await;

        let response = send(
            &state,
            json_request(
                Method::POST,
                "/ask",
                serde_json::json!({ "query": "q", "model": "gpt-4o", "history": null }),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: AskResponse = read_json(response).await;
        assert_eq!(body.answer, "echo: q");
        let request = chat.requests.lock().unwrap().last().cloned().unwrap();
        assert_eq!(request.messages.len(), 2);
    }

    #[tokio::test]
    async fn ask_omits_sources_by_default() {
        let (_dir, state, _) = app();
        seed(&state, &["text"]).await;

        let response = send(
            &state,
            json_request(Method::POST, "/ask", serde_json::json!({ "query": "q" })),
        )
        .await;

        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert!(body.get("sources").is_none());
    }

    #[tokio::test]
    async fn upload_without_files_is_rejected() {
        let (_dir, state, _) = app();
        let response = send(&state, multipart_request(&[])).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error_type, "invalid_request");
    }

    #[tokio::test]
    async fn upload_rejects_non_pdf_files() {
        let (_dir, state, _) = app();
        let response = send(
            &state,
            multipart_request(&[("files", "notes.txt", b"plain text")]),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read_json(response).await;
        assert!(body.message.contains("notes.txt"));
        assert!(!state.is_loaded().await);
    }

    #[tokio::test]
    async fn upload_extension_check_is_case_sensitive() {
        let (_dir, state, _) = app();
        let response = send(
            &state,
            multipart_request(&[("files", "REPORT.PDF", b"%PDF-1.4")]),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error_type, "invalid_request");
        assert!(body.message.contains("REPORT.PDF"));
    }

    #[tokio::test]
    async fn unreadable_pdf_is_a_server_error() {
        let (_dir, state, _) = app();
        let response = send(
            &state,
            multipart_request(&[("files", "broken.pdf", b"not really a pdf")]),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!state.is_loaded().await);
    }

    #[tokio::test]
    async fn stats_and_reset_round_out_the_lifecycle() {
        let (_dir, state, _) = app();
        seed(&state, &["a", "b", "c"]).await;

        let response = send(&state, Request::get("/stats").body(Body::empty()).unwrap()).await;
        let stats: VectorStoreStats = read_json(response).await;
        assert!(stats.exists);
        assert_eq!(stats.total_documents, DocumentCount::Known(3));

        let response = send(
            &state,
            Request::delete("/reset").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: StatusResponse = read_json(response).await;
        assert_eq!(body.status, "success");

        let response = send(&state, Request::get("/stats").body(Body::empty()).unwrap()).await;
        let stats: VectorStoreStats = read_json(response).await;
        assert!(!stats.exists);
        assert_eq!(stats.total_documents, DocumentCount::Known(0));
    }

    #[tokio::test]
    async fn models_lists_allow_list_and_default() {
        let (_dir, state, _) = app();
        let response = send(&state, Request::get("/models").body(Body::empty()).unwrap()).await;
        let body: ModelsResponse = read_json(response).await;

        assert_eq!(body.models, vec!["gpt-3.5-turbo", "gpt-4o-mini", "gpt-4o"]);
        assert_eq!(body.default, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_before_the_handler() {
        let (_dir, state, _) = app();
        let response = send(
            &state,
            Request::builder()
                .method(Method::POST)
                .uri("/ask")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;

        assert!(response.status().is_client_error());
    }
}
