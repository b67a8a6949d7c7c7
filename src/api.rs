//! HTTP surface for docvault.
//!
//! The router exposes the session lifecycle over a compact Axum API:
//!
//! - `POST /sessions` – Allocate a session and return its id.
//! - `GET /sessions/{id}` – Session timestamps, chunk count, and index presence.
//! - `DELETE /sessions/{id}` – Remove a session and its storage.
//! - `POST /sessions/{id}/documents` – Multipart upload of one or more documents to ingest.
//! - `POST /sessions/{id}/search` – Query a session (`query`, optional `k`, `mode`, `min_score`).
//! - `POST /sessions/reap` – Run an inactivity sweep now (optional `threshold_secs` query).
//! - `GET /metrics` – Ingestion, embedding, and session counters.
//! - `GET /` – Machine-readable command catalog.

use crate::extraction::DocumentInput;
use crate::retrieval::{RetrievalResult, SearchOptions};
use crate::service::{IngestReport, ServiceError, SessionApi};
use crate::session::SessionInfo;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on a single upload request.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Build the HTTP router over any [`SessionApi`] implementation.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: SessionApi + 'static,
{
    Router::new()
        .route("/", get(get_commands))
        .route("/sessions", post(create_session::<S>))
        .route("/sessions/reap", post(reap_sessions::<S>))
        .route(
            "/sessions/:id",
            get(session_info::<S>).delete(delete_session::<S>),
        )
        .route("/sessions/:id/documents", post(ingest_documents::<S>))
        .route("/sessions/:id/search", post(search_session::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(service)
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
}

async fn create_session<S>(
    State(service): State<Arc<S>>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError>
where
    S: SessionApi,
{
    let session_id = service.create_session().await?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id })))
}

async fn session_info<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, AppError>
where
    S: SessionApi,
{
    service
        .session_info(id)
        .await
        .map(Json)
        .ok_or(AppError(ServiceError::SessionNotFound(id)))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn delete_session<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, AppError>
where
    S: SessionApi,
{
    let deleted = service.delete_session(id).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// Collect every multipart part as a document. The file name wins over the field name.
async fn ingest_documents<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError>
where
    S: SessionApi,
{
    let mut documents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::invalid(format!("malformed multipart body: {error}")))?
    {
        let name = field
            .file_name()
            .or_else(|| field.name())
            .map(str::to_string)
            .unwrap_or_else(|| format!("document-{}", documents.len() + 1));
        let bytes = field
            .bytes()
            .await
            .map_err(|error| AppError::invalid(format!("failed to read part {name}: {error}")))?;
        documents.push(DocumentInput::new(name, bytes.to_vec()));
    }
    if documents.is_empty() {
        return Err(AppError::invalid("upload contained no documents"));
    }

    let report = service.ingest(id, documents).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<RetrievalResult>,
}

async fn search_session<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: SessionApi,
{
    let results = service.search(id, &request.query, request.options).await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Deserialize)]
struct ReapParams {
    #[serde(default)]
    threshold_secs: Option<u64>,
}

#[derive(Serialize)]
struct ReapResponse {
    removed: usize,
}

async fn reap_sessions<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<ReapParams>,
) -> Json<ReapResponse>
where
    S: SessionApi,
{
    let removed = service
        .sweep_inactive(params.threshold_secs.map(Duration::from_secs))
        .await;
    Json(ReapResponse { removed })
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> impl IntoResponse
where
    S: SessionApi,
{
    Json(service.metrics_snapshot())
}

#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "create_session",
                method: "POST",
                path: "/sessions",
                description: "Allocate an isolated session. Response returns { \"session_id\": uuid }.",
                request_example: None,
            },
            CommandDescriptor {
                name: "session_info",
                method: "GET",
                path: "/sessions/{id}",
                description: "Return created_at, last_accessed, chunk_count, and has_index for a session.",
                request_example: None,
            },
            CommandDescriptor {
                name: "delete_session",
                method: "DELETE",
                path: "/sessions/{id}",
                description: "Delete a session and its stored index.",
                request_example: None,
            },
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/sessions/{id}/documents",
                description: "Upload PDF or text documents as multipart parts; each is chunked, embedded, and indexed.",
                request_example: None,
            },
            CommandDescriptor {
                name: "search",
                method: "POST",
                path: "/sessions/{id}/search",
                description: "Retrieve diverse, deduplicated chunks for a query.",
                request_example: Some(json!({
                    "query": "What was revenue in Q3 2023?",
                    "k": 5,
                    "mode": "mmr",
                    "min_score": 0.2
                })),
            },
            CommandDescriptor {
                name: "reap",
                method: "POST",
                path: "/sessions/reap",
                description: "Delete sessions idle longer than threshold_secs (defaults to the configured inactivity threshold).",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return ingestion, embedding, and session counters.",
                request_example: None,
            },
        ],
    })
}

struct AppError(ServiceError);

impl AppError {
    fn invalid(message: impl Into<String>) -> Self {
        Self(ServiceError::InvalidInput(message.into()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(inner: ServiceError) -> Self {
        Self(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::extraction::{ChunkKind, ChunkMetadata, DocumentInput};
    use crate::index::IndexError;
    use crate::metrics::MetricsSnapshot;
    use crate::retrieval::{RetrievalResult, SearchMode, SearchOptions};
    use crate::service::{IngestReport, ServiceError, SessionApi};
    use crate::session::SessionInfo;
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use time::OffsetDateTime;
    use tokio::sync::Mutex;
    use tower::ServiceExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn commands_catalog_lists_session_routes() {
        let commands = get_commands().await.0.commands;
        let ingest = commands
            .iter()
            .find(|cmd| cmd.name == "ingest")
            .expect("ingest command present");
        assert_eq!(ingest.method, "POST");
        assert_eq!(ingest.path, "/sessions/{id}/documents");
        assert!(commands.iter().any(|cmd| cmd.name == "search"));
        assert!(commands.len() >= 6);
    }

    #[tokio::test]
    async fn create_session_returns_created() {
        let service = Arc::new(StubSessionService::new());
        let response = create_router(service.clone())
            .oneshot(request(Method::POST, "/sessions", Body::empty()))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["session_id"], service.known.to_string());
    }

    #[tokio::test]
    async fn unknown_session_maps_to_not_found() {
        let service = Arc::new(StubSessionService::new());
        let uri = format!("/sessions/{}", Uuid::new_v4());
        let response = create_router(service)
            .oneshot(request(Method::GET, &uri, Body::empty()))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_info_is_serialized() {
        let service = Arc::new(StubSessionService::new());
        let uri = format!("/sessions/{}", service.known);
        let response = create_router(service)
            .oneshot(request(Method::GET, &uri, Body::empty()))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["chunk_count"], 4);
        assert_eq!(json["has_index"], true);
        assert!(json["created_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn search_forwards_options_and_rejects_blank_queries() {
        let service = Arc::new(StubSessionService::new());
        let uri = format!("/sessions/{}/search", service.known);

        let payload = json!({ "query": "revenue", "k": 3, "mode": "hybrid" });
        let response = create_router(service.clone())
            .oneshot(json_request(&uri, payload))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["results"][0]["chunk_id"], "chunk-1");

        let searches = service.searches.lock().await.clone();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].0, "revenue");
        assert_eq!(searches[0].1.k, Some(3));
        assert_eq!(searches[0].1.mode, SearchMode::Hybrid);

        let response = create_router(service)
            .oneshot(json_request(&uri, json!({ "query": "  " })))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn multipart_upload_reaches_ingest() {
        let service = Arc::new(StubSessionService::new());
        let uri = format!("/sessions/{}/documents", service.known);
        let body = "--XBOUNDARY\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             quarterly notes\r\n\
             --XBOUNDARY\r\n\
             Content-Disposition: form-data; name=\"second\"\r\n\r\n\
             more text\r\n\
             --XBOUNDARY--\r\n";

        let response = create_router(service.clone())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(&uri)
                    .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let uploads = service.uploads.lock().await.clone();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].name, "notes.txt");
        assert_eq!(uploads[0].bytes, b"quarterly notes");
        assert_eq!(uploads[1].name, "second");
    }

    #[tokio::test]
    async fn backend_failures_map_to_server_error() {
        let service = Arc::new(StubSessionService::new());
        let uri = format!("/sessions/{}", service.known);
        let response = create_router(service)
            .oneshot(request(Method::DELETE, &uri, Body::empty()))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn reap_passes_threshold() {
        let service = Arc::new(StubSessionService::new());
        let response = create_router(service.clone())
            .oneshot(request(
                Method::POST,
                "/sessions/reap?threshold_secs=0",
                Body::empty(),
            ))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], 2);
        assert_eq!(
            *service.sweeps.lock().await,
            vec![Some(Duration::from_secs(0))]
        );
    }

    fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .expect("request")
    }

    fn json_request(uri: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    struct StubSessionService {
        known: Uuid,
        uploads: Mutex<Vec<DocumentInput>>,
        searches: Mutex<Vec<(String, SearchOptions)>>,
        sweeps: Mutex<Vec<Option<Duration>>>,
    }

    impl StubSessionService {
        fn new() -> Self {
            Self {
                known: Uuid::new_v4(),
                uploads: Mutex::new(Vec::new()),
                searches: Mutex::new(Vec::new()),
                sweeps: Mutex::new(Vec::new()),
            }
        }

        fn check(&self, id: Uuid) -> Result<(), ServiceError> {
            if id == self.known {
                Ok(())
            } else {
                Err(ServiceError::SessionNotFound(id))
            }
        }
    }

    #[async_trait]
    impl SessionApi for StubSessionService {
        async fn create_session(&self) -> Result<Uuid, ServiceError> {
            Ok(self.known)
        }

        async fn ingest(
            &self,
            session_id: Uuid,
            documents: Vec<DocumentInput>,
        ) -> Result<IngestReport, ServiceError> {
            self.check(session_id)?;
            let count = documents.len();
            self.uploads.lock().await.extend(documents);
            Ok(IngestReport {
                chunk_count: count,
                embedded: count,
                failed: 0,
                skipped_duplicates: 0,
                total_chunks: count,
                documents: Vec::new(),
            })
        }

        async fn search(
            &self,
            session_id: Uuid,
            query: &str,
            options: SearchOptions,
        ) -> Result<Vec<RetrievalResult>, ServiceError> {
            if query.trim().is_empty() {
                return Err(ServiceError::InvalidInput("query must not be empty".into()));
            }
            self.check(session_id)?;
            self.searches
                .lock()
                .await
                .push((query.to_string(), options));
            Ok(vec![RetrievalResult {
                chunk_id: "chunk-1".into(),
                text: "Revenue grew".into(),
                metadata: ChunkMetadata::new("report.pdf", ChunkKind::Page, 1),
                score: 0.9,
                rank: Some(1),
            }])
        }

        async fn delete_session(&self, session_id: Uuid) -> Result<bool, ServiceError> {
            self.check(session_id)?;
            Err(ServiceError::Index(IndexError::Corrupt("disk on fire".into())))
        }

        async fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
            (session_id == self.known).then(|| SessionInfo {
                id: session_id,
                created_at: OffsetDateTime::UNIX_EPOCH,
                last_accessed: OffsetDateTime::UNIX_EPOCH,
                chunk_count: 4,
                has_index: true,
            })
        }

        async fn sweep_inactive(&self, threshold: Option<Duration>) -> usize {
            self.sweeps.lock().await.push(threshold);
            2
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }
}
