//! Session-facing HTTP surface under `/api/v1`.
//!
//! Every response is a `{success, data?, error?}` envelope. Storage failures other than
//! not-found are fatal: the handler answers 500 and flips the shutdown signal so the process
//! exits for its supervisor to restart.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use pricewise_agent::llm::Usage;
use pricewise_agent::runtime::{AgentRuntime, Upload};
use pricewise_core::config::ServerConfig;
use pricewise_core::domain::file::{FileId, FileKind, FileRef, FileStatus};
use pricewise_core::domain::message::{Message, ToolCallRequest};
use pricewise_core::domain::session::{PricingContextInfo, SessionId};
use pricewise_core::errors::{ApplicationError, InterfaceError};
use pricewise_core::pricing::{self, ValidationReport};
use pricewise_store::file_store::FileStore;
use pricewise_store::sessions::AttachOutcome;

use crate::health;

const CORRELATION_HEADER: &str = "x-correlation-id";
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_file_bytes: usize,
    pub max_files: usize,
}

impl UploadLimits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self { max_file_bytes: config.max_upload_bytes, max_files: config.max_files_per_request }
    }

    fn body_limit(&self) -> usize {
        self.max_file_bytes.saturating_mul(self.max_files).saturating_add(MULTIPART_OVERHEAD_BYTES)
    }
}

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<AgentRuntime>,
    limits: UploadLimits,
    fatal: Arc<watch::Sender<bool>>,
}

impl ApiState {
    pub fn new(
        runtime: Arc<AgentRuntime>,
        limits: UploadLimits,
        fatal: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self { runtime, limits, fatal }
    }

    fn fail(&self, error: impl Into<ApplicationError>, correlation_id: &str) -> ApiError {
        let error = error.into();
        if error.is_fatal() {
            error!(
                event_name = "api.fatal_error",
                correlation_id,
                error = %error,
                "fatal storage failure; requesting shutdown"
            );
            self.fatal.send_replace(true);
        } else {
            warn!(
                event_name = "api.request_failed",
                correlation_id,
                error = %error,
                "request failed"
            );
        }
        ApiError(error.into_interface(correlation_id))
    }
}

pub fn router(state: ApiState, files: Arc<dyn FileStore>) -> Router {
    let body_limit = state.limits.body_limit();
    let sessions = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", delete(delete_session))
        .route("/sessions/{session_id}/messages", post(send_message).get(list_messages))
        .route("/sessions/{session_id}/messages/upload", post(send_message_with_files))
        .route("/sessions/{session_id}/files", post(upload_files).get(list_files))
        .route(
            "/sessions/{session_id}/pricing-context",
            get(get_pricing_context).put(set_pricing_context).delete(clear_pricing_context),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    Router::new().nest("/api/v1", sessions.merge(health::router(files)))
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. } => {
                (StatusCode::BAD_REQUEST, correlation_id)
            }
            InterfaceError::NotFound { correlation_id, .. } => (StatusCode::NOT_FOUND, correlation_id),
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, correlation_id)
            }
        };
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                message: self.0.user_message(),
                detail: self.0.detail().to_string(),
                correlation_id: correlation_id.clone(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope::ok(data))))
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDeleted {
    pub session_id: SessionId,
    pub files_released: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub file_id: FileId,
    pub file_name: String,
    pub size_bytes: u64,
    pub uploaded_at: String,
    pub status: FileStatus,
    pub kind: FileKind,
}

impl From<&FileRef> for FileView {
    fn from(file: &FileRef) -> Self {
        Self {
            file_id: file.id.clone(),
            file_name: file.original_name.clone(),
            size_bytes: file.size_bytes,
            uploaded_at: file.uploaded_at.to_rfc3339(),
            status: file.status,
            kind: file.kind,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    #[serde(flatten)]
    pub file: FileView,
    pub validation: ValidationReport,
    pub context_adopted: bool,
}

impl From<&AttachOutcome> for AttachmentView {
    fn from(outcome: &AttachOutcome) -> Self {
        Self {
            file: FileView::from(&outcome.file),
            validation: outcome.validation.clone(),
            context_adopted: outcome.context_adopted,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub tool_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unexecuted_tool_call: Option<ToolCallRequest>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetContextBody {
    pub file_id: String,
}

async fn create_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<SessionCreated> {
    let correlation_id = correlation_id(&headers);
    let session = state.runtime.store().create().await;
    info!(
        event_name = "api.session_created",
        session_id = %session.id,
        correlation_id = %correlation_id,
        "session created"
    );
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(SessionCreated {
            session_id: session.id,
            created_at: session.created_at.to_rfc3339(),
        })),
    ))
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<SessionDeleted> {
    let correlation_id = correlation_id(&headers);
    let session_id = SessionId(session_id);
    let files_released = state
        .runtime
        .store()
        .delete(&session_id)
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(SessionDeleted { session_id, files_released })
}

async fn send_message(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> ApiResult<ChatReply> {
    let correlation_id = correlation_id(&headers);
    let Json(body) = body.map_err(|rejection| {
        state.fail(ApplicationError::Validation(rejection.body_text()), &correlation_id)
    })?;
    chat(&state, SessionId(session_id), &body.message, Vec::new(), &correlation_id).await
}

async fn send_message_with_files(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<ChatReply> {
    let correlation_id = correlation_id(&headers);
    let form = read_form(multipart, state.limits)
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    let message = form.message.ok_or_else(|| {
        state.fail(
            ApplicationError::Validation("missing form field `message`".to_string()),
            &correlation_id,
        )
    })?;
    chat(&state, SessionId(session_id), &message, form.uploads, &correlation_id).await
}

async fn chat(
    state: &ApiState,
    session_id: SessionId,
    message: &str,
    uploads: Vec<Upload>,
    correlation_id: &str,
) -> ApiResult<ChatReply> {
    let reply = state
        .runtime
        .handle_message(&session_id, message, uploads, correlation_id)
        .await
        .map_err(|error| state.fail(error, correlation_id))?;

    ok(ChatReply {
        response: reply.outcome.text,
        tool_used: reply.outcome.tool_used,
        unexecuted_tool_call: reply.outcome.unexecuted_tool_call,
        usage: reply.outcome.usage,
        attachments: reply.attachments.iter().map(AttachmentView::from).collect(),
    })
}

async fn list_messages(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Vec<Message>> {
    let correlation_id = correlation_id(&headers);
    let messages = state
        .runtime
        .store()
        .list_messages(&SessionId(session_id))
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(messages)
}

async fn upload_files(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Vec<AttachmentView>> {
    let correlation_id = correlation_id(&headers);
    let form = read_form(multipart, state.limits)
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    if form.uploads.is_empty() {
        return Err(state.fail(
            ApplicationError::Validation("no `file` parts in the request".to_string()),
            &correlation_id,
        ));
    }

    let session_id = SessionId(session_id);
    let store = state.runtime.store();
    let mut attached = Vec::with_capacity(form.uploads.len());
    for upload in &form.uploads {
        let outcome = store
            .attach_file(&session_id, &upload.bytes, &upload.file_name)
            .await
            .map_err(|error| state.fail(error, &correlation_id))?;
        attached.push(AttachmentView::from(&outcome));
    }
    ok(attached)
}

async fn list_files(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Vec<FileView>> {
    let correlation_id = correlation_id(&headers);
    let files = state
        .runtime
        .store()
        .list_files(&SessionId(session_id))
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(files.iter().map(FileView::from).collect())
}

async fn get_pricing_context(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<PricingContextInfo> {
    let correlation_id = correlation_id(&headers);
    let info = state
        .runtime
        .store()
        .pricing_context_info(&SessionId(session_id))
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(info)
}

async fn set_pricing_context(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<SetContextBody>, JsonRejection>,
) -> ApiResult<PricingContextInfo> {
    let correlation_id = correlation_id(&headers);
    let Json(body) = body.map_err(|rejection| {
        state.fail(ApplicationError::Validation(rejection.body_text()), &correlation_id)
    })?;
    let info = state
        .runtime
        .store()
        .set_pricing_context(&SessionId(session_id), &FileId(body.file_id))
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(info)
}

async fn clear_pricing_context(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<PricingContextInfo> {
    let correlation_id = correlation_id(&headers);
    let info = state
        .runtime
        .store()
        .clear_pricing_context(&SessionId(session_id))
        .await
        .map_err(|error| state.fail(error, &correlation_id))?;
    ok(info)
}

#[derive(Debug, Default)]
struct UploadForm {
    message: Option<String>,
    uploads: Vec<Upload>,
}

/// Reads `message` and `file` parts, enforcing extension, size and count limits per file.
async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
    limits: UploadLimits,
) -> Result<UploadForm, ApplicationError> {
    let mut multipart = multipart
        .map_err(|rejection| ApplicationError::Validation(rejection.body_text()))?;
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(ToString::to_string);
        match name.as_deref() {
            Some("message") => form.message = Some(field.text().await.map_err(malformed)?),
            Some("file") | Some("files") => {
                let file_name = field.file_name().map(ToString::to_string).ok_or_else(|| {
                    ApplicationError::Validation("file part is missing a file name".to_string())
                })?;
                if !pricing::is_allowed_upload(&file_name) {
                    return Err(ApplicationError::Validation(format!(
                        "file `{file_name}` has an unsupported extension; allowed: {}",
                        pricing::UPLOAD_EXTENSIONS.map(|ext| format!(".{ext}")).join(", ")
                    )));
                }
                if form.uploads.len() >= limits.max_files {
                    return Err(ApplicationError::Validation(format!(
                        "at most {} files may be uploaded per request",
                        limits.max_files
                    )));
                }
                let bytes = field.bytes().await.map_err(malformed)?;
                if bytes.len() > limits.max_file_bytes {
                    return Err(ApplicationError::Validation(format!(
                        "file `{file_name}` exceeds the {} byte upload limit",
                        limits.max_file_bytes
                    )));
                }
                form.uploads.push(Upload { file_name, bytes: bytes.to_vec() });
            }
            _ => {}
        }
    }
    Ok(form)
}

fn malformed(error: axum::extract::multipart::MultipartError) -> ApplicationError {
    ApplicationError::Validation(format!("malformed multipart body: {}", error.body_text()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use pricewise_agent::collaborators::{
        AnalysisRequest, AnalysisService, CollaboratorError, JobSnapshot, PricingUpload,
        TaskStarted, TransformationRequest, TransformationService, TransformationStatus,
        TRANSFORMATION_SERVICE,
    };
    use pricewise_agent::conversation::TurnEngine;
    use pricewise_agent::llm::{ModelClient, ModelError, ModelReply, ModelRequest, ModelResponse, Usage};
    use pricewise_agent::runtime::AgentRuntime;
    use pricewise_agent::tools::{ContextAdoption, ToolDispatcher};
    use pricewise_core::domain::job::{JobId, JobStatus};
    use pricewise_store::file_store::LocalFileStore;
    use pricewise_store::sessions::SessionStore;

    use super::{router, ApiState, UploadLimits};

    const PRICING: &str =
        "saasName: Acme\nversion: '1.0'\ncurrency: USD\nplans:\n  BASIC:\n    price: 10\n";
    const BOUNDARY: &str = "pricewise-test-boundary";

    struct StubModel {
        available: bool,
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn generate(&self, _request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
            if !self.available {
                return Err(ModelError::Timeout);
            }
            Ok(ModelResponse { reply: ModelReply::Text("stub reply".to_string()), usage: Usage::default() })
        }
    }

    struct OfflineServices;

    #[async_trait]
    impl AnalysisService for OfflineServices {
        async fn summarize(&self, _document: PricingUpload) -> Result<Value, CollaboratorError> {
            Ok(json!({"numberOfPlans": 1}))
        }

        async fn start_analysis(
            &self,
            _document: PricingUpload,
            _request: &AnalysisRequest,
        ) -> Result<JobId, CollaboratorError> {
            Ok(JobId("job".to_string()))
        }

        async fn analysis_status(&self, _job_id: &JobId) -> Result<JobSnapshot, CollaboratorError> {
            Ok(JobSnapshot { status: JobStatus::Running, result: None, error: None })
        }
    }

    #[async_trait]
    impl TransformationService for OfflineServices {
        async fn start_transformation(
            &self,
            _request: &TransformationRequest,
        ) -> Result<TaskStarted, CollaboratorError> {
            Err(CollaboratorError::Timeout { service: TRANSFORMATION_SERVICE })
        }

        async fn transformation_status(
            &self,
            _task_id: &JobId,
        ) -> Result<TransformationStatus, CollaboratorError> {
            Err(CollaboratorError::Timeout { service: TRANSFORMATION_SERVICE })
        }
    }

    struct TestApp {
        dir: TempDir,
        router: Router,
        fatal: watch::Receiver<bool>,
    }

    async fn app(model_available: bool) -> TestApp {
        let dir = TempDir::new().expect("tempdir");
        let files = Arc::new(LocalFileStore::open(dir.path().join("uploads")).await.expect("open"));
        let store = Arc::new(SessionStore::new(files.clone()));
        let dispatcher = ToolDispatcher::new(
            store.clone(),
            Arc::new(OfflineServices),
            Arc::new(OfflineServices),
            ContextAdoption::Automatic,
        );
        let engine = TurnEngine::new(Arc::new(StubModel { available: model_available }), dispatcher)
            .expect("engine");
        let runtime = Arc::new(AgentRuntime::new(store, engine));
        let (fatal_tx, fatal) = watch::channel(false);
        let limits = UploadLimits { max_file_bytes: 1024, max_files: 2 };
        let router = router(ApiState::new(runtime, limits, Arc::new(fatal_tx)), files);
        TestApp { dir, router, fatal }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).expect("request")
    }

    fn multipart_request(uri: &str, message: Option<&str>, files: &[(&str, &str)]) -> Request<Body> {
        let mut body = String::new();
        if let Some(message) = message {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"message\"\r\n\r\n{message}\r\n"
            ));
        }
        for (name, content) in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));

        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .expect("request")
    }

    async fn create_session(router: &Router) -> String {
        let (status, body) = send(router, empty_request("POST", "/api/v1/sessions")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        body["data"]["sessionId"].as_str().expect("session id").to_string()
    }

    #[tokio::test]
    async fn chat_round_trip_is_logged() {
        let app = app(true).await;
        let id = create_session(&app.router).await;

        let (status, body) = send(
            &app.router,
            json_request("POST", &format!("/api/v1/sessions/{id}/messages"), json!({"message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["response"], "stub reply");
        assert!(body.get("error").is_none());

        let (_, messages) =
            send(&app.router, empty_request("GET", &format!("/api/v1/sessions/{id}/messages"))).await;
        assert_eq!(messages["data"].as_array().map(Vec::len), Some(2));
        assert_eq!(messages["data"][0]["role"], "user");
    }

    #[tokio::test]
    async fn missing_session_and_bad_body_are_reported_in_envelope() {
        let app = app(true).await;

        let (status, body) = send(
            &app.router,
            json_request("POST", "/api/v1/sessions/unknown/messages", json!({"message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"]["detail"].as_str().is_some_and(|detail| detail.contains("unknown")));

        let id = create_session(&app.router).await;
        let (status, body) = send(
            &app.router,
            json_request("POST", &format!("/api/v1/sessions/{id}/messages"), json!({"text": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn model_outage_is_service_unavailable_and_not_fatal() {
        let app = app(false).await;
        let id = create_session(&app.router).await;

        let (status, body) = send(
            &app.router,
            json_request("POST", &format!("/api/v1/sessions/{id}/messages"), json!({"message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert!(!*app.fatal.borrow());
    }

    #[tokio::test]
    async fn uploaded_pricing_file_becomes_context_and_can_be_cleared() {
        let app = app(true).await;
        let id = create_session(&app.router).await;

        let (status, body) = send(
            &app.router,
            multipart_request(&format!("/api/v1/sessions/{id}/files"), None, &[("pricing.yaml", PRICING)]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["contextAdopted"], true);
        assert_eq!(body["data"][0]["validation"]["isValid"], true);
        let file_id = body["data"][0]["fileId"].as_str().expect("file id").to_string();

        let context_uri = format!("/api/v1/sessions/{id}/pricing-context");
        let (_, info) = send(&app.router, empty_request("GET", &context_uri)).await;
        assert_eq!(info["data"]["hasContext"], true);
        assert_eq!(info["data"]["fileName"], "pricing.yaml");

        let (_, info) = send(&app.router, empty_request("DELETE", &context_uri)).await;
        assert_eq!(info["data"]["hasContext"], false);

        let (status, info) =
            send(&app.router, json_request("PUT", &context_uri, json!({"fileId": file_id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["data"]["hasContext"], true);

        let (status, _) =
            send(&app.router, json_request("PUT", &context_uri, json!({"fileId": "upload_nope"})))
                .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_limits_are_enforced() {
        let app = app(true).await;
        let id = create_session(&app.router).await;
        let uri = format!("/api/v1/sessions/{id}/files");

        let (status, body) = send(&app.router, multipart_request(&uri, None, &[("notes.txt", "x")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["detail"].as_str().is_some_and(|detail| detail.contains(".yaml")));

        let three = [("a.yaml", PRICING), ("b.yaml", PRICING), ("c.yaml", PRICING)];
        let (status, _) = send(&app.router, multipart_request(&uri, None, &three)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let oversized = "x".repeat(2048);
        let (status, _) =
            send(&app.router, multipart_request(&uri, None, &[("big.json", oversized.as_str())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, files) = send(&app.router, empty_request("GET", &uri)).await;
        assert_eq!(files["data"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn message_with_files_requires_message_field() {
        let app = app(true).await;
        let id = create_session(&app.router).await;
        let uri = format!("/api/v1/sessions/{id}/messages/upload");

        let (status, _) = send(&app.router, multipart_request(&uri, None, &[("p.yaml", PRICING)])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            send(&app.router, multipart_request(&uri, Some("summarize"), &[("p.yaml", PRICING)]))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["attachments"][0]["fileName"], "p.yaml");
    }

    #[tokio::test]
    async fn storage_failure_is_fatal() {
        let app = app(true).await;
        let id = create_session(&app.router).await;
        std::fs::remove_dir_all(app.dir.path().join("uploads")).expect("remove storage");

        let (status, body) = send(
            &app.router,
            multipart_request(&format!("/api/v1/sessions/{id}/files"), None, &[("p.yaml", PRICING)]),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["detail"], "An unexpected internal error occurred.");
        assert!(*app.fatal.borrow());

        let (status, _) = send(&app.router, empty_request("GET", "/api/v1/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn deleted_session_is_gone() {
        let app = app(true).await;
        let id = create_session(&app.router).await;
        let uri = format!("/api/v1/sessions/{id}");

        let (status, body) = send(&app.router, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["filesReleased"], 0);

        let (status, _) = send(&app.router, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
