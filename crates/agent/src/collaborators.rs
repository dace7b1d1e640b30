//! Clients for the analysis and transformation services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use pricewise_core::config::ServicesConfig;
use pricewise_core::domain::job::{JobId, JobStatus};
use pricewise_core::errors::ApplicationError;

pub const ANALYSIS_SERVICE: &str = "analysis";
pub const TRANSFORMATION_SERVICE: &str = "transformation";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{service} service timed out")]
    Timeout { service: &'static str },
    #[error("{service} service unreachable: {message}")]
    Transport { service: &'static str, message: String },
    #[error("{service} service returned HTTP {status}: {message}")]
    Http { service: &'static str, status: u16, message: String },
    #[error("{service} service does not know `{id}`")]
    NotFound { service: &'static str, id: String },
    #[error("{service} service sent an unreadable response: {message}")]
    Decode { service: &'static str, message: String },
}

impl From<CollaboratorError> for ApplicationError {
    fn from(value: CollaboratorError) -> Self {
        let service = match &value {
            CollaboratorError::Timeout { service }
            | CollaboratorError::Transport { service, .. }
            | CollaboratorError::Http { service, .. }
            | CollaboratorError::NotFound { service, .. }
            | CollaboratorError::Decode { service, .. } => (*service).to_string(),
        };
        Self::Collaborator { service, message: value.to_string() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOperation {
    Validate,
    Optimal,
    Subscriptions,
    Filter,
}

impl AnalysisOperation {
    pub const ALL: [Self; 4] = [Self::Validate, Self::Optimal, Self::Subscriptions, Self::Filter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Optimal => "optimal",
            Self::Subscriptions => "subscriptions",
            Self::Filter => "filter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|operation| operation.as_str() == value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    Minizinc,
    Choco,
}

impl Solver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minizinc => "minizinc",
            Self::Choco => "choco",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minizinc" => Some(Self::Minizinc),
            "choco" => Some(Self::Choco),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Minimize,
    Maximize,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minimize" => Some(Self::Minimize),
            "maximize" => Some(Self::Maximize),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisRequest {
    pub operation: AnalysisOperation,
    pub solver: Solver,
    pub filters: Option<Value>,
    pub objective: Option<Objective>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransformationRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskStarted {
    pub task_id: JobId,
    pub status: JobStatus,
}

/// Poll result for a transformation. `document` is set once the task has completed.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformationStatus {
    pub status: JobStatus,
    pub document: Option<String>,
    pub error: Option<String>,
}

/// A pricing document handed to the analysis service.
#[derive(Clone, Debug)]
pub struct PricingUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl PricingUpload {
    pub fn mime_type(&self) -> &'static str {
        let extension = self.file_name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("json") => "application/json",
            _ => "application/yaml",
        }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn summarize(&self, document: PricingUpload) -> Result<Value, CollaboratorError>;

    async fn start_analysis(
        &self,
        document: PricingUpload,
        request: &AnalysisRequest,
    ) -> Result<JobId, CollaboratorError>;

    async fn analysis_status(&self, job_id: &JobId) -> Result<JobSnapshot, CollaboratorError>;
}

#[async_trait]
pub trait TransformationService: Send + Sync {
    async fn start_transformation(
        &self,
        request: &TransformationRequest,
    ) -> Result<TaskStarted, CollaboratorError>;

    async fn transformation_status(
        &self,
        task_id: &JobId,
    ) -> Result<TransformationStatus, CollaboratorError>;
}

pub struct HttpAnalysisService {
    client: Client,
    base_url: String,
}

impl HttpAnalysisService {
    pub fn new(config: &ServicesConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client(ANALYSIS_SERVICE, config.request_timeout_secs)?,
            base_url: config.analysis_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn document_part(document: PricingUpload) -> Result<Part, CollaboratorError> {
        let mime = document.mime_type();
        Part::bytes(document.bytes)
            .file_name(document.file_name)
            .mime_str(mime)
            .map_err(|error| transport(ANALYSIS_SERVICE, error))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatusBody {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn summarize(&self, document: PricingUpload) -> Result<Value, CollaboratorError> {
        let form = Form::new().part("pricingFile", Self::document_part(document)?);
        let response = self
            .client
            .post(format!("{}/pricing/summary", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|error| transport(ANALYSIS_SERVICE, error))?;

        let response = ensure_success(ANALYSIS_SERVICE, response, None).await?;
        response.json::<Value>().await.map_err(|error| decode(ANALYSIS_SERVICE, error))
    }

    async fn start_analysis(
        &self,
        document: PricingUpload,
        request: &AnalysisRequest,
    ) -> Result<JobId, CollaboratorError> {
        let mut form = Form::new()
            .part("pricingFile", Self::document_part(document)?)
            .text("operation", request.operation.as_str())
            .text("solver", request.solver.as_str());
        if let Some(filters) = &request.filters {
            form = form.text("filters", filters.to_string());
        }
        if let Some(objective) = request.objective {
            form = form.text("objective", objective.as_str());
        }

        let response = self
            .client
            .post(format!("{}/pricing/analysis", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|error| transport(ANALYSIS_SERVICE, error))?;

        let response = ensure_success(ANALYSIS_SERVICE, response, None).await?;
        let accepted =
            response.json::<JobAccepted>().await.map_err(|error| decode(ANALYSIS_SERVICE, error))?;
        Ok(JobId(accepted.job_id))
    }

    async fn analysis_status(&self, job_id: &JobId) -> Result<JobSnapshot, CollaboratorError> {
        let response = self
            .client
            .get(format!("{}/pricing/analysis/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(|error| transport(ANALYSIS_SERVICE, error))?;

        let response = ensure_success(ANALYSIS_SERVICE, response, Some(&job_id.0)).await?;
        let body = response
            .json::<JobStatusBody>()
            .await
            .map_err(|error| decode(ANALYSIS_SERVICE, error))?;

        Ok(JobSnapshot {
            status: parse_status(ANALYSIS_SERVICE, &body.status)?,
            result: body.result,
            error: body.error.map(error_text),
        })
    }
}

pub struct HttpTransformationService {
    client: Client,
    base_url: String,
}

impl HttpTransformationService {
    pub fn new(config: &ServicesConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client(TRANSFORMATION_SERVICE, config.transformation_timeout_secs)?,
            base_url: config.transformation_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct TaskAccepted {
    task_id: String,
    #[serde(default)]
    status: Option<String>,
}

#[async_trait]
impl TransformationService for HttpTransformationService {
    async fn start_transformation(
        &self,
        request: &TransformationRequest,
    ) -> Result<TaskStarted, CollaboratorError> {
        let response = self
            .client
            .post(format!("{}/transform", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|error| transport(TRANSFORMATION_SERVICE, error))?;

        let response = ensure_success(TRANSFORMATION_SERVICE, response, None).await?;
        let accepted = response
            .json::<TaskAccepted>()
            .await
            .map_err(|error| decode(TRANSFORMATION_SERVICE, error))?;

        let status = match accepted.status.as_deref() {
            Some(status) => parse_status(TRANSFORMATION_SERVICE, status)?,
            None => JobStatus::Pending,
        };
        Ok(TaskStarted { task_id: JobId(accepted.task_id), status })
    }

    async fn transformation_status(
        &self,
        task_id: &JobId,
    ) -> Result<TransformationStatus, CollaboratorError> {
        let response = self
            .client
            .get(format!("{}/transform/status/{}", self.base_url, task_id))
            .send()
            .await
            .map_err(|error| transport(TRANSFORMATION_SERVICE, error))?;

        let response = ensure_success(TRANSFORMATION_SERVICE, response, Some(&task_id.0)).await?;
        let body = response.text().await.map_err(|error| decode(TRANSFORMATION_SERVICE, error))?;
        interpret_transformation_body(body)
    }
}

/// A completed task answers with the document itself; anything else is a JSON status object.
fn interpret_transformation_body(body: String) -> Result<TransformationStatus, CollaboratorError> {
    if let Ok(status_body) = serde_json::from_str::<JobStatusBody>(&body) {
        let status = parse_status(TRANSFORMATION_SERVICE, &status_body.status)?;
        let document = status_body.result.and_then(|result| match result {
            Value::String(document) if status == JobStatus::Completed => Some(document),
            _ => None,
        });
        if status != JobStatus::Completed || document.is_some() {
            return Ok(TransformationStatus {
                status,
                document,
                error: status_body.error.map(error_text),
            });
        }
        return Err(CollaboratorError::Decode {
            service: TRANSFORMATION_SERVICE,
            message: "completed task carried no document".to_string(),
        });
    }

    if body.trim().is_empty() {
        return Err(CollaboratorError::Decode {
            service: TRANSFORMATION_SERVICE,
            message: "empty status response".to_string(),
        });
    }
    Ok(TransformationStatus { status: JobStatus::Completed, document: Some(body), error: None })
}

fn build_client(service: &'static str, timeout_secs: u64) -> Result<Client, CollaboratorError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|error| transport(service, error))
}

async fn ensure_success(
    service: &'static str,
    response: Response,
    id: Option<&str>,
) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = id {
            return Err(CollaboratorError::NotFound { service, id: id.to_string() });
        }
    }

    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Http { service, status: status.as_u16(), message: error_message(&body) })
}

/// Pulls `detail` or `error` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "error", "message"]
                .into_iter()
                .find_map(|key| value.get(key).cloned())
                .map(error_text)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn error_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn parse_status(service: &'static str, value: &str) -> Result<JobStatus, CollaboratorError> {
    JobStatus::parse(value).ok_or_else(|| CollaboratorError::Decode {
        service,
        message: format!("unknown status `{value}`"),
    })
}

fn transport(service: &'static str, error: reqwest::Error) -> CollaboratorError {
    if error.is_timeout() {
        CollaboratorError::Timeout { service }
    } else {
        CollaboratorError::Transport { service, message: error.to_string() }
    }
}

fn decode(service: &'static str, error: reqwest::Error) -> CollaboratorError {
    if error.is_timeout() {
        CollaboratorError::Timeout { service }
    } else {
        CollaboratorError::Decode { service, message: error.to_string() }
    }
}
