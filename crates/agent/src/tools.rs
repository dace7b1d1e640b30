//! Fixed tool catalogue and the dispatcher that runs one tool call against a session.
//!
//! Every handler failure, whether a bad argument, a missing file or a collaborator outage, is
//! folded into a failure [`ToolCallResult`]. Nothing raised here reaches the turn engine.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use pricewise_core::config::SessionsConfig;
use pricewise_core::domain::file::{FileId, FileKind, FileRef, FileStatus};
use pricewise_core::domain::job::{JobId, JobKind, JobRef, JobStatus};
use pricewise_core::domain::message::{ToolCallRequest, ToolCallResult};
use pricewise_core::domain::session::{PricingContext, Session};
use pricewise_core::pricing::ValidationReport;
use pricewise_store::file_store::{load_context, FileStoreError};
use pricewise_store::sessions::{SessionStore, StoreError};

use crate::collaborators::{
    AnalysisOperation, AnalysisRequest, AnalysisService, CollaboratorError, Objective,
    PricingUpload, Solver, TransformationRequest, TransformationService,
};
use crate::llm::ToolDeclaration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    GetPricingSummary,
    StartPricingAnalysisJob,
    GetPricingAnalysisJobStatus,
    InitiatePricingPageTransformation,
    GetTransformationTaskStatus,
    GetPricingStrategyAdvice,
    GetAvailableTransformationFiles,
}

impl ToolName {
    pub const ALL: [Self; 7] = [
        Self::GetPricingSummary,
        Self::StartPricingAnalysisJob,
        Self::GetPricingAnalysisJobStatus,
        Self::InitiatePricingPageTransformation,
        Self::GetTransformationTaskStatus,
        Self::GetPricingStrategyAdvice,
        Self::GetAvailableTransformationFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetPricingSummary => "getPricingSummary",
            Self::StartPricingAnalysisJob => "startPricingAnalysisJob",
            Self::GetPricingAnalysisJobStatus => "getPricingAnalysisJobStatus",
            Self::InitiatePricingPageTransformation => "initiatePricingPageTransformation",
            Self::GetTransformationTaskStatus => "getTransformationTaskStatus",
            Self::GetPricingStrategyAdvice => "getPricingStrategyAdvice",
            Self::GetAvailableTransformationFiles => "getAvailableTransformationFiles",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    fn description(&self) -> &'static str {
        match self {
            Self::GetPricingSummary => {
                "Returns a structural summary (plans, features, add-ons, usage limits) of an \
                 uploaded or transformed pricing file."
            }
            Self::StartPricingAnalysisJob => {
                "Starts an asynchronous constraint-satisfaction analysis over a pricing file and \
                 returns a job id to poll."
            }
            Self::GetPricingAnalysisJobStatus => {
                "Returns the status and, once completed, the result of a pricing analysis job."
            }
            Self::InitiatePricingPageTransformation => {
                "Starts converting a public SaaS pricing page into a Pricing2Yaml document and \
                 returns a task id to poll."
            }
            Self::GetTransformationTaskStatus => {
                "Returns the status of a pricing-page transformation. On completion the document \
                 is stored and becomes available as a pricing file."
            }
            Self::GetPricingStrategyAdvice => {
                "Signals that the user wants general pricing-strategy advice on a topic. No data \
                 is fetched; answer from expertise."
            }
            Self::GetAvailableTransformationFiles => {
                "Lists pricing files produced by completed transformations."
            }
        }
    }

    fn parameters(&self) -> Value {
        match self {
            Self::GetPricingSummary => json!({
                "type": "object",
                "properties": {
                    "pricingFileId": {"type": "string", "description": "Id of the pricing file."}
                },
                "required": ["pricingFileId"]
            }),
            Self::StartPricingAnalysisJob => json!({
                "type": "object",
                "properties": {
                    "pricingFileId": {"type": "string", "description": "Id of the pricing file."},
                    "operation": {
                        "type": "string",
                        "enum": ["validate", "optimal", "subscriptions", "filter"]
                    },
                    "solver": {"type": "string", "enum": ["minizinc", "choco"]},
                    "objective": {
                        "type": "string",
                        "enum": ["minimize", "maximize"],
                        "description": "Required when operation is `optimal`."
                    },
                    "filters": {
                        "type": "object",
                        "description": "Required when operation is `filter`.",
                        "properties": {
                            "minPrice": {"type": "number"},
                            "maxPrice": {"type": "number"},
                            "features": {"type": "array", "items": {"type": "string"}},
                            "usageLimits": {"type": "array", "items": {"type": "object"}}
                        }
                    }
                },
                "required": ["pricingFileId", "operation", "solver"]
            }),
            Self::GetPricingAnalysisJobStatus => json!({
                "type": "object",
                "properties": {"jobId": {"type": "string"}},
                "required": ["jobId"]
            }),
            Self::InitiatePricingPageTransformation => json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "http(s) URL of the pricing page."},
                    "model": {"type": "string"},
                    "max_tries": {"type": "integer"}
                },
                "required": ["url"]
            }),
            Self::GetTransformationTaskStatus => json!({
                "type": "object",
                "properties": {"taskId": {"type": "string"}},
                "required": ["taskId"]
            }),
            Self::GetPricingStrategyAdvice => json!({
                "type": "object",
                "properties": {"topic": {"type": "string"}},
                "required": ["topic"]
            }),
            Self::GetAvailableTransformationFiles => Value::Null,
        }
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

pub fn catalogue() -> Vec<ToolDeclaration> {
    ToolName::ALL.iter().map(ToolName::declaration).collect()
}

/// Whether a freshly completed transformation replaces the session's pricing context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextAdoption {
    #[default]
    Automatic,
    Manual,
}

impl ContextAdoption {
    pub fn from_config(config: &SessionsConfig) -> Self {
        if config.auto_adopt_transformations {
            Self::Automatic
        } else {
            Self::Manual
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{name}`; available tools: {available}")]
    UnknownTool { name: String, available: String },
    #[error("missing required argument `{0}`")]
    MissingArgument(&'static str),
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    #[error("file `{0}` is not available; it must be uploaded or produced by a transformation first")]
    FileUnavailable(FileId),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("storage failed: {0}")]
    Storage(String),
}

impl From<StoreError> for ToolError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<FileStoreError> for ToolError {
    fn from(value: FileStoreError) -> Self {
        Self::Storage(value.to_string())
    }
}

pub struct ToolDispatcher {
    store: Arc<SessionStore>,
    analysis: Arc<dyn AnalysisService>,
    transformation: Arc<dyn TransformationService>,
    adoption: ContextAdoption,
    /// Serializes the lookup-then-save of transformation outputs across sessions.
    persisting: Mutex<()>,
}

impl ToolDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        analysis: Arc<dyn AnalysisService>,
        transformation: Arc<dyn TransformationService>,
        adoption: ContextAdoption,
    ) -> Self {
        Self { store, analysis, transformation, adoption, persisting: Mutex::new(()) }
    }

    pub fn catalogue(&self) -> Vec<ToolDeclaration> {
        catalogue()
    }

    /// Runs one tool call against a session the caller holds. Always produces a result.
    pub async fn execute(&self, request: &ToolCallRequest, session: &mut Session) -> ToolCallResult {
        let outcome = match ToolName::parse(&request.name) {
            Some(tool) => self.run(tool, &request.arguments, session).await,
            None => Err(ToolError::UnknownTool {
                name: request.name.clone(),
                available: ToolName::ALL.map(|tool| tool.as_str()).join(", "),
            }),
        };

        match outcome {
            Ok(payload) => {
                info!(
                    event_name = "tool.dispatch.completed",
                    session_id = %session.id,
                    tool = %request.name,
                    "tool call completed"
                );
                ToolCallResult::success(request.name.clone(), payload)
            }
            Err(error) => {
                warn!(
                    event_name = "tool.dispatch.failed",
                    session_id = %session.id,
                    tool = %request.name,
                    error = %error,
                    "tool call failed"
                );
                ToolCallResult::failure(request.name.clone(), error.to_string())
            }
        }
    }

    async fn run(
        &self,
        tool: ToolName,
        arguments: &Map<String, Value>,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        match tool {
            ToolName::GetPricingSummary => self.pricing_summary(arguments, session).await,
            ToolName::StartPricingAnalysisJob => self.start_analysis(arguments, session).await,
            ToolName::GetPricingAnalysisJobStatus => self.analysis_status(arguments, session).await,
            ToolName::InitiatePricingPageTransformation => {
                self.start_transformation(arguments, session).await
            }
            ToolName::GetTransformationTaskStatus => {
                self.transformation_status(arguments, session).await
            }
            ToolName::GetPricingStrategyAdvice => strategy_advice(arguments, session),
            ToolName::GetAvailableTransformationFiles => self.available_transformations().await,
        }
    }

    async fn load_pricing_file(
        &self,
        arguments: &Map<String, Value>,
        session: &Session,
    ) -> Result<(FileId, PricingUpload), ToolError> {
        let file_id = FileId(required_str(arguments, "pricingFileId")?.to_string());
        let file = self
            .store
            .resolve_file_locked(session, &file_id)
            .await?
            .ok_or_else(|| ToolError::FileUnavailable(file_id.clone()))?;
        let bytes = self.store.file_store().read(&file.id).await.map_err(|error| {
            if error.is_not_found() {
                ToolError::FileUnavailable(file_id.clone())
            } else {
                error.into()
            }
        })?;
        Ok((file.id, PricingUpload { file_name: file.original_name, bytes }))
    }

    async fn pricing_summary(
        &self,
        arguments: &Map<String, Value>,
        session: &Session,
    ) -> Result<Value, ToolError> {
        let (file_id, upload) = self.load_pricing_file(arguments, session).await?;
        let file_name = upload.file_name.clone();
        let summary = self.analysis.summarize(upload).await?;
        Ok(json!({ "pricingFileId": file_id.0, "fileName": file_name, "summary": summary }))
    }

    async fn start_analysis(
        &self,
        arguments: &Map<String, Value>,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let request = analysis_request(arguments)?;
        let (file_id, upload) = self.load_pricing_file(arguments, session).await?;
        let job_id = self.analysis.start_analysis(upload, &request).await?;
        session.record_job(JobRef::new(job_id.clone(), JobKind::Analysis, JobStatus::Pending));

        Ok(json!({
            "jobId": job_id.0,
            "status": JobStatus::Pending.as_str(),
            "pricingFileId": file_id.0,
            "operation": request.operation.as_str(),
            "solver": request.solver.as_str(),
        }))
    }

    async fn analysis_status(
        &self,
        arguments: &Map<String, Value>,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let job_id = JobId(required_str(arguments, "jobId")?.to_string());
        let snapshot = self.analysis.analysis_status(&job_id).await?;
        if let Some(job) = session.job_mut(&job_id) {
            job.refresh(snapshot.status, snapshot.error.clone());
        }

        let mut payload = json!({ "jobId": job_id.0, "status": snapshot.status.as_str() });
        if let Some(result) = snapshot.result {
            payload["result"] = result;
        }
        if let Some(error) = snapshot.error {
            payload["error"] = Value::String(error);
        }
        Ok(payload)
    }

    async fn start_transformation(
        &self,
        arguments: &Map<String, Value>,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let request = transformation_request(arguments)?;
        let task = self.transformation.start_transformation(&request).await?;
        session.record_job(JobRef::new(task.task_id.clone(), JobKind::Transformation, task.status));

        Ok(json!({ "taskId": task.task_id.0, "status": task.status.as_str(), "url": request.url }))
    }

    async fn transformation_status(
        &self,
        arguments: &Map<String, Value>,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let task_id = JobId(required_str(arguments, "taskId")?.to_string());

        if let Some(file_id) = session.job(&task_id).and_then(|job| job.result_file_id.clone()) {
            return Ok(json!({
                "taskId": task_id.0,
                "status": JobStatus::Completed.as_str(),
                "fileId": file_id.0,
                "alreadyProcessed": true,
                "pricingContextUpdated": false,
            }));
        }

        let file_name = output_name(&task_id);
        if let Some(file) = self.stored_output(&file_name).await? {
            return self.link_stored_output(task_id, file, session).await;
        }

        let status = self.transformation.transformation_status(&task_id).await?;
        let document = match (status.status, status.document) {
            (JobStatus::Completed, Some(document)) => document,
            (current, _) => {
                if let Some(job) = session.job_mut(&task_id) {
                    job.refresh(current, status.error.clone());
                }
                let mut payload = json!({ "taskId": task_id.0, "status": current.as_str() });
                if let Some(error) = status.error {
                    payload["error"] = Value::String(error);
                }
                return Ok(payload);
            }
        };

        let _persisting = self.persisting.lock().await;
        if let Some(file) = self.stored_output(&file_name).await? {
            return self.link_stored_output(task_id, file, session).await;
        }
        self.persist_transformation(task_id, &file_name, document, session).await
    }

    /// The output an earlier poll of the same task put in the shared pool.
    async fn stored_output(&self, file_name: &str) -> Result<Option<FileRef>, ToolError> {
        let pool = self.store.file_store().list_by_prefix(FileKind::Transformation).await?;
        Ok(pool.into_iter().find(|file| file.original_name == file_name))
    }

    /// Points this session at an output another session stored. The producing session keeps
    /// ownership of the file.
    async fn link_stored_output(
        &self,
        task_id: JobId,
        file: FileRef,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let (validation, context) = self.prepare_output(&file).await?;
        Ok(self.complete_transformation(task_id, file, validation, context, true, session))
    }

    /// Stores a just-completed transformation under the session, at most once per task.
    async fn persist_transformation(
        &self,
        task_id: JobId,
        file_name: &str,
        document: String,
        session: &mut Session,
    ) -> Result<Value, ToolError> {
        let mut file = self
            .store
            .file_store()
            .save(document.as_bytes(), file_name, FileKind::Transformation)
            .await?;
        let (validation, context) = match self.prepare_output(&file).await {
            Ok(prepared) => prepared,
            Err(error) => {
                self.store.discard_file(&session.id, &file.id).await;
                return Err(error);
            }
        };
        if !validation.is_valid {
            file.status = FileStatus::Invalid;
        }
        session.attach_file(file.clone());
        Ok(self.complete_transformation(task_id, file, validation, context, false, session))
    }

    async fn prepare_output(
        &self,
        file: &FileRef,
    ) -> Result<(ValidationReport, Option<PricingContext>), ToolError> {
        let files = self.store.file_store();
        let validation = files.validate(&file.id).await?;
        let context = match self.adoption {
            ContextAdoption::Automatic => Some(load_context(&**files, file).await?),
            ContextAdoption::Manual => None,
        };
        Ok((validation, context))
    }

    fn complete_transformation(
        &self,
        task_id: JobId,
        file: FileRef,
        validation: ValidationReport,
        context: Option<PricingContext>,
        reused: bool,
        session: &mut Session,
    ) -> Value {
        if session.job(&task_id).is_none() {
            session.record_job(JobRef::new(
                task_id.clone(),
                JobKind::Transformation,
                JobStatus::Completed,
            ));
        }
        if let Some(job) = session.job_mut(&task_id) {
            job.refresh(JobStatus::Completed, None);
            job.result_file_id = Some(file.id.clone());
        }

        let context_updated = context.is_some();
        if let Some(context) = context {
            session.set_pricing_context(context);
        }

        info!(
            event_name = "tool.transformation.persisted",
            session_id = %session.id,
            task_id = %task_id,
            file_id = %file.id,
            reused,
            context_updated,
            "transformation output recorded"
        );

        json!({
            "taskId": task_id.0,
            "status": JobStatus::Completed.as_str(),
            "fileId": file.id.0,
            "fileName": file.original_name,
            "validation": validation,
            "pricingContextUpdated": context_updated,
            "reusedStoredOutput": reused,
        })
    }

    async fn available_transformations(&self) -> Result<Value, ToolError> {
        let files = self.store.file_store().list_by_prefix(FileKind::Transformation).await?;
        let listed = files
            .iter()
            .map(|file| {
                json!({
                    "fileId": file.id.0,
                    "fileName": file.original_name,
                    "sizeBytes": file.size_bytes,
                    "createdAt": file.uploaded_at.to_rfc3339(),
                })
            })
            .collect::<Vec<_>>();
        Ok(json!({ "count": listed.len(), "files": listed }))
    }
}

fn strategy_advice(arguments: &Map<String, Value>, session: &Session) -> Result<Value, ToolError> {
    let topic = required_str(arguments, "topic")?;
    Ok(json!({
        "topic": topic,
        "hasPricingContext": session.pricing_context().is_some(),
        "instructions": "No external data was fetched. Answer from pricing-strategy expertise \
                         and ground any specifics in the active pricing context when present.",
    }))
}

fn analysis_request(arguments: &Map<String, Value>) -> Result<AnalysisRequest, ToolError> {
    let operation = required_str(arguments, "operation")?;
    let operation =
        AnalysisOperation::parse(operation).ok_or_else(|| ToolError::InvalidArgument {
            field: "operation",
            reason: format!("`{operation}` is not one of validate, optimal, subscriptions, filter"),
        })?;

    let solver = required_str(arguments, "solver")?;
    let solver = Solver::parse(solver).ok_or_else(|| ToolError::InvalidArgument {
        field: "solver",
        reason: format!("`{solver}` is not one of minizinc, choco"),
    })?;

    let objective = match optional_str(arguments, "objective")? {
        Some(value) => Some(Objective::parse(value).ok_or_else(|| ToolError::InvalidArgument {
            field: "objective",
            reason: format!("`{value}` is not one of minimize, maximize"),
        })?),
        None if operation == AnalysisOperation::Optimal => {
            return Err(ToolError::MissingArgument("objective"))
        }
        None => None,
    };

    let filters = match arguments.get("filters") {
        Some(Value::Object(filters)) => {
            validate_filters(filters)?;
            Some(Value::Object(filters.clone()))
        }
        Some(Value::Null) | None if operation == AnalysisOperation::Filter => {
            return Err(ToolError::MissingArgument("filters"))
        }
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(ToolError::InvalidArgument {
                field: "filters",
                reason: "must be an object".to_string(),
            })
        }
    };

    Ok(AnalysisRequest { operation, solver, filters, objective })
}

fn validate_filters(filters: &Map<String, Value>) -> Result<(), ToolError> {
    for field in ["minPrice", "maxPrice"] {
        if filters.get(field).is_some_and(|value| !value.is_number() && !value.is_null()) {
            return Err(ToolError::InvalidArgument {
                field: "filters",
                reason: format!("`{field}` must be a number"),
            });
        }
    }
    for field in ["features", "usageLimits"] {
        if filters.get(field).is_some_and(|value| !value.is_array() && !value.is_null()) {
            return Err(ToolError::InvalidArgument {
                field: "filters",
                reason: format!("`{field}` must be an array"),
            });
        }
    }
    Ok(())
}

fn transformation_request(
    arguments: &Map<String, Value>,
) -> Result<TransformationRequest, ToolError> {
    let url = required_str(arguments, "url")?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ToolError::InvalidArgument {
            field: "url",
            reason: "must be an http:// or https:// address".to_string(),
        });
    }

    let model = optional_str(arguments, "model")?.map(ToString::to_string);
    let max_tries = match arguments.get("max_tries") {
        None | Some(Value::Null) => None,
        Some(value) => {
            // Models sometimes send integral numbers as floats.
            let tries = value
                .as_u64()
                .or_else(|| value.as_f64().filter(|v| v.fract() == 0.0 && *v > 0.0).map(|v| v as u64))
                .filter(|tries| *tries > 0)
                .and_then(|tries| u32::try_from(tries).ok())
                .ok_or_else(|| ToolError::InvalidArgument {
                    field: "max_tries",
                    reason: "must be a positive integer".to_string(),
                })?;
            Some(tries)
        }
    };

    Ok(TransformationRequest { url: url.to_string(), model, max_tries })
}

fn output_name(task_id: &JobId) -> String {
    format!("pricing-{task_id}.yaml")
}

fn required_str<'a>(
    arguments: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ToolError> {
    optional_str(arguments, field)?.ok_or(ToolError::MissingArgument(field))
}

fn optional_str<'a>(
    arguments: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ToolError> {
    match arguments.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.trim())),
        Some(_) => {
            Err(ToolError::InvalidArgument { field, reason: "must be a string".to_string() })
        }
    }
}
