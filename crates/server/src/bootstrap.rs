use std::sync::Arc;

use pricewise_agent::collaborators::{CollaboratorError, HttpAnalysisService, HttpTransformationService};
use pricewise_agent::conversation::{TurnEngine, TurnError};
use pricewise_agent::llm::{GeminiModelClient, ModelError};
use pricewise_agent::runtime::AgentRuntime;
use pricewise_agent::tools::{ContextAdoption, ToolDispatcher};
use pricewise_core::config::{AppConfig, ConfigError};
use pricewise_store::file_store::{FileStore, FileStoreError, LocalFileStore};
use pricewise_store::sessions::SessionStore;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub files: Arc<LocalFileStore>,
    pub store: Arc<SessionStore>,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage initialization failed: {0}")]
    Storage(#[from] FileStoreError),
    #[error("model client initialization failed: {0}")]
    Model(#[from] ModelError),
    #[error("collaborator client initialization failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("turn engine initialization failed: {0}")]
    Turn(#[from] TurnError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let files = Arc::new(LocalFileStore::open(&config.storage.root).await?);
    files.health_check().await?;
    let swept = files.sweep(config.storage.stale_file_hours).await?;
    info!(
        event_name = "system.bootstrap.storage_ready",
        correlation_id = "bootstrap",
        root = %config.storage.root.display(),
        stale_files_removed = swept,
        "file storage ready"
    );

    let store = Arc::new(SessionStore::new(files.clone()));
    let dispatcher = ToolDispatcher::new(
        store.clone(),
        Arc::new(HttpAnalysisService::new(&config.services)?),
        Arc::new(HttpTransformationService::new(&config.services)?),
        ContextAdoption::from_config(&config.sessions),
    );
    let model = Arc::new(GeminiModelClient::new(&config.llm)?);
    let engine = TurnEngine::new(model, dispatcher)?;
    let runtime = Arc::new(AgentRuntime::new(store.clone(), engine));

    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        model = %config.llm.model,
        tools = pricewise_agent::tools::catalogue().len(),
        "agent runtime initialized"
    );

    Ok(Application { config, files, store, runtime })
}
