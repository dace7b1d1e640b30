use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use pricewise_core::domain::session::SessionId;
use pricewise_core::errors::ApplicationError;
use pricewise_store::sessions::{AttachOutcome, SessionStore, StoreError};

use crate::conversation::{TurnEngine, TurnError, TurnOutcome};

/// A file sent along with a chat message.
#[derive(Clone, Debug)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MessageReply {
    pub outcome: TurnOutcome,
    pub attachments: Vec<AttachOutcome>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Turn(#[from] TurnError),
}

impl From<RuntimeError> for ApplicationError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Validation(message) => Self::Validation(message),
            RuntimeError::Store(error) => error.into(),
            RuntimeError::Turn(error) => error.into(),
        }
    }
}

/// Entry point for chat traffic: locks the session for the whole turn.
pub struct AgentRuntime {
    store: Arc<SessionStore>,
    engine: TurnEngine,
}

impl AgentRuntime {
    pub fn new(store: Arc<SessionStore>, engine: TurnEngine) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn handle_message(
        &self,
        session_id: &SessionId,
        text: &str,
        uploads: Vec<Upload>,
        correlation_id: &str,
    ) -> Result<MessageReply, RuntimeError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RuntimeError::Validation("message must not be empty".to_string()));
        }

        let mut session = self.store.lock(session_id).await?;

        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            let outcome =
                self.store.attach_file_locked(&mut session, &upload.bytes, &upload.file_name).await?;
            attachments.push(outcome);
        }

        let annotated = if attachments.is_empty() {
            text.to_string()
        } else {
            let notes = attachments.iter().map(reference_note).collect::<Vec<_>>().join("\n");
            format!("{text}\n\n{notes}")
        };

        info!(
            event_name = "runtime.message_received",
            session_id = %session_id,
            correlation_id,
            attachments = attachments.len(),
            "handling chat message"
        );

        let outcome = self.engine.run_turn(&mut session, &annotated, correlation_id).await?;
        Ok(MessageReply { outcome, attachments })
    }
}

fn reference_note(attachment: &AttachOutcome) -> String {
    let file = &attachment.file;
    let mut note = format!("[Attached file `{}` with id `{}`", file.original_name, file.id);
    if attachment.context_adopted {
        note.push_str(", now the active pricing context");
    }
    if let Some(reason) = attachment.validation.reason.as_deref() {
        note.push_str(&format!(", failed validation: {reason}"));
    }
    note.push(']');
    note
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    use pricewise_core::domain::message::{Role, ToolCallRequest};
    use pricewise_core::domain::session::SessionId;
    use pricewise_core::errors::ApplicationError;
    use pricewise_store::file_store::LocalFileStore;
    use pricewise_store::sessions::SessionStore;

    use super::{AgentRuntime, RuntimeError, Upload};
    use crate::conversation::scripted::{text, ScriptedModel};
    use crate::conversation::TurnEngine;
    use crate::llm::{ModelClient, ModelError, ModelReply, ModelRequest, ModelResponse, Usage};
    use crate::tools::fakes::{FakeAnalysis, FakeTransformation};
    use crate::tools::{ContextAdoption, ToolDispatcher};

    const PRICING: &str = "saasName: Acme\nversion: '1.0'\ncurrency: USD\nplans:\n  BASIC:\n    price: 10\n";

    /// Asks for a summary of the active file, then reports the plan count it was given.
    struct SummarizingModel;

    #[async_trait]
    impl ModelClient for SummarizingModel {
        async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
            let last = request.history.last().expect("history");
            let reply = match last.tool_result_part() {
                Some(result) => {
                    let body = result.response_body();
                    ModelReply::Text(format!(
                        "Acme offers {} plans.",
                        body["data"]["summary"]["numberOfPlans"]
                    ))
                }
                None => {
                    let file_id = request
                        .preamble
                        .split("file id `")
                        .nth(1)
                        .and_then(|rest| rest.split('`').next())
                        .expect("active file id in preamble");
                    let mut arguments = Map::new();
                    arguments.insert("pricingFileId".to_string(), Value::String(file_id.to_string()));
                    ModelReply::ToolCall {
                        preface: None,
                        request: ToolCallRequest::new("getPricingSummary", arguments),
                    }
                }
            };
            Ok(ModelResponse { reply, usage: Usage::default() })
        }
    }

    async fn runtime_with(model: Arc<dyn ModelClient>) -> (TempDir, AgentRuntime) {
        let dir = TempDir::new().expect("tempdir");
        let files = Arc::new(LocalFileStore::open(dir.path()).await.expect("open"));
        let store = Arc::new(SessionStore::new(files));
        let dispatcher = ToolDispatcher::new(
            store.clone(),
            Arc::new(FakeAnalysis::default()),
            Arc::new(FakeTransformation::default()),
            ContextAdoption::Automatic,
        );
        let engine = TurnEngine::new(model, dispatcher).expect("engine");
        (dir, AgentRuntime::new(store, engine))
    }

    #[tokio::test]
    async fn uploaded_pricing_file_is_summarized_in_one_turn() {
        let (_dir, runtime) = runtime_with(Arc::new(SummarizingModel)).await;
        let session = runtime.store().create().await;

        let reply = runtime
            .handle_message(
                &session.id,
                "summarize this pricing",
                vec![Upload { file_name: "pricing.yaml".to_string(), bytes: PRICING.into() }],
                "req-1",
            )
            .await
            .expect("reply");

        assert!(reply.attachments[0].context_adopted);
        assert_eq!(reply.outcome.tool_used.as_deref(), Some("getPricingSummary"));
        assert_eq!(reply.outcome.text, "Acme offers 3 plans.");

        let messages = runtime.store().list_messages(&session.id).await.expect("messages");
        let roles = messages.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![Role::User, Role::Model, Role::Tool, Role::Model]);
        let user_text = messages[0].text().expect("user text");
        assert!(user_text.contains("pricing.yaml"));
        assert!(user_text.contains(&reply.attachments[0].file.id.0));
    }

    #[tokio::test]
    async fn blank_message_and_unknown_session_are_rejected() {
        let (_dir, runtime) =
            runtime_with(Arc::new(ScriptedModel::new(vec![text("hi")]))).await;
        let session = runtime.store().create().await;

        let blank = runtime.handle_message(&session.id, "   ", Vec::new(), "req-2").await;
        assert!(matches!(blank, Err(RuntimeError::Validation(_))));

        let missing = runtime
            .handle_message(&SessionId("nope".to_string()), "hello", Vec::new(), "req-3")
            .await
            .expect_err("missing session");
        assert!(matches!(ApplicationError::from(missing), ApplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unsupported_upload_is_a_validation_error() {
        let (_dir, runtime) =
            runtime_with(Arc::new(ScriptedModel::new(vec![text("hi")]))).await;
        let session = runtime.store().create().await;

        let error = runtime
            .handle_message(
                &session.id,
                "look at this",
                vec![Upload { file_name: "notes.txt".to_string(), bytes: b"hello".to_vec() }],
                "req-4",
            )
            .await
            .expect_err("unsupported");
        assert!(matches!(ApplicationError::from(error), ApplicationError::Validation(_)));
    }

    #[tokio::test]
    async fn model_outage_maps_to_collaborator_error() {
        let (_dir, runtime) = runtime_with(Arc::new(ScriptedModel::new(Vec::new()))).await;
        let session = runtime.store().create().await;

        let error =
            runtime.handle_message(&session.id, "hello", Vec::new(), "req-5").await.expect_err("down");
        assert!(matches!(ApplicationError::from(error), ApplicationError::Collaborator { .. }));
        assert!(runtime.store().list_messages(&session.id).await.expect("messages").is_empty());
    }
}
