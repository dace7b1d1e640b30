//! One conversational turn: user text in, final model text out, with at most one tool hop.
//!
//! The turn walks a fixed state table. Messages produced along the way are buffered and
//! committed to the session log only once the turn has answered, so the log only ever grows by
//! `[user, model(text)]` or `[user, model(call), tool(result), model(text)]`.

use std::sync::Arc;

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{info, warn};

use pricewise_core::domain::message::{Message, ToolCallRequest};
use pricewise_core::domain::session::{PricingContext, Session};
use pricewise_core::errors::ApplicationError;

use crate::llm::{ModelClient, ModelError, ModelReply, ModelRequest, ModelResponse, ToolDeclaration, Usage};
use crate::tools::ToolDispatcher;

pub const FALLBACK_REPLY: &str =
    "Sorry, I could not produce an answer for that request. Please try rephrasing it.";

pub const UNEXECUTED_TOOL_NOTE: &str =
    "I need another tool call to finish this. Ask me to continue and I will run it.";

const PREAMBLE_TEMPLATE_NAME: &str = "preamble.txt";

const PREAMBLE_TEMPLATE: &str = r#"You are Pricewise, an analyst for SaaS pricing models written in the Pricing2Yaml format.
Use the tools ({{ tool_names }}) when the user asks for facts about a pricing file, an analysis job or a pricing page.
Request at most one tool per reply.
Pricing analysis jobs and page transformations run asynchronously; report their ids and offer to check on them.
{% if has_context %}
The active pricing document is `{{ file_name }}` with file id `{{ file_id }}`. Use that id as pricingFileId unless the user names another file.
--- BEGIN {{ file_name }} ---
{{ content }}
--- END {{ file_name }} ---
{% else %}
No pricing document is active in this conversation. When a tool needs a pricingFileId, ask the user to upload a file or transform a pricing page first.
{% endif %}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnState {
    Received,
    ModelFirstPass,
    DirectAnswer,
    ToolRequested,
    ToolExecuting,
    ToolResultReady,
    ModelSecondPass,
    Answered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnEvent {
    ModelInvoked,
    TextReturned,
    ToolCallReturned,
    DispatchStarted,
    ResultRecorded,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnTransition {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid turn transition from {state:?} using event {event:?}")]
pub struct TurnTransitionError {
    pub state: TurnState,
    pub event: TurnEvent,
}

pub fn transition(
    current: TurnState,
    event: TurnEvent,
) -> Result<TurnTransition, TurnTransitionError> {
    use TurnEvent::{
        DispatchStarted, Finished, ModelInvoked, ResultRecorded, TextReturned, ToolCallReturned,
    };
    use TurnState::{
        Answered, DirectAnswer, ModelFirstPass, ModelSecondPass, Received, ToolExecuting,
        ToolRequested, ToolResultReady,
    };

    let to = match (current, event) {
        (Received, ModelInvoked) => ModelFirstPass,
        (ModelFirstPass, TextReturned) => DirectAnswer,
        (ModelFirstPass, ToolCallReturned) => ToolRequested,
        (ToolRequested, DispatchStarted) => ToolExecuting,
        (ToolExecuting, ResultRecorded) => ToolResultReady,
        (ToolResultReady, ModelInvoked) => ModelSecondPass,
        (DirectAnswer, Finished) | (ModelSecondPass, Finished) => Answered,
        _ => return Err(TurnTransitionError { state: current, event }),
    };

    Ok(TurnTransition { from: current, to, event })
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Transition(#[from] TurnTransitionError),
    #[error("system preamble could not be rendered: {0}")]
    Preamble(String),
}

impl From<TurnError> for ApplicationError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::Model(error) => error.into(),
            TurnError::Transition(error) => Self::Protocol(error.to_string()),
            TurnError::Preamble(message) => Self::Protocol(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub text: String,
    pub tool_used: Option<String>,
    pub unexecuted_tool_call: Option<ToolCallRequest>,
    pub usage: Usage,
}

/// Per-session system instruction, rebuilt from the session's pricing context on every call.
pub struct SystemPreamble {
    tera: Tera,
}

impl SystemPreamble {
    pub fn new() -> Result<Self, TurnError> {
        let mut tera = Tera::default();
        tera.add_raw_template(PREAMBLE_TEMPLATE_NAME, PREAMBLE_TEMPLATE)
            .map_err(|error| TurnError::Preamble(error.to_string()))?;
        Ok(Self { tera })
    }

    pub fn render(
        &self,
        pricing_context: Option<&PricingContext>,
        tools: &[ToolDeclaration],
    ) -> Result<String, TurnError> {
        let tool_names = tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>().join(", ");

        let mut context = Context::new();
        context.insert("tool_names", &tool_names);
        context.insert("has_context", &pricing_context.is_some());
        if let Some(pricing) = pricing_context {
            context.insert("file_name", &pricing.file_name);
            context.insert("file_id", &pricing.file_id.0);
            context.insert("content", &pricing.content);
        }

        self.tera
            .render(PREAMBLE_TEMPLATE_NAME, &context)
            .map(|rendered| rendered.trim().to_string())
            .map_err(|error| TurnError::Preamble(error.to_string()))
    }
}

struct Turn {
    state: TurnState,
}

impl Turn {
    fn new() -> Self {
        Self { state: TurnState::Received }
    }

    fn apply(&mut self, event: TurnEvent) -> Result<TurnTransition, TurnTransitionError> {
        let outcome = transition(self.state, event)?;
        self.state = outcome.to;
        Ok(outcome)
    }
}

pub struct TurnEngine {
    model: Arc<dyn ModelClient>,
    dispatcher: ToolDispatcher,
    preamble: SystemPreamble,
    tools: Vec<ToolDeclaration>,
}

impl TurnEngine {
    pub fn new(model: Arc<dyn ModelClient>, dispatcher: ToolDispatcher) -> Result<Self, TurnError> {
        let tools = dispatcher.catalogue();
        Ok(Self { model, dispatcher, preamble: SystemPreamble::new()?, tools })
    }

    pub fn tools(&self) -> &[ToolDeclaration] {
        &self.tools
    }

    /// Runs one turn against a session the caller has locked.
    ///
    /// On a model failure nothing is committed to the log. Tool side effects already applied to
    /// the session (recorded jobs, stored files) stay.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
        correlation_id: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let mut turn = Turn::new();
        let mut history = session.messages().to_vec();
        let committed = history.len();
        let mut usage = Usage::default();
        session.touch();
        history.push(Message::user_text(user_text));

        info!(
            event_name = "turn.started",
            session_id = %session.id,
            correlation_id,
            has_context = session.pricing_context().is_some(),
            "turn started"
        );

        turn.apply(TurnEvent::ModelInvoked)?;
        let first = self.call_model(session, &history, correlation_id).await?;
        usage.add(first.usage);

        let request = match first.reply {
            ModelReply::Text(text) => {
                turn.apply(TurnEvent::TextReturned)?;
                history.push(Message::model_text(non_empty_or_fallback(text)));
                turn.apply(TurnEvent::Finished)?;
                return Ok(self.commit(session, history, committed, None, None, usage, correlation_id));
            }
            ModelReply::ToolCall { preface, request } => {
                turn.apply(TurnEvent::ToolCallReturned)?;
                history.push(Message::model_tool_call(preface, request.clone()));
                request
            }
        };

        info!(
            event_name = "turn.tool_requested",
            session_id = %session.id,
            correlation_id,
            tool = %request.name,
            "model requested a tool"
        );
        turn.apply(TurnEvent::DispatchStarted)?;
        let result = self.dispatcher.execute(&request, session).await;
        turn.apply(TurnEvent::ResultRecorded)?;
        history.push(Message::tool_result(result));

        turn.apply(TurnEvent::ModelInvoked)?;
        let second = self.call_model(session, &history, correlation_id).await?;
        usage.add(second.usage);

        let (text, unexecuted) = match second.reply {
            ModelReply::Text(text) => (non_empty_or_fallback(text), None),
            ModelReply::ToolCall { preface, request: chained } => {
                warn!(
                    event_name = "turn.chained_tool_call_deferred",
                    session_id = %session.id,
                    correlation_id,
                    tool = %chained.name,
                    "second tool call left unexecuted"
                );
                let text = preface
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| UNEXECUTED_TOOL_NOTE.to_string());
                (text, Some(chained))
            }
        };
        history.push(Message::model_text(text));
        turn.apply(TurnEvent::Finished)?;

        Ok(self.commit(
            session,
            history,
            committed,
            Some(request.name),
            unexecuted,
            usage,
            correlation_id,
        ))
    }

    /// One model pass. Malformed output degrades to text; any other failure aborts the turn.
    async fn call_model(
        &self,
        session: &Session,
        history: &[Message],
        correlation_id: &str,
    ) -> Result<ModelResponse, TurnError> {
        let preamble = self.preamble.render(session.pricing_context(), &self.tools)?;
        let request = ModelRequest { preamble: &preamble, history, tools: &self.tools };

        match self.model.generate(request).await {
            Ok(response) => Ok(response),
            Err(ModelError::Protocol { detail, text }) => {
                warn!(
                    event_name = "turn.malformed_model_output",
                    session_id = %session.id,
                    correlation_id,
                    detail = %detail,
                    "treating malformed model output as text"
                );
                let text = text.unwrap_or_else(|| FALLBACK_REPLY.to_string());
                Ok(ModelResponse { reply: ModelReply::Text(text), usage: Usage::default() })
            }
            Err(error) => {
                warn!(
                    event_name = "turn.aborted",
                    session_id = %session.id,
                    correlation_id,
                    error = %error,
                    "model call failed; turn discarded"
                );
                Err(error.into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        session: &mut Session,
        mut history: Vec<Message>,
        committed: usize,
        tool_used: Option<String>,
        unexecuted_tool_call: Option<ToolCallRequest>,
        usage: Usage,
        correlation_id: &str,
    ) -> TurnOutcome {
        let text = history.last().and_then(Message::text).unwrap_or_default();
        let appended = history.len() - committed;
        session.commit_messages(history.drain(committed..));
        session.touch();

        info!(
            event_name = "turn.completed",
            session_id = %session.id,
            correlation_id,
            messages_appended = appended,
            tool = tool_used.as_deref().unwrap_or("none"),
            total_tokens = usage.total_tokens,
            "turn answered"
        );

        TurnOutcome { text, tool_used, unexecuted_tool_call, usage }
    }
}

fn non_empty_or_fallback(text: String) -> String {
    if text.trim().is_empty() {
        FALLBACK_REPLY.to_string()
    } else {
        text
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use pricewise_core::domain::file::FileId;
    use pricewise_core::domain::job::JobId;
    use pricewise_core::domain::message::{MessagePart, Role};
    use pricewise_core::domain::session::{PricingContext, Session};
    use pricewise_store::file_store::LocalFileStore;
    use pricewise_store::sessions::SessionStore;

    use super::scripted::{text, tool_call, ScriptedModel};
    use super::{
        transition, SystemPreamble, TurnEngine, TurnEvent, TurnState, FALLBACK_REPLY,
        UNEXECUTED_TOOL_NOTE,
    };
    use crate::llm::ModelError;
    use crate::tools::fakes::{FakeAnalysis, FakeTransformation};
    use crate::tools::{catalogue, ContextAdoption, ToolDispatcher};

    async fn engine_with(model: Arc<ScriptedModel>) -> (TempDir, TurnEngine, Session) {
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
        let session = store.create().await;
        (dir, engine, session)
    }

    fn roles(session: &Session) -> Vec<Role> {
        session.messages().iter().map(|message| message.role).collect()
    }

    #[test]
    fn transition_table_accepts_both_paths_and_rejects_shortcuts() {
        let direct = [TurnEvent::ModelInvoked, TurnEvent::TextReturned, TurnEvent::Finished];
        let hop = [
            TurnEvent::ModelInvoked,
            TurnEvent::ToolCallReturned,
            TurnEvent::DispatchStarted,
            TurnEvent::ResultRecorded,
            TurnEvent::ModelInvoked,
            TurnEvent::Finished,
        ];
        for path in [&direct[..], &hop[..]] {
            let end = path.iter().try_fold(TurnState::Received, |state, event| {
                transition(state, *event).map(|outcome| outcome.to)
            });
            assert_eq!(end, Ok(TurnState::Answered));
        }

        let error = transition(TurnState::Received, TurnEvent::DispatchStarted).expect_err("skip");
        assert_eq!(error.state, TurnState::Received);
        assert!(transition(TurnState::ModelSecondPass, TurnEvent::ToolCallReturned).is_err());
        assert!(transition(TurnState::Answered, TurnEvent::ModelInvoked).is_err());
    }

    #[test]
    fn preamble_embeds_context_only_when_set() {
        let preamble = SystemPreamble::new().expect("template");
        let tools = catalogue();

        let bare = preamble.render(None, &tools).expect("render");
        assert!(bare.contains("No pricing document is active"));
        assert!(bare.contains("getPricingSummary"));
        assert!(!bare.contains("BEGIN"));

        let context = PricingContext {
            content: "saasName: Acme\nplans: {}".to_string(),
            file_name: "acme.yaml".to_string(),
            file_id: FileId("upload_1".to_string()),
        };
        let full = preamble.render(Some(&context), &tools).expect("render");
        assert!(full.contains("--- BEGIN acme.yaml ---"));
        assert!(full.contains("saasName: Acme"));
        assert!(full.contains("upload_1"));
        assert!(!full.contains("No pricing document is active"));
    }

    #[tokio::test]
    async fn direct_answer_appends_user_and_model_text() {
        let model = Arc::new(ScriptedModel::new(vec![text("Freemium works when...")]));
        let (_dir, engine, mut session) = engine_with(model.clone()).await;

        let outcome = engine.run_turn(&mut session, "what is freemium?", "req-1").await.expect("turn");

        assert_eq!(outcome.text, "Freemium works when...");
        assert_eq!(outcome.tool_used, None);
        assert_eq!(outcome.usage.total_tokens, 15);
        assert_eq!(roles(&session), vec![Role::User, Role::Model]);
        assert_eq!(*model.history_lengths.lock().expect("lock"), vec![1]);
    }

    #[tokio::test]
    async fn tool_hop_appends_four_messages_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("getPricingStrategyAdvice", json!({"topic": "tiers"})),
            text("Use three tiers."),
        ]));
        let (_dir, engine, mut session) = engine_with(model.clone()).await;

        let outcome = engine.run_turn(&mut session, "how many tiers?", "req-2").await.expect("turn");

        assert_eq!(outcome.text, "Use three tiers.");
        assert_eq!(outcome.tool_used.as_deref(), Some("getPricingStrategyAdvice"));
        assert_eq!(outcome.usage.total_tokens, 27);
        assert_eq!(roles(&session), vec![Role::User, Role::Model, Role::Tool, Role::Model]);
        assert!(matches!(session.messages()[1].parts[0], MessagePart::ToolCall { .. }));
        assert!(session.messages()[2].tool_result_part().is_some_and(|result| result.is_success()));
        assert_eq!(*model.history_lengths.lock().expect("lock"), vec![1, 3]);
    }

    #[tokio::test]
    async fn second_tool_request_is_surfaced_not_executed() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("getPricingStrategyAdvice", json!({"topic": "tiers"})),
            tool_call("initiatePricingPageTransformation", json!({"url": "https://acme.io"})),
        ]));
        let (_dir, engine, mut session) = engine_with(model).await;

        let outcome = engine.run_turn(&mut session, "compare with acme", "req-3").await.expect("turn");

        let deferred = outcome.unexecuted_tool_call.expect("deferred call");
        assert_eq!(deferred.name, "initiatePricingPageTransformation");
        assert_eq!(outcome.text, UNEXECUTED_TOOL_NOTE);
        assert_eq!(roles(&session), vec![Role::User, Role::Model, Role::Tool, Role::Model]);
        assert_eq!(session.jobs().count(), 0);
    }

    #[tokio::test]
    async fn model_failure_commits_nothing_but_keeps_tool_side_effects() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("initiatePricingPageTransformation", json!({"url": "https://acme.io"})),
            Err(ModelError::Timeout),
        ]));
        let (_dir, engine, mut session) = engine_with(model).await;

        let error = engine.run_turn(&mut session, "transform acme", "req-4").await.expect_err("abort");

        assert!(matches!(error, super::TurnError::Model(ModelError::Timeout)));
        assert!(session.messages().is_empty());
        assert!(session.job(&JobId("task-1".to_string())).is_some());
    }

    #[tokio::test]
    async fn malformed_output_uses_its_text_or_the_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Protocol { detail: "no candidates".to_string(), text: None }),
            Err(ModelError::Protocol {
                detail: "function call without name".to_string(),
                text: Some("Partial answer".to_string()),
            }),
        ]));
        let (_dir, engine, mut session) = engine_with(model).await;

        let first = engine.run_turn(&mut session, "hello", "req-5").await.expect("turn");
        assert_eq!(first.text, FALLBACK_REPLY);
        let second = engine.run_turn(&mut session, "again", "req-6").await.expect("turn");
        assert_eq!(second.text, "Partial answer");
        assert_eq!(roles(&session), vec![Role::User, Role::Model, Role::User, Role::Model]);
    }

    #[tokio::test]
    async fn each_pass_sees_the_current_pricing_context() {
        let model = Arc::new(ScriptedModel::new(vec![text("ok")]));
        let (_dir, engine, mut session) = engine_with(model.clone()).await;
        session.set_pricing_context(PricingContext {
            content: "saasName: Zed".to_string(),
            file_name: "zed.yaml".to_string(),
            file_id: FileId("upload_z".to_string()),
        });

        engine.run_turn(&mut session, "summarize", "req-7").await.expect("turn");

        let preambles = model.preambles.lock().expect("lock");
        assert!(preambles[0].contains("saasName: Zed"));
    }
}
