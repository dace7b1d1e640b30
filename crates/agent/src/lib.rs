//! Conversation engine for pricing-analysis chat.
//!
//! A turn sends the session history, the tool catalogue and a per-session system preamble to the
//! model. If the model asks for a tool, the dispatcher runs it once and the model is asked again
//! with the result. Errors inside tools become failure results the model can explain; only model
//! failures abort a turn.
//!
//! - `llm`: the stateless `ModelClient` seam and the Gemini adapter
//! - `collaborators`: HTTP clients for the analysis and transformation services
//! - `tools`: the fixed catalogue and `ToolDispatcher`
//! - `conversation`: the turn state table and `TurnEngine`
//! - `runtime`: `AgentRuntime`, which locks a session and runs one turn

pub mod collaborators;
pub mod conversation;
pub mod llm;
pub mod runtime;
pub mod tools;

pub use conversation::{TurnEngine, TurnError, TurnOutcome};
pub use llm::{GeminiModelClient, ModelClient, ModelError};
pub use runtime::{AgentRuntime, MessageReply, RuntimeError, Upload};
pub use tools::{ContextAdoption, ToolDispatcher};
