//! Generative model seam and the Gemini `generateContent` adapter.
//!
//! A model call is stateless: history, tool catalogue and system preamble are all explicit
//! arguments, so nothing configured for one session can reach another.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use pricewise_core::config::LlmConfig;
use pricewise_core::domain::message::{Message, MessagePart, Role, ToolCallRequest};
use pricewise_core::errors::ApplicationError;

/// Function declaration offered to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// `Null` for tools without arguments; Gemini rejects empty object schemas.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelRequest<'a> {
    pub preamble: &'a str,
    pub history: &'a [Message],
    pub tools: &'a [ToolDeclaration],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub response_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.response_tokens += other.response_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelReply {
    Text(String),
    ToolCall { preface: Option<String>, request: ToolCallRequest },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub reply: ModelReply,
    pub usage: Usage,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("model request timed out")]
    Timeout,
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// The response arrived but could not be read as text or a tool call.
    #[error("malformed model output: {detail}")]
    Protocol { detail: String, text: Option<String> },
}

impl From<ModelError> for ApplicationError {
    fn from(value: ModelError) -> Self {
        match value {
            ModelError::Protocol { detail, .. } => Self::Protocol(detail),
            other => Self::Collaborator { service: "model".to_string(), message: other.to_string() },
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError>;
}

pub struct GeminiModelClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl GeminiModelClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ModelError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl ModelClient for GeminiModelClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let body = GenerateContentRequest::from_request(&request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read Gemini error body".to_string());
            return Err(map_http_error(status, &body_text));
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Protocol { detail: format!("unreadable response: {error}"), text: None }
            }
        })?;

        parse_response(parsed)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup>,
}

impl GenerateContentRequest {
    fn from_request(request: &ModelRequest<'_>) -> Self {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolGroup { function_declarations: request.tools.to_vec() }]
        };

        Self {
            contents: request.history.iter().filter_map(Content::from_message).collect(),
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(request.preamble.to_string())],
            },
            tools,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

impl Content {
    fn from_message(message: &Message) -> Option<Self> {
        // Gemini only knows `user` and `model`; function responses travel as user turns.
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Model => "model",
        };
        let parts = message
            .parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => Part::text(text.clone()),
                MessagePart::ToolCall { request } => Part {
                    function_call: Some(FunctionCall {
                        name: Some(request.name.clone()),
                        args: Some(Value::Object(request.arguments.clone())),
                    }),
                    ..Part::default()
                },
                MessagePart::ToolResult { result } => Part {
                    function_response: Some(FunctionResponse {
                        name: result.name.clone(),
                        response: result.response_body(),
                    }),
                    ..Part::default()
                },
            })
            .collect::<Vec<_>>();

        (!parts.is_empty()).then_some(Self { role: Some(role), parts })
    }
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self { text: Some(text), ..Self::default() }
    }
}

#[derive(Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

fn parse_response(response: GenerateContentResponse) -> Result<ModelResponse, ModelError> {
    let usage = response
        .usage_metadata
        .map(|meta| Usage {
            prompt_tokens: meta.prompt_token_count,
            response_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        })
        .unwrap_or_default();

    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .ok_or_else(|| ModelError::Protocol {
            detail: "response has no candidates".to_string(),
            text: None,
        })?;

    let text = parts.iter().filter_map(|part| part.text.as_deref()).collect::<String>();
    let text = (!text.trim().is_empty()).then_some(text);

    let Some(call) = parts.into_iter().find_map(|part| part.function_call) else {
        return match text {
            Some(text) => Ok(ModelResponse { reply: ModelReply::Text(text), usage }),
            None => Err(ModelError::Protocol {
                detail: "response has neither text nor a function call".to_string(),
                text: None,
            }),
        };
    };

    let name = call.name.filter(|name| !name.trim().is_empty()).ok_or_else(|| {
        ModelError::Protocol { detail: "function call without a name".to_string(), text: text.clone() }
    })?;
    let arguments = match call.args {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments,
        Some(_) => {
            return Err(ModelError::Protocol {
                detail: format!("arguments for `{name}` are not an object"),
                text,
            })
        }
    };

    Ok(ModelResponse {
        reply: ModelReply::ToolCall { preface: text, request: ToolCallRequest::new(name, arguments) },
        usage,
    })
}

fn map_http_error(status: StatusCode, body: &str) -> ModelError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|wrapper| {
            let status_text = wrapper.error.status.unwrap_or_default();
            let message = wrapper.error.message.unwrap_or_else(|| body.to_string());
            if status_text.is_empty() {
                message
            } else {
                format!("{status_text}: {message}")
            }
        })
        .unwrap_or_else(|_| body.to_string());

    ModelError::Http { status: status.as_u16(), message }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use pricewise_core::config::AppConfig;
    use pricewise_core::domain::message::{Message, ToolCallRequest, ToolCallResult};

    use super::{
        parse_response, GeminiModelClient, GenerateContentRequest, GenerateContentResponse,
        ModelClient, ModelError, ModelReply, ModelRequest, ToolDeclaration,
    };

    fn parse(value: serde_json::Value) -> Result<super::ModelResponse, ModelError> {
        let response: GenerateContentResponse = serde_json::from_value(value).expect("decode");
        parse_response(response)
    }

    fn client_for(server: &MockServer) -> GeminiModelClient {
        let mut config = AppConfig::default().llm;
        config.api_key = "test-key".to_string().into();
        config.base_url = server.uri();
        config.timeout_secs = 5;
        GeminiModelClient::new(&config).expect("client")
    }

    #[test]
    fn text_reply_carries_usage() {
        let response = parse(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello"}, {"text": " there"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15}
        }))
        .expect("parse");

        assert_eq!(response.reply, ModelReply::Text("Hello there".to_string()));
        assert_eq!(response.usage.prompt_tokens, 12);
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[test]
    fn function_call_becomes_tool_request_with_preface() {
        let response = parse(json!({
            "candidates": [{"content": {"parts": [
                {"text": "Checking the file."},
                {"functionCall": {"name": "getPricingSummary", "args": {"pricingFileId": "upload_1"}}}
            ]}}]
        }))
        .expect("parse");

        let ModelReply::ToolCall { preface, request } = response.reply else {
            panic!("expected tool call");
        };
        assert_eq!(preface.as_deref(), Some("Checking the file."));
        assert_eq!(request.name, "getPricingSummary");
        assert_eq!(request.arguments["pricingFileId"], "upload_1");
    }

    #[test]
    fn nameless_or_non_object_calls_are_protocol_errors() {
        let nameless = parse(json!({
            "candidates": [{"content": {"parts": [{"text": "hm"}, {"functionCall": {"args": {}}}]}}]
        }));
        assert!(matches!(
            nameless,
            Err(ModelError::Protocol { text: Some(ref text), .. }) if text == "hm"
        ));

        let scalar_args = parse(json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "x", "args": 3}}]}}]
        }));
        assert!(matches!(scalar_args, Err(ModelError::Protocol { text: None, .. })));

        assert!(matches!(parse(json!({})), Err(ModelError::Protocol { .. })));
    }

    #[test]
    fn history_maps_roles_and_tool_traffic() {
        let history = vec![
            Message::user_text("summarize"),
            Message::model_tool_call(None, ToolCallRequest::new("getPricingSummary", Map::new())),
            Message::tool_result(ToolCallResult::success("getPricingSummary", json!({"plans": 2}))),
        ];
        let tools = vec![ToolDeclaration {
            name: "getPricingSummary".to_string(),
            description: "summary".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let body = GenerateContentRequest::from_request(&ModelRequest {
            preamble: "You are helpful.",
            history: &history,
            tools: &tools,
        });
        let value = serde_json::to_value(&body).expect("serialize");

        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "You are helpful.");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][1]["parts"][0]["functionCall"]["name"], "getPricingSummary");
        assert_eq!(value["contents"][2]["role"], "user");
        assert_eq!(
            value["contents"][2]["parts"][0]["functionResponse"]["response"]["data"]["plans"],
            2
        );
        assert_eq!(value["tools"][0]["functionDeclarations"][0]["name"], "getPricingSummary");
    }

    #[tokio::test]
    async fn client_posts_to_generate_content_with_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "pong"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![Message::user_text("ping")];
        let response = client_for(&server)
            .generate(ModelRequest { preamble: "p", history: &history, tools: &[] })
            .await
            .expect("generate");

        assert_eq!(response.reply, ModelReply::Text("pong".to_string()));
    }

    #[tokio::test]
    async fn http_errors_surface_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": {"code": 503, "message": "overloaded", "status": "UNAVAILABLE"}
            })))
            .mount(&server)
            .await;

        let history = vec![Message::user_text("ping")];
        let error = client_for(&server)
            .generate(ModelRequest { preamble: "p", history: &history, tools: &[] })
            .await
            .expect_err("should fail");

        assert_eq!(
            error,
            ModelError::Http { status: 503, message: "UNAVAILABLE: overloaded".to_string() }
        );
    }
}
