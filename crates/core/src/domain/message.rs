use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self { name: name.into(), arguments }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: Value },
    Failure { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), outcome: ToolOutcome::Success { payload } }
    }

    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), outcome: ToolOutcome::Failure { message: message.into() } }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Body handed back to the model as the function response.
    pub fn response_body(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success { payload } => {
                serde_json::json!({ "success": true, "data": payload })
            }
            ToolOutcome::Failure { message } => {
                serde_json::json!({ "success": false, "error": message })
            }
        }
    }
}

/// One part of a message. Each variant carries exactly one payload kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall { request: ToolCallRequest },
    ToolResult { result: ToolCallResult },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn model_tool_call(preface: Option<String>, request: ToolCallRequest) -> Self {
        let mut parts = Vec::with_capacity(2);
        if let Some(text) = preface.filter(|text| !text.trim().is_empty()) {
            parts.push(MessagePart::Text { text });
        }
        parts.push(MessagePart::ToolCall { request });
        Self::new(Role::Model, parts)
    }

    pub fn tool_result(result: ToolCallResult) -> Self {
        Self::new(Role::Tool, vec![MessagePart::ToolResult { result }])
    }

    fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self { role, parts, created_at: Utc::now() }
    }

    pub fn text(&self) -> Option<String> {
        let texts = self
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        (!texts.is_empty()).then(|| texts.join("\n"))
    }

    pub fn tool_call(&self) -> Option<&ToolCallRequest> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::ToolCall { request } => Some(request),
            _ => None,
        })
    }

    pub fn tool_result_part(&self) -> Option<&ToolCallResult> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::ToolResult { result } => Some(result),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{Message, MessagePart, Role, ToolCallRequest, ToolCallResult};

    #[test]
    fn tool_call_message_keeps_preface_before_request() {
        let request = ToolCallRequest::new("getPricingSummary", Map::new());
        let message = Message::model_tool_call(Some("Let me check.".to_string()), request.clone());

        assert_eq!(message.role, Role::Model);
        assert_eq!(message.parts.len(), 2);
        assert!(matches!(message.parts[0], MessagePart::Text { .. }));
        assert_eq!(message.tool_call(), Some(&request));
    }

    #[test]
    fn blank_preface_is_dropped() {
        let message = Message::model_tool_call(
            Some("   ".to_string()),
            ToolCallRequest::new("getPricingSummary", Map::new()),
        );
        assert_eq!(message.parts.len(), 1);
        assert!(message.text().is_none());
    }

    #[test]
    fn parts_serialize_with_type_tag() {
        let message = Message::tool_result(ToolCallResult::failure("x", "boom"));
        let value = serde_json::to_value(&message).expect("serialize");

        assert_eq!(value["role"], "tool");
        assert_eq!(value["parts"][0]["type"], "tool_result");
        assert_eq!(value["parts"][0]["result"]["outcome"]["kind"], "failure");
    }

    #[test]
    fn response_body_wraps_outcome() {
        let ok = ToolCallResult::success("t", json!({"plans": 3}));
        assert_eq!(ok.response_body(), json!({"success": true, "data": {"plans": 3}}));

        let failed = ToolCallResult::failure("t", "missing field");
        assert_eq!(failed.response_body(), json!({"success": false, "error": "missing field"}));
    }
}
