use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Messages-dialect request. Optional fields the upstream understands but
/// this gateway does not inspect ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MessagesRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    }

    pub fn has_thinking(&self) -> bool {
        match &self.thinking {
            None | Some(Value::Null) => false,
            Some(Value::Object(obj)) => obj
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| t != "disabled")
                .unwrap_or(true),
            Some(_) => true,
        }
    }

    /// System prompt flattened to plain text (the field accepts a string or
    /// an array of text blocks).
    pub fn system_text(&self) -> String {
        match &self.system {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// All textual content joined with newlines; used by the classifier.
    pub fn flatten_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One content part. Known shapes get typed variants; anything else is
/// carried through opaquely so the upstream still sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Block(ContentBlock),
    Opaque(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<Value>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Block(ContentBlock::Text { text: text.into() })
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value) -> Self {
        ContentPart::Block(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: None,
        })
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            ContentPart::Block(ContentBlock::Text { text }) => Some(text.clone()),
            ContentPart::Block(ContentBlock::ToolResult { content, .. }) => match content {
                Value::String(s) => Some(s.clone()),
                _ => None,
            },
            ContentPart::Block(ContentBlock::Image { .. }) => None,
            ContentPart::Opaque(value) => value
                .get("text")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_round_trips() {
        let raw = serde_json::json!({
            "role": "user",
            "content": "hello"
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(&message.content, MessageContent::Text(s) if s == "hello"));
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn tagged_parts_deserialize_into_blocks() {
        let raw = serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look at this"},
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"},
                {"type": "server_tool_use", "name": "search"}
            ]
        });
        let message: Message = serde_json::from_value(raw).unwrap();
        let MessageContent::Parts(parts) = &message.content else {
            panic!("expected parts");
        };
        assert!(matches!(
            parts[0],
            ContentPart::Block(ContentBlock::Text { .. })
        ));
        assert!(matches!(
            parts[1],
            ContentPart::Block(ContentBlock::ToolResult { .. })
        ));
        // Unknown part shapes survive untouched.
        assert!(matches!(parts[2], ContentPart::Opaque(_)));
    }

    #[test]
    fn unknown_request_fields_are_preserved() {
        let raw = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "metadata": {"user_id": "u-1"}
        });
        let request: MessagesRequest = serde_json::from_value(raw).unwrap();
        assert!(request.extra.contains_key("metadata"));
        let out = serde_json::to_value(&request).unwrap();
        assert_eq!(out["metadata"]["user_id"], "u-1");
    }

    #[test]
    fn system_text_handles_both_shapes() {
        let mut request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [],
            "system": "be brief"
        }))
        .unwrap();
        assert_eq!(request.system_text(), "be brief");

        request.system = Some(serde_json::json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]));
        assert_eq!(request.system_text(), "a\nb");
    }

    #[test]
    fn thinking_disabled_counts_as_absent() {
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [],
            "thinking": {"type": "disabled"}
        }))
        .unwrap();
        assert!(!request.has_thinking());

        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [],
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        }))
        .unwrap();
        assert!(request.has_thinking());
    }
}
