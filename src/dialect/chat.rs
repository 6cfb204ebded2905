use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::DEFAULT_MAX_TOKENS;
use crate::dialect::messages::{ContentPart, Message, MessageContent, MessagesRequest};

/// A Chat-Completions request as clients send it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ChatMessage {
    /// tool_use_id precedence: tool_call_id, then id, then the literal
    /// "tool".
    fn tool_use_id(&self) -> String {
        self.tool_call_id
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| "tool".to_string())
    }
}

/// Normalize a Chat-Completions request into the internal Messages shape.
pub fn chat_to_messages(request: ChatCompletionsRequest) -> MessagesRequest {
    let messages = request
        .messages
        .iter()
        .map(|m| {
            let content = match &m.content {
                Value::String(text) => {
                    if m.role == "tool" {
                        MessageContent::Parts(vec![ContentPart::tool_result(
                            m.tool_use_id(),
                            Value::String(text.clone()),
                        )])
                    } else {
                        MessageContent::Text(text.clone())
                    }
                }
                Value::Array(parts) => {
                    MessageContent::Parts(parts.iter().map(|p| convert_part(m, p)).collect())
                }
                other => MessageContent::Text(
                    other.as_str().map(|s| s.to_string()).unwrap_or_default(),
                ),
            };
            // Tool messages become user-side tool results in the Messages
            // dialect.
            let role = if m.role == "tool" {
                "user".to_string()
            } else {
                m.role.clone()
            };
            Message {
                role,
                content,
                extra: serde_json::Map::new(),
            }
        })
        .collect();

    MessagesRequest {
        model: request.model,
        messages,
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        stream: request.stream,
        system: None,
        tools: request.tools,
        tool_choice: request.tool_choice,
        thinking: None,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        extra: serde_json::Map::new(),
    }
}

fn convert_part(message: &ChatMessage, part: &Value) -> ContentPart {
    let part_type = part.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match part_type {
        "text" => ContentPart::text(
            part.get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default(),
        ),
        "image_url" => {
            let url = part
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(|u| u.as_str())
                .unwrap_or("<unknown>");
            ContentPart::text(format!("[image: {}]", url))
        }
        "tool_result" => {
            let id = part
                .get("tool_call_id")
                .or_else(|| part.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| message.tool_use_id());
            let content = part
                .get("content")
                .cloned()
                .unwrap_or_else(|| part.get("text").cloned().unwrap_or(Value::Null));
            ContentPart::tool_result(id, content)
        }
        _ => ContentPart::text(
            part.get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default(),
        ),
    }
}

/// Pull assistant text out of an upstream Messages-style response body.
/// Accepts a `content` block array, a flat `output` string, or a nested
/// choices array.
pub fn extract_response_text(response: &Value) -> String {
    if let Some(blocks) = response.get("content").and_then(|c| c.as_array()) {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
    }
    if let Some(output) = response.get("output").and_then(|o| o.as_str()) {
        return output.to_string();
    }
    if let Some(choice_text) = response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
    {
        return choice_text.to_string();
    }
    String::new()
}

/// Wrap an upstream Messages response in a Chat-Completions envelope. The
/// echoed model is the *client's* declared model, never a downgraded one.
pub fn messages_response_to_chat(response: &Value, client_model: &str) -> Value {
    let text = extract_response_text(response);
    let id = response
        .get("id")
        .and_then(|i| i.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_completion_id);
    let finish_reason = response
        .get("stop_reason")
        .or_else(|| response.get("stop"))
        .and_then(|s| s.as_str())
        .map(map_finish_reason)
        .unwrap_or("stop");
    let usage = response
        .get("usage")
        .cloned()
        .map(normalize_usage)
        .unwrap_or_else(|| {
            json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0})
        });

    json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": client_model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": text
            },
            "finish_reason": finish_reason
        }],
        "usage": usage
    })
}

fn map_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

fn normalize_usage(usage: Value) -> Value {
    let input = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    json!({
        "prompt_tokens": input,
        "completion_tokens": output,
        "total_tokens": input + output
    })
}

fn generate_completion_id() -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("chatcmpl-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::messages::ContentBlock;

    fn request_with(messages: Value) -> ChatCompletionsRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": messages
        }))
        .unwrap()
    }

    #[test]
    fn string_content_passes_through() {
        let request = request_with(json!([{"role": "user", "content": "hello"}]));
        let normalized = chat_to_messages(request);
        assert_eq!(normalized.messages.len(), 1);
        assert_eq!(normalized.messages[0].role, "user");
        assert!(
            matches!(&normalized.messages[0].content, MessageContent::Text(s) if s == "hello")
        );
    }

    #[test]
    fn max_tokens_defaults_to_4096() {
        let request = request_with(json!([{"role": "user", "content": "x"}]));
        let normalized = chat_to_messages(request);
        assert_eq!(normalized.max_tokens, Some(4096));
    }

    #[test]
    fn image_parts_become_url_placeholders() {
        let request = request_with(json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://x/cat.png"}}
            ]
        }]));
        let normalized = chat_to_messages(request);
        let MessageContent::Parts(parts) = &normalized.messages[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts[1].as_text().unwrap(), "[image: https://x/cat.png]");
    }

    #[test]
    fn tool_use_id_prefers_tool_call_id_then_id_then_literal() {
        let request = request_with(json!([
            {"role": "tool", "tool_call_id": "call_1", "content": "ok"},
            {"role": "tool", "id": "msg_2", "content": "ok"},
            {"role": "tool", "content": "ok"}
        ]));
        let normalized = chat_to_messages(request);

        let ids: Vec<String> = normalized
            .messages
            .iter()
            .map(|m| {
                let MessageContent::Parts(parts) = &m.content else {
                    panic!("expected parts");
                };
                match &parts[0] {
                    ContentPart::Block(ContentBlock::ToolResult { tool_use_id, .. }) => {
                        tool_use_id.clone()
                    }
                    other => panic!("expected tool result, got {:?}", other),
                }
            })
            .collect();
        assert_eq!(ids, vec!["call_1", "msg_2", "tool"]);
        // Tool messages are re-rooted as user-side results.
        assert!(normalized.messages.iter().all(|m| m.role == "user"));
    }

    #[test]
    fn response_envelope_preserves_id_role_and_text() {
        let upstream = json!({
            "id": "msg_abc",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let envelope = messages_response_to_chat(&upstream, "gpt-proxy-model");
        assert_eq!(envelope["id"], "msg_abc");
        assert_eq!(envelope["object"], "chat.completion");
        assert_eq!(envelope["model"], "gpt-proxy-model");
        assert_eq!(envelope["choices"][0]["message"]["role"], "assistant");
        assert_eq!(envelope["choices"][0]["message"]["content"], "first\nsecond");
        assert_eq!(envelope["choices"][0]["finish_reason"], "stop");
        assert_eq!(envelope["usage"]["total_tokens"], 19);
    }

    #[test]
    fn flat_output_and_nested_choices_are_accepted() {
        assert_eq!(
            extract_response_text(&json!({"output": "plain"})),
            "plain"
        );
        assert_eq!(
            extract_response_text(&json!({
                "choices": [{"message": {"content": "nested"}}]
            })),
            "nested"
        );
    }

    #[test]
    fn missing_usage_yields_zeros() {
        let envelope = messages_response_to_chat(&json!({"output": "x"}), "m");
        assert_eq!(envelope["usage"]["prompt_tokens"], 0);
        assert_eq!(envelope["usage"]["completion_tokens"], 0);
        assert_eq!(envelope["usage"]["total_tokens"], 0);
    }

    #[test]
    fn max_tokens_finish_reason_maps_to_length() {
        let upstream = json!({"output": "x", "stop_reason": "max_tokens"});
        let envelope = messages_response_to_chat(&upstream, "m");
        assert_eq!(envelope["choices"][0]["finish_reason"], "length");
    }
}
