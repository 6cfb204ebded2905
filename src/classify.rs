use tracing::debug;

use crate::constants::{
    BACKGROUND_TASK_PATTERNS, FREE_MODEL_FOR_BACKGROUND, MODEL_ALIASES, SUPPORTED_MODELS,
};
use crate::dialect::MessagesRequest;

/// Rewrite dated or aliased model ids onto the canonical variants the
/// upstream serves. Unknown ids pass through untouched.
pub fn normalize_model(model: &str) -> String {
    for (alias, canonical) in MODEL_ALIASES {
        if model == *alias {
            return (*canonical).to_string();
        }
    }
    model.to_string()
}

pub fn is_supported_model(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

/// Background-task heuristic: housekeeping requests (title generation,
/// summaries) from coding clients are transparently downgraded to the cheap
/// model. Only the system prompt and the first three messages are inspected.
fn is_background_task(request: &MessagesRequest) -> bool {
    let mut haystack = request.system_text().to_lowercase();
    for message in request.messages.iter().take(3) {
        haystack.push('\n');
        haystack.push_str(&message.content.flatten_text().to_lowercase());
    }

    BACKGROUND_TASK_PATTERNS
        .iter()
        .any(|pattern| haystack.contains(pattern))
}

/// Decide the effective model for a request: normalize the client id, then
/// downgrade background tasks. The rewrite is transparent; responses still
/// echo the client's declared model.
pub fn classify_effective_model(request: &MessagesRequest) -> String {
    let normalized = normalize_model(&request.model);

    if request.has_tools() || request.has_thinking() {
        return normalized;
    }
    if !is_supported_model(FREE_MODEL_FOR_BACKGROUND) {
        return normalized;
    }
    if normalized == FREE_MODEL_FOR_BACKGROUND {
        return normalized;
    }

    if is_background_task(request) {
        debug!(
            "Background task detected, downgrading {} -> {}",
            normalized, FREE_MODEL_FOR_BACKGROUND
        );
        return FREE_MODEL_FOR_BACKGROUND.to_string();
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MODEL_OPUS_THINKING, MODEL_SONNET_THINKING};
    use serde_json::json;

    fn request(body: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn dated_ids_normalize_to_thinking_variants() {
        assert_eq!(
            normalize_model("claude-opus-4-5-20251101"),
            MODEL_OPUS_THINKING
        );
        assert_eq!(
            normalize_model("claude-sonnet-4-5-20250929"),
            MODEL_SONNET_THINKING
        );
        assert_eq!(normalize_model("some-unknown-model"), "some-unknown-model");
    }

    #[test]
    fn title_generation_request_is_downgraded() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "system": "You summarize conversation titles.",
            "messages": [{"role": "user", "content": "Title this chat."}]
        }));
        assert_eq!(classify_effective_model(&req), FREE_MODEL_FOR_BACKGROUND);
    }

    #[test]
    fn tools_suppress_the_downgrade() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "system": "You summarize conversation titles.",
            "messages": [{"role": "user", "content": "Title this chat."}],
            "tools": [{"name": "search", "input_schema": {}}]
        }));
        assert_eq!(classify_effective_model(&req), MODEL_OPUS_THINKING);
    }

    #[test]
    fn thinking_suppresses_the_downgrade() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "system": "You summarize conversation titles.",
            "messages": [{"role": "user", "content": "Title this chat."}],
            "thinking": {"type": "enabled", "budget_tokens": 2048}
        }));
        assert_eq!(classify_effective_model(&req), MODEL_OPUS_THINKING);
    }

    #[test]
    fn only_the_first_three_messages_are_inspected() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "user", "content": "how are you"},
                {"role": "assistant", "content": "fine"},
                {"role": "user", "content": "title this chat please"}
            ]
        }));
        assert_eq!(classify_effective_model(&req), MODEL_OPUS_THINKING);
    }

    #[test]
    fn pattern_in_early_message_triggers_downgrade() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "messages": [
                {"role": "user", "content": "Please write a commit message for this diff"}
            ]
        }));
        assert_eq!(classify_effective_model(&req), FREE_MODEL_FOR_BACKGROUND);
    }

    #[test]
    fn ordinary_requests_keep_their_model() {
        let req = request(json!({
            "model": MODEL_SONNET_THINKING,
            "messages": [{"role": "user", "content": "Implement a b-tree in Rust"}]
        }));
        assert_eq!(classify_effective_model(&req), MODEL_SONNET_THINKING);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let req = request(json!({
            "model": MODEL_OPUS_THINKING,
            "messages": [{"role": "user", "content": "TITLE THIS CHAT"}]
        }));
        assert_eq!(classify_effective_model(&req), FREE_MODEL_FOR_BACKGROUND);
    }
}
