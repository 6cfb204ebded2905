pub mod client;
pub mod error_classifier;

use serde_json::Value;

use crate::dialect::MessagesRequest;

// The payload adapter that rewrites Messages-dialect requests into the
// upstream wire format lives outside this crate's scope; the pipeline calls
// these two functions as an opaque boundary.

/// Wrap a normalized request for the upstream, binding it to the resolved
/// project.
pub fn to_upstream_payload(request: &MessagesRequest, project_id: &str) -> Value {
    let mut body = serde_json::to_value(request).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut body {
        map.remove("stream");
        map.insert("project".to_string(), Value::String(project_id.to_string()));
    }
    body
}

/// Unwrap an upstream response body into the Messages-dialect shape clients
/// expect. Some upstream surfaces nest the payload under `response`.
pub fn from_upstream_response(body: Value) -> Value {
    match body {
        Value::Object(mut map) => match map.remove("response") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_binds_project_and_drops_stream() {
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .unwrap();
        let payload = to_upstream_payload(&request, "proj-9");
        assert_eq!(payload["project"], "proj-9");
        assert!(payload.get("stream").is_none());
        assert_eq!(payload["model"], "claude-sonnet-4-5");
    }

    #[test]
    fn nested_response_is_unwrapped() {
        let nested = serde_json::json!({"response": {"output": "x"}});
        assert_eq!(from_upstream_response(nested)["output"], "x");

        let flat = serde_json::json!({"output": "y"});
        assert_eq!(from_upstream_response(flat)["output"], "y");
    }
}
