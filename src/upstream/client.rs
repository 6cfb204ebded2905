use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{UPSTREAM_ENDPOINTS, USER_AGENT};

static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(30));
static SHARED_CLIENT_LONG: Lazy<Client> = Lazy::new(|| create_base_client(600));

fn create_base_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap_or_else(|e| {
            warn!("[W-HTTP-CLIENT] falling_back_to_default_client: {}", e);
            Client::new()
        })
}

pub fn shared_client() -> &'static Client {
    &SHARED_CLIENT
}

pub fn shared_client_long() -> &'static Client {
    &SHARED_CLIENT_LONG
}

/// Upstream dispatcher. Endpoints are tried in order for connectivity
/// failures only; an HTTP error response is authoritative and returned as an
/// opaque string for the error classifier.
pub struct UpstreamClient;

impl UpstreamClient {
    pub fn new() -> Self {
        Self
    }

    /// Single-shot call. The returned error string deliberately carries the
    /// upstream status code and body text.
    pub async fn dispatch(&self, token: &str, payload: &Value) -> Result<Value, String> {
        let mut last_error = String::new();
        for endpoint in UPSTREAM_ENDPOINTS {
            let url = format!("{}/v1internal:generateMessage", endpoint);
            match shared_client_long()
                .post(&url)
                .bearer_auth(token)
                .header("User-Agent", USER_AGENT)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| format!("failed to decode upstream response: {}", e));
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(format!("{} {}", status.as_u16(), body));
                }
                Err(e) => {
                    debug!("Endpoint {} unreachable: {}", endpoint, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(format!("All endpoints failed: {}", last_error))
    }

    /// Streaming call. Success hands back the raw response whose body is an
    /// SSE byte stream; HTTP errors are read out and stringified like
    /// `dispatch`.
    pub async fn dispatch_stream(
        &self,
        token: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, String> {
        let mut last_error = String::new();
        for endpoint in UPSTREAM_ENDPOINTS {
            let url = format!("{}/v1internal:streamGenerateMessage?alt=sse", endpoint);
            match shared_client_long()
                .post(&url)
                .bearer_auth(token)
                .header("User-Agent", USER_AGENT)
                .header("Accept", "text/event-stream")
                .json(payload)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(format!("{} {}", status.as_u16(), body));
                }
                Err(e) => {
                    debug!("Endpoint {} unreachable: {}", endpoint, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(format!("All endpoints failed: {}", last_error))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental SSE decoder for the upstream byte stream. Frames are split on
/// blank lines; `data:` payloads are surfaced one JSON chunk at a time.
#[derive(Default)]
pub struct SseChunkBuffer {
    buffer: String,
}

impl SseChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, get back every complete JSON chunk they finished.
    pub fn push(&mut self, bytes: &Bytes) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut chunks = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            for line in frame.lines() {
                let line = line.trim();
                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(chunk) => chunks.push(chunk),
                        Err(e) => {
                            debug!("Skipping unparseable SSE data line: {}", e);
                        }
                    }
                }
            }
        }
        chunks
    }

    /// Flush a trailing frame that never got its terminating blank line.
    pub fn finish(&mut self) -> Vec<Value> {
        if self.buffer.trim().is_empty() {
            return Vec::new();
        }
        self.buffer.push_str("\n\n");
        self.push(&Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_reassembles_split_frames() {
        let mut buffer = SseChunkBuffer::new();
        let first = buffer.push(&Bytes::from_static(b"data: {\"type\":\"message_sta"));
        assert!(first.is_empty());

        let second = buffer.push(&Bytes::from_static(b"rt\"}\n\ndata: {\"type\":\"ping\"}\n\n"));
        assert_eq!(second.len(), 2);
        assert_eq!(second[0]["type"], "message_start");
        assert_eq!(second[1]["type"], "ping");
    }

    #[test]
    fn sse_buffer_skips_done_and_comments() {
        let mut buffer = SseChunkBuffer::new();
        let chunks = buffer.push(&Bytes::from_static(
            b": heartbeat\n\ndata: [DONE]\n\ndata: {\"type\":\"message_stop\"}\n\n",
        ));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["type"], "message_stop");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut buffer = SseChunkBuffer::new();
        assert!(buffer
            .push(&Bytes::from_static(b"data: {\"type\":\"message_stop\"}"))
            .is_empty());
        let chunks = buffer.finish();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["type"], "message_stop");
    }
}
