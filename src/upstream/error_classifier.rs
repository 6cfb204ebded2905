use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use crate::constants::DEFAULT_RETRY_AFTER_SECS;

/// Closed taxonomy for client-visible errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Overloaded,
    InvalidRequest,
    Permission,
    Api,
}

impl ErrorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Overloaded => "overloaded_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::Api => "api_error",
        }
    }
}

/// What an overload error locks out. Quota exhaustion is tracked per model
/// upstream; TPM/RPM-style limits apply to the whole account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadScope {
    Account,
    Model,
}

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    /// Seconds, set for 503 responses.
    pub retry_after_secs: Option<u64>,
    /// Set for overload errors only.
    pub overload_scope: Option<OverloadScope>,
}

impl ClassifiedError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Authentication,
            status: 401,
            message: message.into(),
            retry_after_secs: None,
            overload_scope: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            status: 400,
            message: message.into(),
            retry_after_secs: None,
            overload_scope: None,
        }
    }

    pub fn overloaded(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            kind: ErrorKind::Overloaded,
            status: 503,
            message: message.into(),
            retry_after_secs: Some(retry_after_secs),
            overload_scope: Some(OverloadScope::Account),
        }
    }

    /// Client-visible body: `{type:"error", error:{type, message}}`.
    pub fn to_body(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.kind.type_name(),
                "message": self.message
            }
        })
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::Overloaded
    }

    pub fn is_auth(&self) -> bool {
        self.kind == ErrorKind::Authentication
    }
}

static RESET_WINDOW_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)reset\s+after\s+(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?")
        .expect("Invalid reset window regex")
});

static MESSAGE_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""message"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("Invalid message field regex")
});

/// Map an opaque upstream error string onto the closed taxonomy.
/// `pool_hint_secs` is the scheduler's soonest-available estimate, used as
/// the Retry-After fallback for overload errors without a parseable window.
pub fn classify_upstream_error(raw: &str, pool_hint_secs: Option<u64>) -> ClassifiedError {
    if raw.contains("401") || raw.contains("UNAUTHENTICATED") {
        return ClassifiedError::authentication(
            "Upstream rejected the account credential. Re-enroll the account, then retry.",
        );
    }

    if raw.contains("429") || raw.contains("RESOURCE_EXHAUSTED") || raw.contains("QUOTA_EXHAUSTED")
    {
        let retry_after = parse_reset_window_secs(raw)
            .or(pool_hint_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        // Only quota exhaustion is safe to isolate per model; TPM/RPM-style
        // limits hit the whole account.
        let scope = if raw.contains("QUOTA_EXHAUSTED") {
            OverloadScope::Model
        } else {
            OverloadScope::Account
        };
        return ClassifiedError {
            kind: ErrorKind::Overloaded,
            status: 503,
            message: raw.to_string(),
            retry_after_secs: Some(retry_after),
            overload_scope: Some(scope),
        };
    }

    if raw.contains("invalid_request_error") || raw.contains("INVALID_ARGUMENT") {
        let message = MESSAGE_FIELD_REGEX
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| raw.to_string());
        return ClassifiedError::invalid_request(message);
    }

    if raw.contains("All endpoints failed") {
        return ClassifiedError {
            kind: ErrorKind::Api,
            status: 503,
            message: raw.to_string(),
            retry_after_secs: Some(pool_hint_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
            overload_scope: None,
        };
    }

    if raw.contains("PERMISSION_DENIED") {
        return ClassifiedError {
            kind: ErrorKind::Permission,
            status: 403,
            message: raw.to_string(),
            retry_after_secs: None,
            overload_scope: None,
        };
    }

    ClassifiedError {
        kind: ErrorKind::Api,
        status: 500,
        message: raw.to_string(),
        retry_after_secs: None,
        overload_scope: None,
    }
}

/// Parse `"... reset after 1h2m3s"` (any subset of components) into seconds.
pub fn parse_reset_window_secs(raw: &str) -> Option<u64> {
    let caps = RESET_WINDOW_REGEX.captures(raw)?;
    let hours: u64 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let minutes: u64 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let seconds: u64 = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    let total = hours * 3600 + minutes * 60 + seconds;
    (total > 0).then_some(total)
}
