use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::constants::{MODEL_ALIASES, SUPPORTED_MODELS};
use crate::dialect::chat::{chat_to_messages, messages_response_to_chat, ChatCompletionsRequest};
use crate::dialect::MessagesRequest;
use crate::pipeline::{self, PipelineResponse};
use crate::state::App;
use crate::upstream::error_classifier::ClassifiedError;

pub fn error_response(error: &ClassifiedError) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("Content-Type", "application/json");
    if error.status == 503 {
        if let Some(secs) = error.retry_after_secs {
            builder = builder.header("Retry-After", secs.to_string());
        }
    }
    builder
        .body(Body::from(error.to_body().to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn sse_response(stream: crate::pipeline::SseStream) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// POST /v1/messages — Messages dialect, streaming optional.
pub async fn handle_messages(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    let request: MessagesRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(&ClassifiedError::invalid_request(format!(
                "Invalid request body: {}",
                e
            )));
        }
    };

    match pipeline::handle_request(&app, request, "anthropic", "/v1/messages").await {
        Ok(PipelineResponse::Json(body)) => Json(body).into_response(),
        Ok(PipelineResponse::Stream(stream)) => sse_response(stream),
        Err(error) => error_response(&error),
    }
}

/// POST /v1/chat/completions — Chat-Completions dialect, non-streaming only.
pub async fn handle_chat_completions(
    State(app): State<Arc<App>>,
    Json(body): Json<Value>,
) -> Response {
    let request: ChatCompletionsRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(&ClassifiedError::invalid_request(format!(
                "Invalid request body: {}",
                e
            )));
        }
    };

    if request.stream.unwrap_or(false) {
        return error_response(&ClassifiedError::invalid_request(
            "Streaming is not supported on the chat completions dialect; use /v1/messages.",
        ));
    }

    let client_model = request.model.clone();
    let mut normalized = chat_to_messages(request);
    normalized.stream = None;

    match pipeline::handle_request(&app, normalized, "openai", "/v1/chat/completions").await {
        Ok(PipelineResponse::Json(body)) => {
            Json(messages_response_to_chat(&body, &client_model)).into_response()
        }
        // The pipeline never streams when the request does not ask for it.
        Ok(PipelineResponse::Stream(_)) => {
            warn!("Unexpected stream response on chat completions route");
            error_response(&ClassifiedError {
                kind: crate::upstream::error_classifier::ErrorKind::Api,
                status: 500,
                message: "unexpected streaming response".to_string(),
                retry_after_secs: None,
                overload_scope: None,
            })
        }
        Err(error) => error_response(&error),
    }
}

/// GET /v1/models — static catalog plus normalized aliases.
pub async fn handle_list_models() -> Response {
    let mut data: Vec<Value> = SUPPORTED_MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "cloud-code"
            })
        })
        .collect();
    for (alias, canonical) in MODEL_ALIASES {
        data.push(json!({
            "id": alias,
            "object": "model",
            "owned_by": "cloud-code",
            "aliases": canonical
        }));
    }

    Json(json!({"object": "list", "data": data})).into_response()
}

/// GET /health — pool summary.
pub async fn handle_health(State(app): State<Arc<App>>) -> Response {
    if let Err(e) = app.ensure_initialized().await {
        warn!("Health check hit initialization failure: {}", e);
    }
    let summary = app.pool.lock().await.summary();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pool": summary
    }))
    .into_response()
}

/// GET /account-limits — per-account counters, the account-wide cooldown,
/// and each model's live quota lock. JSON by default, an ASCII table with
/// `?format=table`.
pub async fn handle_account_limits(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(e) = app.ensure_initialized().await {
        warn!("Account limits hit initialization failure: {}", e);
    }
    let entries = app.pool.lock().await.limits();

    if params.get("format").map(|f| f == "table").unwrap_or(false) {
        return (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            render_limits_table(&entries),
        )
            .into_response();
    }

    Json(json!({"accounts": entries})).into_response()
}

fn render_limits_table(entries: &[crate::pool::AccountLimitsEntry]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<32} {:>7} {:>5} {:>8} {:>8} {:>10} {:>8}  {}\n",
        "EMAIL", "HEALTH", "REC", "OK", "ERR", "STATE", "RESET_S", "MODEL_LOCKS"
    ));
    for entry in entries {
        let state = if entry.is_invalid {
            "invalid"
        } else if entry.is_rate_limited {
            "limited"
        } else {
            "ready"
        };
        let model_locks = if entry.model_limits.is_empty() {
            "-".to_string()
        } else {
            entry
                .model_limits
                .iter()
                .map(|l| format!("{}={}s", l.model, l.reset_in_secs))
                .collect::<Vec<_>>()
                .join(",")
        };
        out.push_str(&format!(
            "{:<32} {:>7} {:>5} {:>8} {:>8} {:>10} {:>8}  {}\n",
            entry.email,
            entry.health_score,
            if entry.recommended { "*" } else { "" },
            entry.success_count,
            entry.error_count,
            state,
            entry
                .rate_limit_reset_in_secs
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            model_locks,
        ));
    }
    out
}

/// POST /refresh-token — clear caches and force a fresh resolution for the
/// current account.
pub async fn handle_refresh_token(State(app): State<Arc<App>>) -> Response {
    app.reset_credentials().await;
    if let Err(e) = app.ensure_initialized().await {
        return error_response(&ClassifiedError::authentication(format!(
            "re-initialization failed: {}",
            e
        )));
    }

    let account = {
        let mut pool = app.pool.lock().await;
        match pool.pick_sticky_account(None) {
            crate::pool::Pick::Account(account) => Some(account),
            _ => None,
        }
    };

    match account {
        Some(account) => match app.resolver.get_token_for_account(&account).await {
            Ok(_) => Json(json!({
                "status": "ok",
                "account": account.email
            }))
            .into_response(),
            Err(e) => error_response(&ClassifiedError::authentication(format!(
                "refresh for {} failed: {}",
                account.email, e
            ))),
        },
        None => error_response(&ClassifiedError::authentication(
            "No account available to refresh.",
        )),
    }
}
