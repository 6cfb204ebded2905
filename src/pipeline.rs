use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::classify::classify_effective_model;
use crate::dialect::MessagesRequest;
use crate::models::Account;
use crate::pool::{FailureOutcome, Pick};
use crate::state::App;
use crate::upstream::client::SseChunkBuffer;
use crate::upstream::error_classifier::{classify_upstream_error, ClassifiedError};

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// What a handler gets back: a ready JSON body, or an SSE stream to relay.
pub enum PipelineResponse {
    Json(Value),
    Stream(SseStream),
}

/// How many pool-directed waits one request will sit through before giving
/// up. The wait-versus-switch policy bounds each wait, so this is a
/// belt-and-suspenders cap, not a tuning knob.
const MAX_WAIT_ROUNDS: usize = 5;

/// Orchestrate one Messages-dialect request end to end: classify, acquire an
/// account, resolve credentials, dispatch, and report the outcome back into
/// the scheduler. `protocol` and `route` label the flow record.
pub async fn handle_request(
    app: &Arc<App>,
    mut request: MessagesRequest,
    protocol: &str,
    route: &str,
) -> Result<PipelineResponse, ClassifiedError> {
    if let Err(e) = app.ensure_initialized().await {
        return Err(ClassifiedError {
            kind: crate::upstream::error_classifier::ErrorKind::Api,
            status: 500,
            message: format!("initialization failed: {}", e),
            retry_after_secs: None,
            overload_scope: None,
        });
    }

    if request.messages.is_empty() {
        return Err(ClassifiedError::invalid_request(
            "messages: at least one message is required",
        ));
    }

    // When every account is cooling down, optimistically clear the flags and
    // let the next upstream call probe reality.
    {
        let mut pool = app.pool.lock().await;
        if pool.all_rate_limited() {
            pool.reset_all_rate_limits();
        }
    }

    let client_model = request.model.clone();
    let effective_model = classify_effective_model(&request);
    if effective_model != client_model {
        debug!("Model rewrite: {} -> {}", client_model, effective_model);
    }
    request.model = effective_model.clone();

    let wants_stream = request.wants_stream();
    let flow_id = app
        .flows
        .start_flow(
            protocol,
            route,
            &effective_model,
            wants_stream,
            redact_request(&request),
        )
        .await;

    let account = match acquire_account(app, &effective_model).await {
        Ok(account) => account,
        Err(err) => {
            app.flows
                .complete_flow(&flow_id, None, None, Some(err.kind.type_name().to_string()))
                .await;
            return Err(err);
        }
    };

    let token = match resolve_credentials(app, &account).await {
        Ok(token) => token,
        Err(err) => {
            app.flows
                .complete_flow(
                    &flow_id,
                    Some(account.email.clone()),
                    None,
                    Some(err.kind.type_name().to_string()),
                )
                .await;
            return Err(err);
        }
    };

    let project_id = app.resolver.get_project_for_account(&account, &token).await;
    let payload = crate::upstream::to_upstream_payload(&request, &project_id);

    if wants_stream {
        dispatch_streaming(app, &account, &token, &payload, &effective_model, flow_id).await
    } else {
        dispatch_buffered(app, &account, &token, &payload, &effective_model, flow_id).await
    }
}

/// Selection loop: sleep through pool-directed waits, bounded by
/// MAX_WAIT_ROUNDS. Selection is model-aware so a quota lock on one model
/// never sidelines the account for the others.
async fn acquire_account(app: &Arc<App>, model: &str) -> Result<Account, ClassifiedError> {
    for _ in 0..MAX_WAIT_ROUNDS {
        let pick = {
            let mut pool = app.pool.lock().await;
            pool.pick_sticky_account(Some(model))
        };
        match pick {
            Pick::Account(account) => return Ok(account),
            Pick::Wait(ms) => {
                debug!("Pool directed wait: {}ms", ms);
                tokio::time::sleep(std::time::Duration::from_millis(ms.max(1))).await;
            }
            Pick::Exhausted => {
                let (empty, hint) = {
                    let pool = app.pool.lock().await;
                    (pool.is_empty(), pool.soonest_reset_secs())
                };
                if empty {
                    return Err(ClassifiedError::authentication(
                        "No accounts are enrolled. Enroll an account, then retry.",
                    ));
                }
                return Err(ClassifiedError::overloaded(
                    "All accounts are cooling down or invalid.",
                    hint.unwrap_or(crate::constants::DEFAULT_RETRY_AFTER_SECS),
                ));
            }
        }
    }

    let hint = app.pool.lock().await.soonest_reset_secs();
    Err(ClassifiedError::overloaded(
        "Account pool did not become available in time.",
        hint.unwrap_or(crate::constants::DEFAULT_RETRY_AFTER_SECS),
    ))
}

async fn resolve_credentials(app: &Arc<App>, account: &Account) -> Result<String, ClassifiedError> {
    match app.resolver.get_token_for_account(account).await {
        Ok(resolved) => {
            if resolved.refreshed {
                app.pool.lock().await.clear_invalid(&account.email);
            }
            Ok(resolved.token)
        }
        Err(message) => {
            warn!("Token resolution failed for {}: {}", account.email, message);
            app.pool.lock().await.record_failure(
                &account.email,
                FailureOutcome {
                    rate_limit_ms: None,
                    model: None,
                    invalidate: Some(message.clone()),
                },
            );
            Err(ClassifiedError::authentication(format!(
                "Credential for {} is no longer usable ({}). Re-enroll the account.",
                account.email, message
            )))
        }
    }
}

async fn dispatch_buffered(
    app: &Arc<App>,
    account: &Account,
    token: &str,
    payload: &Value,
    model: &str,
    flow_id: String,
) -> Result<PipelineResponse, ClassifiedError> {
    match app.upstream.dispatch(token, payload).await {
        Ok(body) => {
            let body = crate::upstream::from_upstream_response(body);
            let usage = body.get("usage").cloned();
            app.pool.lock().await.record_success(&account.email);
            app.flows
                .complete_flow(&flow_id, Some(account.email.clone()), usage, None)
                .await;
            Ok(PipelineResponse::Json(body))
        }
        Err(raw) => {
            let classified = classify_and_report(app, account, &raw, model).await;
            app.flows
                .complete_flow(
                    &flow_id,
                    Some(account.email.clone()),
                    None,
                    Some(classified.kind.type_name().to_string()),
                )
                .await;
            Err(classified)
        }
    }
}

async fn dispatch_streaming(
    app: &Arc<App>,
    account: &Account,
    token: &str,
    payload: &Value,
    model: &str,
    flow_id: String,
) -> Result<PipelineResponse, ClassifiedError> {
    let response = match app.upstream.dispatch_stream(token, payload).await {
        Ok(response) => response,
        Err(raw) => {
            let classified = classify_and_report(app, account, &raw, model).await;
            app.flows
                .complete_flow(
                    &flow_id,
                    Some(account.email.clone()),
                    None,
                    Some(classified.kind.type_name().to_string()),
                )
                .await;
            return Err(classified);
        }
    };

    Ok(PipelineResponse::Stream(relay_stream(
        app.clone(),
        account.clone(),
        response,
        model.to_string(),
        flow_id,
    )))
}

/// Relay upstream SSE chunks to the client unchanged: one `event:`/`data:`
/// pair per chunk, named by the chunk's `type`. Errors reported by the
/// upstream mid-flight become a `retry:` hint plus an `error` event; pure
/// transport failures end the stream without feeding the scheduler.
fn relay_stream(
    app: Arc<App>,
    account: Account,
    response: reqwest::Response,
    model: String,
    flow_id: String,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut buffer = SseChunkBuffer::new();
        let mut usage: Option<Value> = None;
        let mut failed: Option<String> = None;

        'outer: while let Some(next) = upstream.next().await {
            match next {
                Ok(bytes) => {
                    for chunk in buffer.push(&bytes) {
                        let chunk = crate::upstream::from_upstream_response(chunk);
                        if chunk.get("type").and_then(|t| t.as_str()) == Some("error") {
                            let raw = chunk.to_string();
                            let classified =
                                classify_and_report(&app, &account, &raw, &model).await;
                            yield Ok(error_event(&classified));
                            failed = Some(classified.kind.type_name().to_string());
                            break 'outer;
                        }
                        if let Some(u) = chunk.get("usage") {
                            usage = Some(u.clone());
                        }
                        let frame = emit_chunk(&chunk);
                        app.flows.record_chunk(&flow_id, frame.len()).await;
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    // Not upstream-reported: surface it, but leave the
                    // scheduler alone.
                    warn!("Stream transport error: {}", e);
                    let classified = ClassifiedError {
                        kind: crate::upstream::error_classifier::ErrorKind::Api,
                        status: 502,
                        message: format!("stream interrupted: {}", e),
                        retry_after_secs: None,
                        overload_scope: None,
                    };
                    yield Ok(error_event(&classified));
                    failed = Some("stream_interrupted".to_string());
                    break 'outer;
                }
            }
        }

        if failed.is_none() {
            for chunk in buffer.finish() {
                let frame = emit_chunk(&chunk);
                app.flows.record_chunk(&flow_id, frame.len()).await;
                yield Ok(frame);
            }
            app.pool.lock().await.record_success(&account.email);
            info!("Stream completed for {}", account.email);
        }

        app.flows
            .complete_flow(&flow_id, Some(account.email.clone()), usage, failed)
            .await;
    })
}

/// `event: <type>\ndata: <json>\n\n`, the type taken from the chunk itself.
fn emit_chunk(chunk: &Value) -> Bytes {
    let event_type = chunk
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("message");
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, chunk))
}

/// Error frame for a stream that already has headers on the wire. The
/// `retry:` field (ms) precedes the event when the error is retryable.
fn error_event(error: &ClassifiedError) -> Bytes {
    let body = error.to_body();
    match error.retry_after_secs {
        Some(secs) => Bytes::from(format!(
            "retry: {}\nevent: error\ndata: {}\n\n",
            secs * 1000,
            body
        )),
        None => Bytes::from(format!("event: error\ndata: {}\n\n", body)),
    }
}

/// Classify an upstream failure and feed the scheduler: overload errors set
/// the parsed cooldown (scoped to `model` when the upstream reported quota
/// exhaustion); authentication errors clear the caches and attempt one
/// forced refresh so the client's retry has a chance.
async fn classify_and_report(
    app: &Arc<App>,
    account: &Account,
    raw: &str,
    model: &str,
) -> ClassifiedError {
    let hint = app.pool.lock().await.soonest_reset_secs();
    let classified = classify_upstream_error(raw, hint);

    if classified.is_rate_limit() {
        let cooldown_ms = classified.retry_after_secs.map(|secs| secs * 1000);
        let model_scoped =
            classified.overload_scope == Some(crate::upstream::error_classifier::OverloadScope::Model);
        app.pool.lock().await.record_failure(
            &account.email,
            FailureOutcome {
                rate_limit_ms: cooldown_ms,
                model: model_scoped.then(|| model.to_string()),
                invalidate: None,
            },
        );
    } else if classified.is_auth() {
        app.resolver.clear_token_cache(Some(&account.email));
        app.resolver.clear_project_cache(Some(&account.email));
        match app.resolver.get_token_for_account(account).await {
            Ok(resolved) => {
                if resolved.refreshed {
                    app.pool.lock().await.clear_invalid(&account.email);
                }
                info!(
                    "Forced refresh for {} succeeded; client retry should recover",
                    account.email
                );
            }
            Err(message) => {
                app.pool.lock().await.record_failure(
                    &account.email,
                    FailureOutcome {
                        rate_limit_ms: None,
                        model: None,
                        invalidate: Some(message),
                    },
                );
            }
        }
    }
    // Other kinds (invalid request, permission, unknown api errors) are
    // surfaced without touching the scheduler.

    classified
}

/// Flow snapshot: model, stream flag, and the first three messages only.
fn redact_request(request: &MessagesRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .take(3)
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .collect();
    json!({
        "model": request.model,
        "stream": request.wants_stream(),
        "message_count": request.messages.len(),
        "messages": messages,
    })
}
