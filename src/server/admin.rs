use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::models::config::{MAX_FLOW_ENTRIES, MIN_FLOW_ENTRIES};
use crate::server::middleware::is_admin_authorized;
use crate::state::App;
use crate::store::backup;

async fn require_admin(app: &Arc<App>, headers: &HeaderMap) -> Result<(), Response> {
    let admin_key = app.config.read().await.admin_key.clone();
    if is_admin_authorized(headers, admin_key.as_deref()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": {
                    "type": "authentication_error",
                    "message": "Missing or invalid X-Admin-Key header."
                }
            })),
        )
            .into_response())
    }
}

/// GET /api/admin/config — the patchable subset.
pub async fn get_config(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }
    let config = app.config.read().await;
    Json(json!({
        "allowLanAccess": config.allow_lan_access,
        "maxFlowEntries": config.max_flow_entries,
        "telemetry": config.telemetry,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default)]
    pub allow_lan_access: Option<bool>,
    #[serde(default)]
    pub max_flow_entries: Option<usize>,
    #[serde(default)]
    pub telemetry: Option<bool>,
}

/// POST /api/admin/config — patch the subset; `requiresRestart` reports
/// whether the bind address changed.
pub async fn post_config(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(patch): Json<ConfigPatch>,
) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }

    if let Some(entries) = patch.max_flow_entries {
        if !(MIN_FLOW_ENTRIES..=MAX_FLOW_ENTRIES).contains(&entries) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "type": "error",
                    "error": {
                        "type": "invalid_request_error",
                        "message": format!(
                            "maxFlowEntries must be within [{}, {}]",
                            MIN_FLOW_ENTRIES, MAX_FLOW_ENTRIES
                        )
                    }
                })),
            )
                .into_response();
        }
    }

    let mut requires_restart = false;
    {
        let mut config = app.config.write().await;
        if let Some(allow) = patch.allow_lan_access {
            if allow != config.allow_lan_access {
                requires_restart = true;
            }
            config.allow_lan_access = allow;
        }
        if let Some(entries) = patch.max_flow_entries {
            config.max_flow_entries = entries;
        }
        if let Some(telemetry) = patch.telemetry {
            config.telemetry = telemetry;
        }
        let store = crate::store::CredentialStore::new(app.data_dir().clone());
        store.save_config(&config);
        info!("Admin config updated (requiresRestart={})", requires_restart);
    }

    Json(json!({"requiresRestart": requires_restart})).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub label: Option<String>,
}

/// POST /api/admin/backup — snapshot config + accounts.
pub async fn post_backup(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: Option<Json<BackupRequest>>,
) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }
    let label = body.and_then(|Json(b)| b.label);

    match backup::create_backup(app.data_dir(), label.as_deref()) {
        Ok(descriptor) => Json(json!({"backup": descriptor})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "type": "error",
                "error": {"type": "api_error", "message": e}
            })),
        )
            .into_response(),
    }
}

/// GET /api/admin/backups — enumerate stored backups.
pub async fn get_backups(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }
    Json(json!({"backups": backup::list_backups(app.data_dir())})).into_response()
}

/// GET /api/flows?limit=N&export=json|file&days=N&day=YYYY-MM-DD
pub async fn get_flows(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(100);

    let flows: Vec<crate::flow::FlowRecord> = if let Some(day) = params.get("day") {
        app.flows.read_day(day)
    } else if let Some(days) = params.get("days").and_then(|d| d.parse::<u64>().ok()) {
        app.flows.read_recent_days(days)
    } else {
        app.flows.recent(limit).await
    };
    let flows: Vec<_> = flows.into_iter().take(limit).collect();

    match params.get("export").map(|s| s.as_str()) {
        Some("file") => {
            app.flows.flush().await;
            let mut body = String::new();
            for flow in &flows {
                if let Ok(line) = serde_json::to_string(flow) {
                    body.push_str(&line);
                    body.push('\n');
                }
            }
            Response::builder()
                .header("Content-Type", "application/x-ndjson")
                .header(
                    "Content-Disposition",
                    "attachment; filename=\"flows.ndjson\"",
                )
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        _ => Json(json!({"flows": flows})).into_response(),
    }
}

/// DELETE /api/flows — admin-gated reset of the in-memory ring.
pub async fn delete_flows(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }
    app.flows.reset().await;
    Json(json!({"status": "ok"})).into_response()
}

/// Remove one account from the pool (administrative removal path).
pub async fn delete_account(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    axum::extract::Path(email): axum::extract::Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&app, &headers).await {
        return denied;
    }
    let removed = app.pool.lock().await.remove_account(&email);
    if removed {
        app.resolver.clear_token_cache(Some(&email));
        app.resolver.clear_project_cache(Some(&email));
        Json(json!({"status": "ok", "removed": email})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "message": format!("unknown account: {}", email)}
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_patch_accepts_camel_case() {
        let patch: ConfigPatch = serde_json::from_value(json!({
            "allowLanAccess": true,
            "maxFlowEntries": 200
        }))
        .unwrap();
        assert_eq!(patch.allow_lan_access, Some(true));
        assert_eq!(patch.max_flow_entries, Some(200));
        assert!(patch.telemetry.is_none());
    }
}
