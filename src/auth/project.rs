use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_PROJECT_ID, UPSTREAM_ENDPOINTS, USER_AGENT};

/// Discover the account's companion project through the upstream's
/// loadCodeAssist surface, trying each endpoint in order. The first
/// well-formed response wins; when every endpoint fails the hard-coded
/// default project is used.
pub async fn discover_project_id(access_token: &str) -> String {
    for endpoint in UPSTREAM_ENDPOINTS {
        match fetch_from_endpoint(endpoint, access_token).await {
            Ok(project_id) => {
                debug!("Project discovery via {} -> {}", endpoint, project_id);
                return project_id;
            }
            Err(e) => {
                debug!("Project discovery on {} failed: {}", endpoint, e);
            }
        }
    }

    warn!(
        "[W-PROJECT-DISCOVERY] all_endpoints_failed_using_default_project: {}",
        DEFAULT_PROJECT_ID
    );
    DEFAULT_PROJECT_ID.to_string()
}

async fn fetch_from_endpoint(endpoint: &str, access_token: &str) -> Result<String, String> {
    let url = format!("{}/v1internal:loadCodeAssist", endpoint);
    let request_body = serde_json::json!({
        "metadata": {
            "ideType": "CLOUD_CODE"
        }
    });

    let client = crate::upstream::client::shared_client();
    let response = client
        .post(&url)
        .bearer_auth(access_token)
        .header("User-Agent", USER_AGENT)
        .header("Content-Type", "application/json")
        .json(&request_body)
        .send()
        .await
        .map_err(|e| format!("loadCodeAssist request failed: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("loadCodeAssist returned {}: {}", status, body));
    }

    let data: Value = response
        .json()
        .await
        .map_err(|e| format!("failed to parse loadCodeAssist response: {}", e))?;

    data.get("cloudaicompanionProject")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| "response carried no cloudaicompanionProject".to_string())
}
