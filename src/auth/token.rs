use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::constants::{TOKEN_EXCHANGE_URL, TOKEN_REFRESH_INTERVAL_MS};
use crate::models::{Account, AccountSource};

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    extracted_at: i64,
}

#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token: String,
    /// True when this resolution hit the upstream refresh exchange; proof
    /// the credential still works, so the pipeline may clear `is_invalid`.
    pub refreshed: bool,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-account caches for access tokens and discovered project ids. The
/// token cache is authoritative for freshness; nothing bypasses it.
pub struct TokenResolver {
    token_cache: DashMap<String, CachedToken>,
    project_cache: DashMap<String, String>,
}

impl TokenResolver {
    pub fn new() -> Self {
        Self {
            token_cache: DashMap::new(),
            project_cache: DashMap::new(),
        }
    }

    /// Resolve a usable access token for the account. Cached tokens are
    /// returned while younger than TOKEN_REFRESH_INTERVAL; otherwise the
    /// account's source decides how a fresh one is obtained.
    pub async fn get_token_for_account(&self, account: &Account) -> Result<ResolvedToken, String> {
        if let Some(cached) = self.token_cache.get(&account.email) {
            if now_ms() - cached.extracted_at < TOKEN_REFRESH_INTERVAL_MS {
                return Ok(ResolvedToken {
                    token: cached.token.clone(),
                    refreshed: false,
                });
            }
        }

        match account.source {
            AccountSource::Oauth => self.refresh_oauth_token(account).await,
            AccountSource::Manual => {
                let key = account
                    .api_key
                    .clone()
                    .ok_or_else(|| format!("account {} has no stored key", account.email))?;
                self.cache_token(&account.email, &key);
                Ok(ResolvedToken {
                    token: key,
                    refreshed: false,
                })
            }
            AccountSource::Database => {
                let db_path = account
                    .database_path
                    .clone()
                    .ok_or_else(|| format!("account {} has no database path", account.email))?;
                let creds = crate::auth::database::extract_credentials(&db_path)
                    .await
                    .map_err(|e| format!("account {}: {}", account.email, e))?;
                let token = creds
                    .access_token
                    .or(creds.refresh_token)
                    .ok_or_else(|| format!("account {}: database held no token", account.email))?;
                self.cache_token(&account.email, &token);
                Ok(ResolvedToken {
                    token,
                    refreshed: false,
                })
            }
        }
    }

    async fn refresh_oauth_token(&self, account: &Account) -> Result<ResolvedToken, String> {
        let refresh_token = account
            .refresh_token
            .clone()
            .ok_or_else(|| format!("account {} has no refresh token", account.email))?;

        info!("Refreshing access token for {}", account.email);
        let client_id = std::env::var(crate::constants::OAUTH_CLIENT_ID_ENV).unwrap_or_default();
        let mut params: Vec<(&str, String)> = vec![
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token".to_string()),
        ];
        if !client_id.is_empty() {
            params.push(("client_id", client_id));
        }

        let client = crate::upstream::client::shared_client();
        let response = client
            .post(TOKEN_EXCHANGE_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    format!(
                        "token refresh for {} failed: {}. Check the network path to the authorization server.",
                        account.email, e
                    )
                } else {
                    format!("token refresh for {} failed: {}", account.email, e)
                }
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(format!(
                "token refresh for {} rejected: {}",
                account.email, error_text
            ));
        }

        let token_data = response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| format!("token refresh for {} parse failure: {}", account.email, e))?;

        self.cache_token(&account.email, &token_data.access_token);
        Ok(ResolvedToken {
            token: token_data.access_token,
            refreshed: true,
        })
    }

    fn cache_token(&self, email: &str, token: &str) {
        self.token_cache.insert(
            email.to_string(),
            CachedToken {
                token: token.to_string(),
                extracted_at: now_ms(),
            },
        );
    }

    /// Resolve the upstream project for the account: cache, then the
    /// account's own override, then endpoint discovery (which itself falls
    /// back to the default project id). Never fails.
    pub async fn get_project_for_account(&self, account: &Account, token: &str) -> String {
        if let Some(cached) = self.project_cache.get(&account.email) {
            return cached.clone();
        }

        if let Some(project_id) = &account.project_id {
            self.project_cache
                .insert(account.email.clone(), project_id.clone());
            return project_id.clone();
        }

        let project_id = crate::auth::project::discover_project_id(token).await;
        self.project_cache
            .insert(account.email.clone(), project_id.clone());
        project_id
    }

    /// Drop cached tokens, for one account or globally. Called on
    /// authentication failures and admin resets.
    pub fn clear_token_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.token_cache.remove(email);
                debug!("Cleared token cache for {}", email);
            }
            None => {
                let count = self.token_cache.len();
                self.token_cache.clear();
                warn!("Cleared token cache ({} entries)", count);
            }
        }
    }

    pub fn clear_project_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.project_cache.remove(email);
                debug!("Cleared project cache for {}", email);
            }
            None => {
                let count = self.project_cache.len();
                self.project_cache.clear();
                warn!("Cleared project cache ({} entries)", count);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_token(&self, email: &str, token: &str, extracted_at: i64) {
        self.token_cache.insert(
            email.to_string(),
            CachedToken {
                token: token.to_string(),
                extracted_at,
            },
        );
    }
}

impl Default for TokenResolver {
    fn default() -> Self {
        Self::new()
    }
}
