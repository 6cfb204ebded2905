use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::config::PoolSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    /// Long-lived refresh token obtained through an external enrollment flow.
    Oauth,
    /// Credentials extracted from a local IDE credential database.
    Database,
    /// A long-lived key pasted in by the operator.
    Manual,
}

impl Default for AccountSource {
    fn default() -> Self {
        AccountSource::Oauth
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStats {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<i64>,
}

impl AccountStats {
    pub fn total(&self) -> u64 {
        self.success_count + self.error_count
    }
}

/// Model-scoped quota lock. Quota exhaustion is per model upstream; the
/// account stays usable for other models while one model's quota refills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimit {
    pub reset_time: i64,
    #[serde(default)]
    pub exhausted_count: u64,
}

/// One backing credential. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    #[serde(default)]
    pub source: AccountSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_time: Option<i64>,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<i64>,
    /// Model-scoped quota cooldowns, keyed by effective model id. Distinct
    /// from the account-wide rate-limit flag: only quota exhaustion is
    /// isolated per model.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_limits: HashMap<String, ModelLimit>,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default)]
    pub stats: AccountStats,
    #[serde(default)]
    pub health_score: i32,
    #[serde(default)]
    pub recommended: bool,
}

impl Account {
    pub fn new(email: String, source: AccountSource) -> Self {
        Self {
            email,
            source,
            refresh_token: None,
            api_key: None,
            database_path: None,
            project_id: None,
            is_rate_limited: false,
            rate_limit_reset_time: None,
            is_invalid: false,
            invalid_reason: None,
            invalid_at: None,
            model_limits: HashMap::new(),
            last_used: 0,
            stats: AccountStats::default(),
            health_score: 0,
            recommended: false,
        }
    }

    /// Selectable right now: neither rate-limited nor invalidated.
    pub fn is_available(&self) -> bool {
        !self.is_rate_limited && !self.is_invalid
    }

    /// Selectable for a specific model: account-level availability plus no
    /// live quota lock on that model. `None` ignores model locks.
    pub fn is_available_for(&self, model: Option<&str>, now_ms: i64) -> bool {
        if !self.is_available() {
            return false;
        }
        match model {
            Some(model) => self.model_cooldown_ms(model, now_ms) == 0,
            None => true,
        }
    }

    /// Remaining account-wide cooldown in ms, 0 when expired or not limited.
    pub fn remaining_cooldown_ms(&self, now_ms: i64) -> u64 {
        if !self.is_rate_limited {
            return 0;
        }
        self.rate_limit_reset_time
            .map(|reset| (reset - now_ms).max(0) as u64)
            .unwrap_or(0)
    }

    /// Remaining quota cooldown for one model, 0 when expired or absent.
    pub fn model_cooldown_ms(&self, model: &str, now_ms: i64) -> u64 {
        self.model_limits
            .get(model)
            .map(|limit| (limit.reset_time - now_ms).max(0) as u64)
            .unwrap_or(0)
    }

    /// The cooldown currently blocking this account for `model`: the
    /// account-wide one when set, else the model-scoped one.
    pub fn blocking_cooldown_ms(&self, model: Option<&str>, now_ms: i64) -> u64 {
        let account_wide = self.remaining_cooldown_ms(now_ms);
        if account_wide > 0 {
            return account_wide;
        }
        model
            .map(|m| self.model_cooldown_ms(m, now_ms))
            .unwrap_or(0)
    }
}

/// The persisted document: accounts plus scheduler settings plus the sticky
/// index, written back best-effort on every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub settings: PoolSettings,
    #[serde(default)]
    pub active_index: usize,
}
