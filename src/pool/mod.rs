pub mod health;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{MAX_WAIT_BEFORE_ERROR_MS, SHORT_WAIT_THRESHOLD_MS};
use crate::models::{Account, PoolSettings, StoreDocument};
use crate::store::CredentialStore;

/// Outcome of one selection pass.
#[derive(Debug, Clone)]
pub enum Pick {
    /// Use this account for the request.
    Account(Account),
    /// No account right now; sleep this many ms and pick again. Preserves
    /// upstream cache locality when the wait is shorter than a switch is
    /// worth.
    Wait(u64),
    /// Nothing selectable and nothing worth waiting for.
    Exhausted,
}

/// What the pipeline learned from a failed upstream call.
#[derive(Debug, Clone, Default)]
pub struct FailureOutcome {
    /// Cooldown hint parsed from the upstream error, ms.
    pub rate_limit_ms: Option<u64>,
    /// Set when the cooldown is quota exhaustion for one model; the lock is
    /// then scoped to that model instead of the whole account.
    pub model: Option<String>,
    /// Present when the credential itself is bad; the reason is persisted.
    pub invalidate: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub invalid: usize,
    pub current_account: Option<String>,
    pub recommended_account: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelLimitEntry {
    pub model: String,
    pub reset_in_secs: u64,
    pub exhausted_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountLimitsEntry {
    pub email: String,
    pub health_score: i32,
    pub recommended: bool,
    pub is_rate_limited: bool,
    pub rate_limit_reset_in_secs: Option<u64>,
    /// Live quota locks per model, soonest first.
    pub model_limits: Vec<ModelLimitEntry>,
    pub is_invalid: bool,
    pub invalid_reason: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_success_at: Option<i64>,
    pub last_used: i64,
}

/// The account scheduler. One instance per process, accessed behind a single
/// async mutex; every method completes without suspension so the lock is
/// never held across I/O.
pub struct AccountPool {
    accounts: Vec<Account>,
    current_index: usize,
    last_used_email: Option<String>,
    last_used_at: Option<i64>,
    settings: PoolSettings,
    store: CredentialStore,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl AccountPool {
    pub fn from_store(store: CredentialStore) -> Self {
        let doc = store.load();
        Self::from_document(store, doc)
    }

    pub fn from_document(store: CredentialStore, doc: StoreDocument) -> Self {
        let mut pool = Self {
            accounts: doc.accounts,
            // Left as loaded; the first pick converges onto the ranked order.
            current_index: doc.active_index,
            last_used_email: None,
            last_used_at: None,
            settings: doc.settings,
            store,
        };
        let now = now_ms();
        pool.rescore_all(now);
        pool
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    fn index_of(&self, email: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.email == email)
    }

    fn persist(&self) {
        let doc = StoreDocument {
            accounts: self.accounts.clone(),
            settings: self.settings.clone(),
            active_index: self.current_index,
        };
        self.store.save(&doc);
    }

    fn rescore(&mut self, idx: usize, now: i64) {
        let cooldown = self.settings.cooldown_duration_ms;
        if let Some(account) = self.accounts.get_mut(idx) {
            account.health_score = health::compute_health_score(account, cooldown, now);
        }
        health::refresh_recommended(&mut self.accounts);
    }

    fn rescore_all(&mut self, now: i64) {
        let cooldown = self.settings.cooldown_duration_ms;
        for account in &mut self.accounts {
            account.health_score = health::compute_health_score(account, cooldown, now);
        }
        health::refresh_recommended(&mut self.accounts);
    }

    /// Lazily reconcile expired cooldowns, account-wide and model-scoped.
    /// Runs on every selection; anything whose reset time has passed becomes
    /// available again.
    pub fn clear_expired_limits(&mut self) -> usize {
        let now = now_ms();
        let mut cleared = 0;
        for idx in 0..self.accounts.len() {
            let expired = {
                let account = &self.accounts[idx];
                account.is_rate_limited
                    && account
                        .rate_limit_reset_time
                        .map(|reset| reset <= now)
                        .unwrap_or(true)
            };
            if expired {
                let account = &mut self.accounts[idx];
                account.is_rate_limited = false;
                account.rate_limit_reset_time = None;
                debug!("Cooldown expired for {}, account available again", account.email);
                self.rescore(idx, now);
                cleared += 1;
            }

            let account = &mut self.accounts[idx];
            let email = account.email.clone();
            let before = account.model_limits.len();
            account.model_limits.retain(|model, limit| {
                let live = limit.reset_time > now;
                if !live {
                    debug!("Quota lock expired for {} on {}", email, model);
                }
                live
            });
            cleared += before - account.model_limits.len();
        }
        cleared
    }

    fn touch(&mut self, idx: usize, now: i64) {
        self.accounts[idx].last_used = now;
        self.last_used_email = Some(self.accounts[idx].email.clone());
        self.last_used_at = Some(now);
    }

    /// Sticky selection for a target model. Three layered rules; see each
    /// branch. `None` ignores model-scoped quota locks.
    pub fn pick_sticky_account(&mut self, target_model: Option<&str>) -> Pick {
        self.clear_expired_limits();
        let now = now_ms();

        if self.accounts.is_empty() {
            return Pick::Exhausted;
        }

        // Rule 1: affinity lock. The most recently used account wins while
        // the lock window is open, even over a short cooldown (sleeping
        // beats losing the upstream prompt cache).
        if let (Some(email), Some(at)) = (self.last_used_email.clone(), self.last_used_at) {
            if now.saturating_sub(at) < self.settings.affinity_window_ms as i64 {
                if let Some(idx) = self.index_of(&email) {
                    let account = &self.accounts[idx];
                    if account.is_available_for(target_model, now) {
                        debug!("Affinity lock: reusing {}", account.email);
                        return Pick::Account(account.clone());
                    }
                    if !account.is_invalid {
                        let remaining = account.blocking_cooldown_ms(target_model, now);
                        if remaining > 0 && remaining <= SHORT_WAIT_THRESHOLD_MS {
                            debug!(
                                "Affinity lock: {} cooling down {}ms, holding",
                                account.email, remaining
                            );
                            return Pick::Wait(remaining);
                        }
                    }
                    // Invalid or long cooldown: the lock yields.
                }
            }
        }

        // Rule 2: sticky current.
        if let Some(account) = self.accounts.get(self.current_index) {
            if account.is_available_for(target_model, now) {
                self.touch(self.current_index, now);
                self.persist();
                let account = self.accounts[self.current_index].clone();
                debug!("Sticky current: {}", account.email);
                return Pick::Account(account);
            }
        }

        // Rule 3: wait-versus-switch on the current account's cooldown
        // (account-wide, or the quota lock on the target model).
        if let Some(account) = self.accounts.get(self.current_index) {
            if !account.is_invalid {
                let remaining = account.blocking_cooldown_ms(target_model, now);
                if remaining > 0 {
                    if remaining <= SHORT_WAIT_THRESHOLD_MS {
                        debug!(
                            "Current account {} cooling down {}ms, waiting",
                            account.email, remaining
                        );
                        return Pick::Wait(remaining);
                    }
                    if remaining <= MAX_WAIT_BEFORE_ERROR_MS
                        && !self.has_other_available(self.current_index, target_model, now)
                    {
                        debug!(
                            "Current account {} cooling down {}ms with no alternative, waiting",
                            account.email, remaining
                        );
                        return Pick::Wait(remaining);
                    }
                    // Medium cooldown with an alternative, or a cooldown too
                    // long to sit out: switch.
                }
            }
        }

        // Rule 4: pick the best available account.
        self.pick_next(target_model, now)
    }

    fn has_other_available(&self, except: usize, target_model: Option<&str>, now: i64) -> bool {
        self.accounts
            .iter()
            .enumerate()
            .any(|(idx, a)| idx != except && a.is_available_for(target_model, now))
    }

    fn pick_next(&mut self, target_model: Option<&str>, now: i64) -> Pick {
        let mut candidates: Vec<usize> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_available_for(target_model, now))
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            return Pick::Exhausted;
        }

        candidates.sort_by(|&a, &b| {
            let (left, right) = (&self.accounts[a], &self.accounts[b]);
            right
                .health_score
                .cmp(&left.health_score)
                .then_with(|| {
                    right
                        .stats
                        .last_success_at
                        .unwrap_or(0)
                        .cmp(&left.stats.last_success_at.unwrap_or(0))
                })
        });

        let idx = candidates[0];
        self.current_index = idx;
        self.touch(idx, now);
        self.persist();
        let account = self.accounts[idx].clone();
        info!(
            "Switched to account {} (health={})",
            account.email, account.health_score
        );
        Pick::Account(account)
    }

    pub fn all_rate_limited(&self) -> bool {
        !self.accounts.is_empty() && self.accounts.iter().all(|a| a.is_rate_limited)
    }

    /// Optimistic reset: clear every cooldown, including still-valid ones
    /// and model-scoped quota locks, so the next call probes the upstream
    /// instead of refusing locally. The next 429 re-teaches the real
    /// cooldown.
    pub fn reset_all_rate_limits(&mut self) {
        let now = now_ms();
        let count = self.accounts.iter().filter(|a| a.is_rate_limited).count()
            + self
                .accounts
                .iter()
                .map(|a| a.model_limits.len())
                .sum::<usize>();
        for account in &mut self.accounts {
            account.is_rate_limited = false;
            account.rate_limit_reset_time = None;
            account.model_limits.clear();
        }
        self.rescore_all(now);
        self.persist();
        warn!("Optimistic reset: cleared {} rate-limit record(s)", count);
    }

    /// Seconds until the soonest cooldown expires, counting account-wide
    /// cooldowns and model quota locks; used as a Retry-After estimate when
    /// the pool is exhausted.
    pub fn soonest_reset_secs(&self) -> Option<u64> {
        let now = now_ms();
        let account_wide = self
            .accounts
            .iter()
            .filter(|a| a.is_rate_limited)
            .filter_map(|a| a.rate_limit_reset_time);
        let model_scoped = self
            .accounts
            .iter()
            .flat_map(|a| a.model_limits.values())
            .map(|limit| limit.reset_time);
        account_wide
            .chain(model_scoped)
            .map(|reset| ((reset - now).max(0) as u64) / 1000)
            .min()
    }

    pub fn record_success(&mut self, email: &str) {
        let now = now_ms();
        let Some(idx) = self.index_of(email) else {
            return;
        };
        {
            let account = &mut self.accounts[idx];
            account.stats.success_count += 1;
            account.stats.last_success_at = Some(now);
            account.is_rate_limited = false;
            account.rate_limit_reset_time = None;
            account.is_invalid = false;
            account.invalid_reason = None;
            account.invalid_at = None;
        }
        self.rescore(idx, now);
        self.persist();
    }

    /// Apply an upstream cooldown. With `model` set the lock is scoped to
    /// that model's quota; otherwise the whole account cools down.
    pub fn mark_rate_limited(&mut self, email: &str, cooldown_ms: Option<u64>, model: Option<&str>) {
        let now = now_ms();
        let Some(idx) = self.index_of(email) else {
            return;
        };
        let cooldown = cooldown_ms.unwrap_or(self.settings.cooldown_duration_ms).max(1);
        {
            let account = &mut self.accounts[idx];
            account.stats.error_count += 1;
            account.stats.last_failure_at = Some(now);
            match model {
                Some(model) => {
                    let entry = account
                        .model_limits
                        .entry(model.to_string())
                        .or_insert(crate::models::ModelLimit {
                            reset_time: 0,
                            exhausted_count: 0,
                        });
                    entry.reset_time = now + cooldown as i64;
                    entry.exhausted_count += 1;
                    warn!(
                        "Account {} quota-locked on {} for {}s",
                        account.email,
                        model,
                        cooldown / 1000
                    );
                }
                None => {
                    account.is_rate_limited = true;
                    account.rate_limit_reset_time = Some(now + cooldown as i64);
                    warn!(
                        "Account {} rate-limited for {}s",
                        account.email,
                        cooldown / 1000
                    );
                }
            }
        }
        self.rescore(idx, now);
        self.persist();
    }

    pub fn mark_invalid(&mut self, email: &str, reason: &str) {
        let now = now_ms();
        let Some(idx) = self.index_of(email) else {
            return;
        };
        {
            let account = &mut self.accounts[idx];
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            account.invalid_at = Some(now);
            warn!(
                "[W-ACCOUNT-INVALID] account {} marked invalid ({}). Re-enroll it to restore service.",
                account.email, reason
            );
        }
        self.rescore(idx, now);
        self.persist();
    }

    /// A successful token refresh proves the credential works again.
    pub fn clear_invalid(&mut self, email: &str) {
        let now = now_ms();
        let Some(idx) = self.index_of(email) else {
            return;
        };
        let account = &mut self.accounts[idx];
        if !account.is_invalid {
            return;
        }
        account.is_invalid = false;
        account.invalid_reason = None;
        account.invalid_at = None;
        self.rescore(idx, now);
        self.persist();
    }

    pub fn record_failure(&mut self, email: &str, outcome: FailureOutcome) {
        if let Some(reason) = &outcome.invalidate {
            self.mark_invalid(email, reason);
        }
        if outcome.rate_limit_ms.is_some() || outcome.invalidate.is_none() {
            self.mark_rate_limited(email, outcome.rate_limit_ms, outcome.model.as_deref());
        }
    }

    pub fn remove_account(&mut self, email: &str) -> bool {
        let Some(idx) = self.index_of(email) else {
            return false;
        };
        self.accounts.remove(idx);
        if self.current_index >= self.accounts.len() {
            self.current_index = 0;
        }
        if self.last_used_email.as_deref() == Some(email) {
            self.last_used_email = None;
            self.last_used_at = None;
        }
        health::refresh_recommended(&mut self.accounts);
        self.persist();
        true
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            total: self.accounts.len(),
            available: self.accounts.iter().filter(|a| a.is_available()).count(),
            rate_limited: self.accounts.iter().filter(|a| a.is_rate_limited).count(),
            invalid: self.accounts.iter().filter(|a| a.is_invalid).count(),
            current_account: self
                .accounts
                .get(self.current_index)
                .map(|a| a.email.clone()),
            recommended_account: self
                .accounts
                .iter()
                .find(|a| a.recommended)
                .map(|a| a.email.clone()),
        }
    }

    pub fn limits(&self) -> Vec<AccountLimitsEntry> {
        let now = now_ms();
        self.accounts
            .iter()
            .map(|a| {
                let mut model_limits: Vec<ModelLimitEntry> = a
                    .model_limits
                    .iter()
                    .filter(|(_, limit)| limit.reset_time > now)
                    .map(|(model, limit)| ModelLimitEntry {
                        model: model.clone(),
                        reset_in_secs: ((limit.reset_time - now).max(0) as u64) / 1000,
                        exhausted_count: limit.exhausted_count,
                    })
                    .collect();
                model_limits.sort_by_key(|entry| entry.reset_in_secs);

                AccountLimitsEntry {
                    email: a.email.clone(),
                    health_score: a.health_score,
                    recommended: a.recommended,
                    is_rate_limited: a.is_rate_limited,
                    rate_limit_reset_in_secs: a
                        .is_rate_limited
                        .then(|| a.remaining_cooldown_ms(now) / 1000),
                    model_limits,
                    is_invalid: a.is_invalid,
                    invalid_reason: a.invalid_reason.clone(),
                    success_count: a.stats.success_count,
                    error_count: a.stats.error_count,
                    last_success_at: a.stats.last_success_at,
                    last_used: a.last_used,
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_affinity_anchor(&mut self, email: &str, at_ms: i64) {
        self.last_used_email = Some(email.to_string());
        self.last_used_at = Some(at_ms);
    }

    #[cfg(test)]
    pub(crate) fn set_current_index(&mut self, idx: usize) {
        self.current_index = idx;
    }

    #[cfg(test)]
    pub(crate) fn current_index(&self) -> usize {
        self.current_index
    }

    #[cfg(test)]
    pub(crate) fn account_mut(&mut self, email: &str) -> &mut Account {
        let idx = self.index_of(email).expect("account exists");
        &mut self.accounts[idx]
    }
}
