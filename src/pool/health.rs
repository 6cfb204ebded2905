use crate::models::Account;

pub const HEALTH_MIN: i32 = -100;
pub const HEALTH_MAX: i32 = 120;

/// Health score for one account. Pure function of the account state, the
/// configured default cooldown, and `now`; recomputed on every mutation.
///
/// score = state_weight
///       + (1 - usage_ratio) * 30
///       + (1 - error_ratio) * 20
///       + cooldown_factor   * 10
/// clamped to [-100, 120]. Ratios share a denominator clamped to >= 1 so a
/// fresh account is always defined.
pub fn compute_health_score(account: &Account, default_cooldown_ms: u64, now_ms: i64) -> i32 {
    let state_weight: f64 = if account.is_invalid {
        -50.0
    } else if account.is_rate_limited {
        -20.0
    } else {
        30.0
    };

    let denominator = account.stats.total().max(1) as f64;
    let usage_ratio = account.stats.success_count as f64 / denominator;
    let error_ratio = account.stats.error_count as f64 / denominator;

    let cooldown_factor = if account.is_rate_limited {
        let remaining = account.remaining_cooldown_ms(now_ms) as f64;
        let ratio = (remaining / default_cooldown_ms.max(1) as f64).min(1.0);
        (1.0 - ratio).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let raw =
        state_weight + (1.0 - usage_ratio) * 30.0 + (1.0 - error_ratio) * 20.0 + cooldown_factor * 10.0;
    (raw.round() as i32).clamp(HEALTH_MIN, HEALTH_MAX)
}

/// Recompute the `recommended` flag across the pool: the single account with
/// the strictly highest score among non-invalid accounts, provided that
/// score is positive.
pub fn refresh_recommended(accounts: &mut [Account]) {
    for account in accounts.iter_mut() {
        account.recommended = false;
    }

    let mut best: Option<(usize, i32)> = None;
    let mut tied = false;
    for (idx, account) in accounts.iter().enumerate() {
        if account.is_invalid {
            continue;
        }
        match best {
            None => best = Some((idx, account.health_score)),
            Some((_, score)) if account.health_score > score => {
                best = Some((idx, account.health_score));
                tied = false;
            }
            Some((_, score)) if account.health_score == score => tied = true,
            _ => {}
        }
    }

    if let Some((idx, score)) = best {
        if !tied && score > 0 {
            accounts[idx].recommended = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSource;

    fn account(email: &str) -> Account {
        Account::new(email.to_string(), AccountSource::Oauth)
    }

    #[test]
    fn fresh_account_scores_in_bounds() {
        let acc = account("a@example.com");
        let score = compute_health_score(&acc, 60_000, 0);
        // 30 (state) + 30 (usage 0/1) + 20 (errors 0/1) + 10 (no cooldown)
        assert_eq!(score, 90);
        assert!((HEALTH_MIN..=HEALTH_MAX).contains(&score));
    }

    #[test]
    fn zero_request_ratios_are_defined() {
        let acc = account("a@example.com");
        assert_eq!(acc.stats.total(), 0);
        // Must not panic or produce NaN.
        let score = compute_health_score(&acc, 60_000, 0);
        assert!((HEALTH_MIN..=HEALTH_MAX).contains(&score));
    }

    #[test]
    fn invalid_account_scores_low() {
        let mut acc = account("a@example.com");
        acc.is_invalid = true;
        let invalid_score = compute_health_score(&acc, 60_000, 0);
        acc.is_invalid = false;
        let healthy_score = compute_health_score(&acc, 60_000, 0);
        assert!(invalid_score < healthy_score);
    }

    #[test]
    fn cooldown_proximity_raises_score() {
        let now = 1_000_000;
        let mut acc = account("a@example.com");
        acc.is_rate_limited = true;

        acc.rate_limit_reset_time = Some(now + 60_000);
        let far = compute_health_score(&acc, 60_000, now);

        acc.rate_limit_reset_time = Some(now + 1_000);
        let near = compute_health_score(&acc, 60_000, now);

        assert!(near > far, "score should rise as the cooldown nears expiry");
    }

    #[test]
    fn score_stays_clamped_under_heavy_errors() {
        let mut acc = account("a@example.com");
        acc.is_invalid = true;
        acc.stats.error_count = 10_000;
        let score = compute_health_score(&acc, 60_000, 0);
        assert!((HEALTH_MIN..=HEALTH_MAX).contains(&score));
    }

    #[test]
    fn recommended_requires_strictly_highest_positive_score() {
        let mut accounts = vec![account("a@x"), account("b@x"), account("c@x")];
        accounts[0].health_score = 90;
        accounts[1].health_score = 40;
        accounts[2].health_score = 90;
        refresh_recommended(&mut accounts);
        // Tie at the top: nobody is recommended.
        assert!(accounts.iter().all(|a| !a.recommended));

        accounts[2].health_score = 10;
        refresh_recommended(&mut accounts);
        assert!(accounts[0].recommended);
        assert!(!accounts[1].recommended);
    }

    #[test]
    fn recommended_skips_invalid_accounts() {
        let mut accounts = vec![account("a@x"), account("b@x")];
        accounts[0].health_score = 100;
        accounts[0].is_invalid = true;
        accounts[1].health_score = 50;
        refresh_recommended(&mut accounts);
        assert!(!accounts[0].recommended);
        assert!(accounts[1].recommended);
    }

    #[test]
    fn negative_best_score_is_never_recommended() {
        let mut accounts = vec![account("a@x")];
        accounts[0].health_score = -10;
        refresh_recommended(&mut accounts);
        assert!(!accounts[0].recommended);
    }
}
