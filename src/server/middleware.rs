use axum::http::HeaderMap;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

/// Admin gate: when a shared secret is configured, `X-Admin-Key` must match
/// it. No configured secret means open access.
pub fn is_admin_authorized(headers: &HeaderMap, admin_key: Option<&str>) -> bool {
    let Some(expected) = admin_key else {
        return true;
    };
    if expected.is_empty() {
        return true;
    }
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|provided| constant_time_str_eq(provided, expected))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(key: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = key {
            headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        }
        headers
    }

    #[test]
    fn missing_config_secret_means_open_access() {
        assert!(is_admin_authorized(&headers_with(None), None));
        assert!(is_admin_authorized(&headers_with(Some("anything")), None));
    }

    #[test]
    fn configured_secret_requires_exact_match() {
        assert!(is_admin_authorized(
            &headers_with(Some("s3cret")),
            Some("s3cret")
        ));
        assert!(!is_admin_authorized(
            &headers_with(Some("wrong")),
            Some("s3cret")
        ));
        assert!(!is_admin_authorized(&headers_with(None), Some("s3cret")));
    }

    #[test]
    fn comparison_handles_length_mismatch() {
        assert!(!constant_time_str_eq("short", "a much longer secret"));
        assert!(constant_time_str_eq("", ""));
    }
}
