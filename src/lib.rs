pub mod auth;
pub mod classify;
pub mod constants;
pub mod dialect;
pub mod error;
pub mod flow;
pub mod logger;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod state;
pub mod store;
pub mod upstream;

use tracing::{error, info, warn};

use crate::models::RuntimeConfig;

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env_port(value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(p) if p > 0 => Some(p),
        _ => None,
    }
}

/// Environment overrides. `PORT` wins for standalone deployments;
/// `ANTIGRAVITY_PORT`/`ANTIGRAVITY_HOST` are what the desktop tray shell
/// sets when it spawns the gateway.
fn apply_env_overrides(config: &mut RuntimeConfig) -> Option<String> {
    let mut host_override = None;

    for key in ["PORT", "ANTIGRAVITY_PORT"] {
        if let Ok(value) = std::env::var(key) {
            if value.trim().is_empty() {
                continue;
            }
            match parse_env_port(&value) {
                Some(port) => {
                    config.port = port;
                    info!("Using port from {}: {}", key, port);
                    break;
                }
                None => warn!("[W-PORT-INVALID] ignoring_invalid_{}_value: {}", key, value),
            }
        }
    }

    if let Ok(host) = std::env::var("ANTIGRAVITY_HOST") {
        let trimmed = host.trim();
        if !trimmed.is_empty() {
            info!("Using host from ANTIGRAVITY_HOST: {}", trimmed);
            host_override = Some(trimmed.to_string());
        }
    }

    if let Ok(allow_lan) = std::env::var("ALLOW_LAN_ACCESS") {
        match parse_env_bool(&allow_lan) {
            Some(parsed) => {
                config.allow_lan_access = parsed;
                info!("Using LAN access setting from environment: {}", parsed);
            }
            None => warn!(
                "[W-LAN-ACCESS-INVALID] ignoring_invalid_lan_access_value: {}",
                allow_lan
            ),
        }
    }

    if let Ok(key) = std::env::var("ADMIN_KEY") {
        if !key.trim().is_empty() {
            info!("Using admin key from environment");
            config.admin_key = Some(key);
        }
    }

    host_override
}

async fn start_gateway() -> error::AppResult<()> {
    let data_dir = store::get_data_dir().map_err(error::AppError::Config)?;
    let store = store::CredentialStore::new(data_dir.clone());
    let mut config = store.load_config();
    let host_override = apply_env_overrides(&mut config);
    config.normalize();

    let host = host_override.unwrap_or_else(|| config.bind_host().to_string());
    let port = config.port;
    if config.allow_lan_access {
        warn!("[W-LAN-ACCESS-ENABLED] lan_access_enabled_bind_address_0_0_0_0");
    }

    let app = state::App::new(data_dir, config);
    // Warm the pool before accepting traffic; failure is not fatal, the
    // init latch retries on the first request.
    if let Err(e) = app.ensure_initialized().await {
        warn!("[W-POOL-INIT] deferred_pool_initialization: {}", e);
    }

    server::serve(app, &host, port).await
}

pub fn run() {
    logger::init_logger();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = start_gateway().await {
            error!("[E-RUNTIME-STARTUP] {}", e);
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct ScopedEnvVar {
        key: &'static str,
        previous: Option<String>,
    }

    impl ScopedEnvVar {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, previous }
        }
    }

    impl Drop for ScopedEnvVar {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn parse_env_bool_accepts_common_spellings() {
        assert_eq!(parse_env_bool("1"), Some(true));
        assert_eq!(parse_env_bool("off"), Some(false));
        assert_eq!(parse_env_bool("maybe"), None);
    }

    #[test]
    fn port_env_overrides_config_port() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _port = ScopedEnvVar::set("PORT", "8045");

        let mut config = RuntimeConfig {
            port: 8145,
            ..RuntimeConfig::default()
        };
        apply_env_overrides(&mut config);
        assert_eq!(config.port, 8045);
    }

    #[test]
    fn antigravity_port_applies_when_port_is_unset() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        std::env::remove_var("PORT");
        let _port = ScopedEnvVar::set("ANTIGRAVITY_PORT", "9001");

        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn antigravity_host_is_returned_as_override() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _host = ScopedEnvVar::set("ANTIGRAVITY_HOST", "127.0.0.1");

        let mut config = RuntimeConfig::default();
        let host = apply_env_overrides(&mut config);
        assert_eq!(host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn invalid_port_is_ignored() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _port = ScopedEnvVar::set("PORT", "not-a-port");
        std::env::remove_var("ANTIGRAVITY_PORT");

        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.port, RuntimeConfig::default().port);
    }
}
