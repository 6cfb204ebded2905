use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_COOLDOWN_MS, TIME_WINDOW_LOCK_MS};

/// Scheduler settings persisted alongside the accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_duration_ms: u64,
    #[serde(default = "default_affinity_window_ms")]
    pub affinity_window_ms: u64,
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_affinity_window_ms() -> u64 {
    TIME_WINDOW_LOCK_MS
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cooldown_duration_ms: DEFAULT_COOLDOWN_MS,
            affinity_window_ms: TIME_WINDOW_LOCK_MS,
        }
    }
}

pub const MIN_FLOW_ENTRIES: usize = 50;
pub const MAX_FLOW_ENTRIES: usize = 2000;

/// Runtime configuration persisted as `config.json` in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub allow_lan_access: bool,
    #[serde(default = "default_max_flow_entries")]
    pub max_flow_entries: usize,
    #[serde(default = "default_telemetry")]
    pub telemetry: bool,
    /// Shared secret for administrative endpoints. Absent means open access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
}

fn default_port() -> u16 {
    8317
}

fn default_max_flow_entries() -> usize {
    300
}

fn default_telemetry() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allow_lan_access: false,
            max_flow_entries: default_max_flow_entries(),
            telemetry: default_telemetry(),
            admin_key: None,
        }
    }
}

impl RuntimeConfig {
    /// Bind address derived from the LAN-access flag.
    pub fn bind_host(&self) -> &'static str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }

    /// Clamp out-of-range values loaded from disk or patched by the admin
    /// API. Returns true when anything was adjusted.
    pub fn normalize(&mut self) -> bool {
        let before = self.max_flow_entries;
        self.max_flow_entries = self.max_flow_entries.clamp(MIN_FLOW_ENTRIES, MAX_FLOW_ENTRIES);
        before != self.max_flow_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_flow_entries() {
        let mut config = RuntimeConfig {
            max_flow_entries: 5,
            ..RuntimeConfig::default()
        };
        assert!(config.normalize());
        assert_eq!(config.max_flow_entries, MIN_FLOW_ENTRIES);

        config.max_flow_entries = 100_000;
        assert!(config.normalize());
        assert_eq!(config.max_flow_entries, MAX_FLOW_ENTRIES);
    }

    #[test]
    fn bind_host_follows_lan_flag() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.bind_host(), "127.0.0.1");
        config.allow_lan_access = true;
        assert_eq!(config.bind_host(), "0.0.0.0");
    }

    #[test]
    fn settings_default_to_sixty_second_windows() {
        let settings = PoolSettings::default();
        assert_eq!(settings.cooldown_duration_ms, 60_000);
        assert_eq!(settings.affinity_window_ms, 60_000);
    }
}
