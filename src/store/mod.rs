pub mod backup;

use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::models::{Account, AccountSource, RuntimeConfig, StoreDocument};

const ACCOUNTS_FILE: &str = "accounts.json";
const CONFIG_FILE: &str = "config.json";
const DATA_DIR_NAME: &str = ".gantry";

pub fn get_data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }
    if let Ok(env_path) = std::env::var("GANTRY_DATA_DIR") {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            ensure_dir(&data_dir)?;
            return Ok(data_dir);
        }
    }
    if cfg!(test) {
        let data_dir = std::env::temp_dir().join(format!(".gantry-test-{}", std::process::id()));
        ensure_dir(&data_dir)?;
        return Ok(data_dir);
    }

    if let Some(home) = dirs::home_dir() {
        let data_dir = home.join(DATA_DIR_NAME);
        if ensure_dir(&data_dir).is_ok() {
            return Ok(data_dir);
        }
    }
    let fallback_dir = std::env::temp_dir().join(DATA_DIR_NAME);
    ensure_dir(&fallback_dir)?;
    Ok(fallback_dir)
}

/// Durable record of accounts, scheduler settings, and the sticky index.
/// Writes are best-effort: a failed save logs a warning and the caller
/// continues with the in-memory state.
pub struct CredentialStore {
    data_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn accounts_path(&self) -> PathBuf {
        self.data_dir.join(ACCOUNTS_FILE)
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    /// Load the store document, hydrating missing fields with defaults and
    /// clamping an out-of-range `active_index`. When no document exists, a
    /// single default account is extracted from the local credential
    /// database; when that also fails the pool starts empty.
    pub fn load(&self) -> StoreDocument {
        let path = self.accounts_path();
        if path.exists() {
            // An unreadable document is never overwritten by the fallback
            // extraction; start empty and leave the file for the operator.
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<StoreDocument>(&content) {
                    Ok(mut doc) => {
                        if doc.active_index >= doc.accounts.len() {
                            doc.active_index = 0;
                        }
                        info!(
                            "Loaded {} account(s) from store (active_index={})",
                            doc.accounts.len(),
                            doc.active_index
                        );
                        return doc;
                    }
                    Err(e) => {
                        warn!("[W-STORE-PARSE] failed_to_parse_accounts_document: {}", e);
                        return StoreDocument::default();
                    }
                },
                Err(e) => {
                    warn!("[W-STORE-READ] failed_to_read_accounts_document: {}", e);
                    return StoreDocument::default();
                }
            }
        }

        match self.extract_default_account() {
            Some(account) => {
                info!(
                    "No store document found, extracted default account: {}",
                    account.email
                );
                let doc = StoreDocument {
                    accounts: vec![account],
                    ..StoreDocument::default()
                };
                self.save(&doc);
                doc
            }
            None => {
                warn!(
                    "[W-STORE-EMPTY] no_accounts_available_requests_will_fail_until_enrollment"
                );
                StoreDocument::default()
            }
        }
    }

    /// Best-effort write-back. Never propagates the failure.
    pub fn save(&self, doc: &StoreDocument) {
        let path = self.accounts_path();
        let content = match serde_json::to_string_pretty(doc) {
            Ok(c) => c,
            Err(e) => {
                warn!("[W-STORE-SERIALIZE] failed_to_serialize_accounts: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&path, content) {
            warn!("[W-STORE-WRITE] failed_to_persist_accounts: {}", e);
        }
    }

    fn extract_default_account(&self) -> Option<Account> {
        let db_path = crate::auth::database::default_database_path()?;
        match crate::auth::database::extract_credentials_sync(&db_path) {
            Ok(creds) => {
                let mut account = Account::new(creds.email, AccountSource::Database);
                account.database_path = Some(db_path);
                Some(account)
            }
            Err(e) => {
                warn!(
                    "[W-STORE-DB-EXTRACT] default_account_extraction_failed: {}",
                    e
                );
                None
            }
        }
    }

    pub fn load_config(&self) -> RuntimeConfig {
        let path = self.config_path();
        if !path.exists() {
            let config = RuntimeConfig::default();
            self.save_config(&config);
            return config;
        }
        match fs::read_to_string(&path)
            .map_err(|e| format!("failed_to_read_config_file: {}", e))
            .and_then(|content| {
                serde_json::from_str::<RuntimeConfig>(&content)
                    .map_err(|e| format!("failed_to_parse_config_file: {}", e))
            }) {
            Ok(mut config) => {
                if config.normalize() {
                    self.save_config(&config);
                }
                config
            }
            Err(e) => {
                warn!("[W-CONFIG-LOAD] {} (falling back to defaults)", e);
                RuntimeConfig::default()
            }
        }
    }

    pub fn save_config(&self, config: &RuntimeConfig) {
        let path = self.config_path();
        let content = match serde_json::to_string_pretty(config) {
            Ok(c) => c,
            Err(e) => {
                warn!("[W-CONFIG-SERIALIZE] failed_to_serialize_config: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&path, content) {
            warn!("[W-CONFIG-WRITE] failed_to_persist_config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStats;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().to_path_buf())
    }

    fn account(email: &str) -> Account {
        Account::new(email.to_string(), AccountSource::Manual)
    }

    #[test]
    fn load_missing_document_yields_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let doc = store_in(&dir).load();
        assert!(doc.accounts.is_empty());
        assert_eq!(doc.active_index, 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut doc = StoreDocument::default();
        doc.accounts.push(account("a@example.com"));
        doc.accounts.push(account("b@example.com"));
        doc.active_index = 1;
        store.save(&doc);

        let loaded = store.load();
        assert_eq!(loaded.accounts.len(), 2);
        assert_eq!(loaded.active_index, 1);
        assert_eq!(loaded.accounts[0].email, "a@example.com");
    }

    #[test]
    fn out_of_range_active_index_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let doc = StoreDocument {
            accounts: vec![account("a@example.com")],
            active_index: 7,
            ..StoreDocument::default()
        };
        store.save(&doc);

        let loaded = store.load();
        assert_eq!(loaded.active_index, 0);
    }

    #[test]
    fn partial_account_record_hydrates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let raw = serde_json::json!({
            "accounts": [{ "email": "bare@example.com" }],
        });
        fs::write(
            dir.path().join(ACCOUNTS_FILE),
            serde_json::to_string(&raw).unwrap(),
        )
        .unwrap();

        let loaded = store.load();
        let acc = &loaded.accounts[0];
        assert_eq!(acc.source, AccountSource::Oauth);
        assert!(!acc.is_rate_limited);
        assert!(!acc.is_invalid);
        assert_eq!(acc.stats.total(), AccountStats::default().total());
        assert_eq!(loaded.settings.cooldown_duration_ms, 60_000);
    }

    #[test]
    fn corrupt_document_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(dir.path().join(ACCOUNTS_FILE), "{not json").unwrap();

        let loaded = store.load();
        assert!(loaded.accounts.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join(ACCOUNTS_FILE)).unwrap(),
            "{not json"
        );
    }

    #[test]
    fn config_defaults_are_created_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let config = store.load_config();
        assert_eq!(config.port, 8317);
        assert!(dir.path().join(CONFIG_FILE).exists());
    }
}
