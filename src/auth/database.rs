use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;

use crate::constants::DB_EXTRACT_TIMEOUT_SECS;
use crate::error::{AppError, AppResult};

/// Key under which the IDE stores its Cloud Code credentials in the local
/// state database (a key/value `ItemTable`, VS Code layout).
const CREDENTIALS_KEY: &str = "cloudcode.authenticatedUser";

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedCredentials {
    pub email: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Well-known location of the IDE state database, platform-dependent.
pub fn default_database_path() -> Option<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir()?.join("Library/Application Support")
    } else if cfg!(target_os = "windows") {
        dirs::data_dir()?
    } else {
        dirs::config_dir()?
    };
    let path = base.join("CloudCode/User/globalStorage/state.vscdb");
    path.exists().then_some(path)
}

/// Synchronous extraction, used at boot for the default-account fallback.
pub fn extract_credentials_sync(db_path: &Path) -> AppResult<ExtractedCredentials> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| AppError::Account(format!("failed_to_open_credential_database: {}", e)))?;
    conn.busy_timeout(Duration::from_secs(DB_EXTRACT_TIMEOUT_SECS))?;

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            [CREDENTIALS_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let raw = value.ok_or_else(|| AppError::Account("no_credentials_in_database".to_string()))?;
    serde_json::from_str::<ExtractedCredentials>(&raw)
        .map_err(|e| AppError::Account(format!("failed_to_parse_stored_credentials: {}", e)))
}

/// Async extraction with the 5 s budget. The sqlite read happens on the
/// blocking pool; exceeding the budget is an auth failure.
pub async fn extract_credentials(db_path: &Path) -> AppResult<ExtractedCredentials> {
    let path = db_path.to_path_buf();
    let work = tokio::task::spawn_blocking(move || extract_credentials_sync(&path));

    match tokio::time::timeout(Duration::from_secs(DB_EXTRACT_TIMEOUT_SECS), work).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AppError::Account(format!(
            "credential_extraction_panicked: {}",
            join_err
        ))),
        Err(_) => Err(AppError::Auth(format!(
            "credential_extraction_timed_out_after_{}s",
            DB_EXTRACT_TIMEOUT_SECS
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_database(dir: &tempfile::TempDir, value: &str) -> PathBuf {
        let path = dir.path().join("state.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
            [CREDENTIALS_KEY, value],
        )
        .unwrap();
        path
    }

    #[test]
    fn extracts_credentials_from_item_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_database(
            &dir,
            r#"{"email":"dev@example.com","refresh_token":"1//rt","project_id":"proj-1"}"#,
        );

        let creds = extract_credentials_sync(&path).unwrap();
        assert_eq!(creds.email, "dev@example.com");
        assert_eq!(creds.refresh_token.as_deref(), Some("1//rt"));
        assert_eq!(creds.project_id.as_deref(), Some("proj-1"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )
        .unwrap();
        drop(conn);

        let err = extract_credentials_sync(&path).unwrap_err();
        assert!(err.to_string().contains("no_credentials_in_database"));
    }

    #[tokio::test]
    async fn async_extraction_matches_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_database(&dir, r#"{"email":"dev@example.com"}"#);

        let creds = extract_credentials(&path).await.unwrap();
        assert_eq!(creds.email, "dev@example.com");
        assert!(creds.refresh_token.is_none());
    }

    #[tokio::test]
    async fn unreadable_database_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.vscdb");
        let err = extract_credentials(&path).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("failed_to_open_credential_database"));
    }
}
