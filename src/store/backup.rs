use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::constants::BACKUP_RETENTION;

const BACKUPS_DIR: &str = "backups";
const BACKUP_FILES: &[&str] = &["config.json", "accounts.json"];

#[derive(Debug, Clone, Serialize)]
pub struct BackupDescriptor {
    pub name: String,
    pub label: Option<String>,
    pub created_at: i64,
    pub files: Vec<String>,
}

fn backups_root(data_dir: &Path) -> PathBuf {
    data_dir.join(BACKUPS_DIR)
}

/// Snapshot the current config and accounts documents into a timestamped
/// folder. Missing source files are skipped, not errors: a fresh install may
/// not have written both yet.
pub fn create_backup(data_dir: &Path, label: Option<&str>) -> Result<BackupDescriptor, String> {
    let now = chrono::Utc::now();
    let name = match label {
        Some(l) if !l.trim().is_empty() => {
            format!("{}-{}", now.format("%Y%m%d-%H%M%S"), sanitize_label(l))
        }
        _ => now.format("%Y%m%d-%H%M%S").to_string(),
    };
    let dir = backups_root(data_dir).join(&name);
    fs::create_dir_all(&dir).map_err(|e| format!("failed_to_create_backup_dir: {}", e))?;

    let mut copied = Vec::new();
    for file in BACKUP_FILES {
        let src = data_dir.join(file);
        if !src.exists() {
            continue;
        }
        let dst = dir.join(file);
        fs::copy(&src, &dst).map_err(|e| format!("failed_to_copy_{}: {}", file, e))?;
        copied.push((*file).to_string());
    }

    info!("Created backup {} ({} file(s))", name, copied.len());
    prune_old_backups(data_dir);

    Ok(BackupDescriptor {
        name,
        label: label.map(|l| l.to_string()),
        created_at: now.timestamp_millis(),
        files: copied,
    })
}

/// Enumerate stored backups, newest first.
pub fn list_backups(data_dir: &Path) -> Vec<BackupDescriptor> {
    let root = backups_root(data_dir);
    let Ok(entries) = fs::read_dir(&root) else {
        return Vec::new();
    };

    let mut backups: Vec<BackupDescriptor> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let created_at = e
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let files = fs::read_dir(e.path())
                .map(|files| {
                    files
                        .flatten()
                        .map(|f| f.file_name().to_string_lossy().to_string())
                        .collect()
                })
                .unwrap_or_default();
            BackupDescriptor {
                name,
                label: None,
                created_at,
                files,
            }
        })
        .collect();

    backups.sort_by(|a, b| b.name.cmp(&a.name));
    backups
}

fn prune_old_backups(data_dir: &Path) {
    let backups = list_backups(data_dir);
    if backups.len() <= BACKUP_RETENTION {
        return;
    }
    for old in &backups[BACKUP_RETENTION..] {
        let path = backups_root(data_dir).join(&old.name);
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!("[W-BACKUP-PRUNE] failed_to_remove_backup {:?}: {}", path, e);
        } else {
            info!("Pruned old backup: {}", old.name);
        }
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect()
}
