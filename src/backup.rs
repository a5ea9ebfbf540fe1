//! Backup (§6): copies the store file byte-for-byte to the backup directory
//! before a mutating sync, per the concurrency & safety envelope.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("database file not found at {0}")]
    SourceMissing(String),
    #[error("backup write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Copy the configured store file to `backup_dir` (defaulting to the
/// store's own parent directory) as `kenny_backup_YYYYMMDD_HHMMSS.db`, then
/// emit the `BACKUP_SUMMARY` line the coordinator parses.
pub async fn backup_store(config: &Config) -> Result<PathBuf, BackupError> {
    let db_path = config.db.path.clone();
    let backup_dir = config
        .db
        .backup_dir
        .clone()
        .or_else(|| db_path.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    tokio::task::spawn_blocking(move || copy_backup(&db_path, &backup_dir))
        .await
        .expect("backup task panicked")
}

fn copy_backup(db_path: &std::path::Path, backup_dir: &std::path::Path) -> Result<PathBuf, BackupError> {
    if !db_path.exists() {
        return Err(BackupError::SourceMissing(db_path.display().to_string()));
    }

    std::fs::create_dir_all(backup_dir)?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = backup_dir.join(format!("kenny_backup_{timestamp}.db"));

    std::fs::copy(db_path, &backup_path)?;

    let size_mib = std::fs::metadata(&backup_path)?.len() as f64 / (1024.0 * 1024.0);
    println!(
        "BACKUP_SUMMARY: path={}, size={:.2}MiB",
        backup_path.display(),
        size_mib
    );

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use tempfile::tempdir;

    fn config_for(db_path: PathBuf, backup_dir: Option<PathBuf>) -> Config {
        let toml = format!(
            r#"
            [db]
            path = "{}"
            {}

            [chunking]
            max_chunk_size = 512
            overlap = 50
            [retrieval]
            [server]
            bind = "127.0.0.1:8080"
            "#,
            db_path.display(),
            backup_dir
                .map(|d| format!("backup_dir = \"{}\"", d.display()))
                .unwrap_or_default(),
        );
        let mut config: Config = toml::from_str(&toml).unwrap();
        config.environment = Environment::Testing;
        config
    }

    #[tokio::test]
    async fn backs_up_existing_store_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("kenny.db");
        std::fs::write(&db_path, b"fake sqlite contents").unwrap();

        let backup_dir = dir.path().join("backups");
        let config = config_for(db_path, Some(backup_dir.clone()));

        let path = backup_store(&config).await.unwrap();
        assert!(path.starts_with(&backup_dir));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("kenny_backup_"));
        assert_eq!(std::fs::read(&path).unwrap(), b"fake sqlite contents");
    }

    #[tokio::test]
    async fn errors_when_store_file_missing() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("missing.db");
        let config = config_for(db_path, None);

        let result = backup_store(&config).await;
        assert!(matches!(result, Err(BackupError::SourceMissing(_))));
    }
}
