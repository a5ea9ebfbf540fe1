//! Extractors (C4): the interface producing [`RawRecord`]s for ingestion,
//! plus the one extractor this store implements directly.
//!
//! Per the system's external interfaces, each source type is backed by a
//! source-specific extractor that talks to an OS-owned framework (mail,
//! calendar, contacts, messages databases) — those are out of scope here and
//! are supplied by the embedding application via [`SourceExtractor`].
//! [`FileExtractor`] is the one concrete implementation this crate owns,
//! since it only needs filesystem access. [`StaticExtractor`] lets tests and
//! the CLI inject a fixed batch of records for the remaining source types
//! without depending on platform frameworks.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::FilesExtractorConfig;
use crate::models::{DocumentType, FileFields, NoteFields, RawRecord, SatelliteFields};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extractor root does not exist: {0}")]
    RootMissing(String),
    #[error("invalid glob pattern: {0}")]
    InvalidGlob(#[from] globset::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Produces [`RawRecord`]s from one external source. Extractor failures are
/// reported to the coordinator, never propagated as a hard ingest failure —
/// implementations should prefer returning a partial batch over erroring out
/// entirely when only some items are unreadable.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// The `app_source` tag this extractor's records carry (e.g. `"files"`).
    fn app_source(&self) -> &str;

    /// Produce the batch of records observed since `since` (epoch seconds),
    /// or all records when `since` is `None` or `full_sync` is true.
    async fn extract(
        &self,
        full_sync: bool,
        since: Option<i64>,
    ) -> Result<Vec<RawRecord>, ExtractError>;
}

/// Extensions treated as binary and copied as metadata-only placeholders
/// rather than decoded as UTF-8 text.
const BINARY_EXTENSIONS: &[&str] = &[".pdf", ".docx", ".pptx", ".xlsx"];

fn binary_content_hint(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        ".pdf" => Some("application/pdf"),
        ".docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        ".pptx" => {
            Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
        }
        ".xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        _ => None,
    }
}

/// Walks a local directory, applies glob include/exclude patterns, and
/// produces one [`RawRecord`] (doc_type `file`) per matching file.
pub struct FileExtractor {
    config: FilesExtractorConfig,
}

impl FileExtractor {
    pub fn new(config: FilesExtractorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceExtractor for FileExtractor {
    fn app_source(&self) -> &str {
        "files"
    }

    async fn extract(
        &self,
        _full_sync: bool,
        since: Option<i64>,
    ) -> Result<Vec<RawRecord>, ExtractError> {
        let config = self.config.clone();
        let since = since.unwrap_or(0);
        tokio::task::spawn_blocking(move || scan_files(&config, since))
            .await
            .expect("file extractor task panicked")
    }
}

fn scan_files(config: &FilesExtractorConfig, since: i64) -> Result<Vec<RawRecord>, ExtractError> {
    let root = &config.root;
    if !root.exists() {
        return Err(ExtractError::RootMissing(root.display().to_string()));
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut records = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let modified_secs = modified
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        if modified_secs < since {
            continue;
        }

        if let Some(record) = file_to_record(path, &rel_str, modified_secs)? {
            records.push(record);
        }
    }

    records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(records)
}

fn file_to_record(
    path: &Path,
    relative_path: &str,
    modified_secs: i64,
) -> Result<Option<RawRecord>, ExtractError> {
    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let timestamp = Utc.timestamp_opt(modified_secs, 0).single().unwrap_or(Utc::now());

    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let is_binary = BINARY_EXTENSIONS.contains(&ext.as_str());
    let mime = binary_content_hint(&ext);

    let content = if is_binary {
        // Binary formats are tracked as metadata-only placeholders; text
        // extraction from office/PDF formats is out of scope for this store.
        format!("[binary file: {relative_path}]")
    } else {
        match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(_) => return Ok(None),
        }
    };

    Ok(Some(RawRecord {
        doc_type: DocumentType::File,
        app_source: "files".to_string(),
        source_id: relative_path.to_string(),
        source_path: Some(format!("file://{}", path.display())),
        title: Some(title),
        content,
        created_at: timestamp,
        updated_at: timestamp,
        metadata_json: "{}".to_string(),
        satellite: SatelliteFields::File(FileFields {
            path: Some(path.display().to_string()),
            mime_type: mime.map(|m| m.to_string()),
        }),
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Injects a fixed, caller-supplied batch of records. Used by the CLI and
/// tests to stand in for the OS-framework extractors (calendar, mail,
/// messages, contacts, whatsapp, notes, reminders) that live outside this
/// crate's boundary.
pub struct StaticExtractor {
    app_source: String,
    records: Vec<RawRecord>,
}

impl StaticExtractor {
    pub fn new(app_source: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            app_source: app_source.into(),
            records,
        }
    }

    /// A StaticExtractor with no records, useful as a placeholder for a
    /// source type that has not been wired up yet — ingest still runs and
    /// reports `items_processed = 0` with a success status, per the
    /// zero-records boundary behavior.
    pub fn empty(app_source: impl Into<String>) -> Self {
        Self::new(app_source, Vec::new())
    }
}

#[async_trait]
impl SourceExtractor for StaticExtractor {
    fn app_source(&self) -> &str {
        &self.app_source
    }

    async fn extract(
        &self,
        full_sync: bool,
        since: Option<i64>,
    ) -> Result<Vec<RawRecord>, ExtractError> {
        let since = since.unwrap_or(0);
        Ok(self
            .records
            .iter()
            .filter(|r| full_sync || r.updated_at.timestamp() >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_extractor_reads_matching_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("note.md"), "hello world").unwrap();
        std::fs::write(dir.path().join("ignore.bin.tmp"), "noise").unwrap();

        let config = FilesExtractorConfig {
            root: dir.path().to_path_buf(),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        };
        let extractor = FileExtractor::new(config);

        let records = extractor.extract(true, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id, "note.md");
        assert_eq!(records[0].content, "hello world");
    }

    #[tokio::test]
    async fn file_extractor_errors_on_missing_root() {
        let config = FilesExtractorConfig {
            root: "/does/not/exist/xyz".into(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        };
        let extractor = FileExtractor::new(config);
        let result = extractor.extract(true, None).await;
        assert!(matches!(result, Err(ExtractError::RootMissing(_))));
    }

    #[tokio::test]
    async fn static_extractor_respects_full_sync_flag() {
        let record = RawRecord {
            doc_type: DocumentType::Note,
            app_source: "notes".into(),
            source_id: "n1".into(),
            source_path: None,
            title: Some("Title".into()),
            content: "body".into(),
            created_at: Utc::now(),
            updated_at: Utc.timestamp_opt(100, 0).unwrap(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Note(NoteFields::default()),
        };
        let extractor = StaticExtractor::new("notes", vec![record]);

        let incremental = extractor.extract(false, Some(200)).await.unwrap();
        assert!(incremental.is_empty());

        let full = extractor.extract(true, Some(200)).await.unwrap();
        assert_eq!(full.len(), 1);
    }

    #[tokio::test]
    async fn empty_extractor_yields_zero_records() {
        let extractor = StaticExtractor::empty("calendar");
        let records = extractor.extract(true, None).await.unwrap();
        assert!(records.is_empty());
    }
}
