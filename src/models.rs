//! Core data types shared across the store, ingestion, and retrieval modules.
//!
//! [`Document`] is the unit of search; [`Chunk`] and [`Embedding`] are its
//! indexed slices; [`Relationship`] links documents to each other; satellite
//! structs (`EmailFields`, `EventFields`, …) carry the per-type fields a
//! [`DocumentType`] needs beyond the common envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven personal-data kinds the indexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Email,
    Event,
    Reminder,
    Note,
    File,
    Message,
    Contact,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Email => "email",
            DocumentType::Event => "event",
            DocumentType::Reminder => "reminder",
            DocumentType::Note => "note",
            DocumentType::File => "file",
            DocumentType::Message => "message",
            DocumentType::Contact => "contact",
        }
    }

    /// Whole-content chunking applies to short, already-atomic records.
    pub fn is_short_atomic(&self) -> bool {
        matches!(
            self,
            DocumentType::Event | DocumentType::Contact | DocumentType::Message
        )
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(DocumentType::Email),
            "event" => Ok(DocumentType::Event),
            "reminder" => Ok(DocumentType::Reminder),
            "note" => Ok(DocumentType::Note),
            "file" => Ok(DocumentType::File),
            "message" => Ok(DocumentType::Message),
            "contact" => Ok(DocumentType::Contact),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

/// Raw record produced by a [`crate::extractors::SourceExtractor`] before normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub doc_type: DocumentType,
    pub app_source: String,
    pub source_id: String,
    pub source_path: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata_json: String,
    pub satellite: SatelliteFields,
}

/// The unit of search. Uniqueness is enforced on (`app_source`, `source_id`) and on `hash`.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub doc_type: DocumentType,
    pub title: Option<String>,
    pub content: String,
    pub app_source: String,
    pub source_id: String,
    pub source_path: Option<String>,
    pub hash: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
    pub deleted: bool,
    pub metadata_json: String,
}

/// Per-type fields, one variant per [`DocumentType`], persisted in a satellite table.
#[derive(Debug, Clone)]
pub enum SatelliteFields {
    Email(EmailFields),
    Event(EventFields),
    Reminder(ReminderFields),
    Note(NoteFields),
    File(FileFields),
    Message(MessageFields),
    Contact(ContactFields),
}

#[derive(Debug, Clone, Default)]
pub struct EmailFields {
    pub thread_id: Option<String>,
    pub from_addr: Option<String>,
    pub to_addrs: Option<String>,
    pub cc_addrs: Option<String>,
    pub mailbox: Option<String>,
    pub is_read: bool,
    pub is_flagged: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventFields {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReminderFields {
    pub due_at: Option<i64>,
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NoteFields {
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileFields {
    pub path: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFields {
    pub thread_id: Option<String>,
    pub from_contact: Option<String>,
    pub is_from_me: bool,
    pub service: Option<String>,
    pub chat_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContactFields {
    pub display_name: Option<String>,
    pub organization: Option<String>,
}

/// A contiguous text slice of a [`Document`], totally ordered by `chunk_index`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub hash: String,
    /// `{type, index}` — the chunking policy that produced this chunk
    /// (`"short_atomic"` or `"long_prose"`) and its `chunk_index`, kept
    /// denormalized here since callers read it alongside the chunk far more
    /// often than they'd join back to the chunking policy itself.
    pub metadata: serde_json::Value,
}

/// A directed typed edge between two documents (e.g. `sent_message`, `mentioned_in_note`).
#[derive(Debug, Clone)]
pub struct Relationship {
    pub from_document_id: String,
    pub to_document_id: String,
    pub relationship_type: String,
    pub strength: f64,
    pub created_at: i64,
}

/// Append-only record of a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub correlation_id: String,
    pub plan_id: String,
    pub step_index: i64,
    pub tool_name: String,
    pub arguments_json: String,
    pub is_dry_run: bool,
    pub result_json: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub operation_hash: Option<String>,
    pub created_at: i64,
}

/// Per-source outcome of a single ingest run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub source: String,
    pub status: IngestStatus,
    pub items_processed: u64,
    pub items_created: u64,
    pub items_updated: u64,
    pub items_tombstoned: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    Failed,
    Warning,
    Skipped,
}

/// A row returned from the hybrid/lexical/vector search pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub title: Option<String>,
    pub snippet: String,
    pub app_source: String,
    pub source_path: Option<String>,
    pub bm25_score: f64,
    pub embedding_score: f64,
    pub score: f64,
}
