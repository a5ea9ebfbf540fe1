//! Tool Registry & Safe Execution (C11).
//!
//! Tools are a closed tagged enum rather than `Box<dyn Tool>` objects — the
//! catalog is fixed at compile time, so dynamic dispatch buys nothing but
//! indirection. Each tool carries an explicit `mutating` flag instead of
//! inferring it from name keywords, since "create"/"delete"/"send" heuristics
//! are easy to dodge with a differently-named tool that does the same thing.
//!
//! Mutating tools go through a dry-run/confirm handshake bound by an
//! `operation_hash`: the first call is forced to `dry_run=true` and returns
//! the hash; the caller must resubmit with `confirm=true` and the same hash
//! or the call aborts with [`ToolError::ConfirmationMismatch`]. Every call —
//! dry-run or real — writes an audit record before its result is returned.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::models::{AuditRecord, DocumentType, NoteFields, RawRecord, ReminderFields, SatelliteFields};
use crate::search::{hybrid_search, SearchType};
use crate::store::{DocumentStore, DocumentStoreError};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    ToolNotFound(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("parameter {name} expected type {expected}, got {actual}")]
    InvalidParameterType {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("confirmation mismatch: expected operation_hash from a prior dry run")]
    ConfirmationMismatch,
    #[error("tool {0} failed: {1}")]
    ProcessFailed(String, String),
    #[error("tool {0} produced output that could not be interpreted: {1}")]
    InvalidOutput(String, String),
    #[error(transparent)]
    Storage(#[from] DocumentStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

impl ParamType {
    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

pub struct ParamSchema {
    pub param_type: ParamType,
    pub required: bool,
    pub description: &'static str,
}

pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub mutating: bool,
    pub parameters: &'static [(&'static str, ParamSchema)],
}

/// The catalog handed to the reasoning loop (C12) and to the
/// `GET /tools` endpoint: name, description, and parameter schema for every
/// registered tool. Fixed at compile time.
pub fn catalog() -> Vec<&'static ToolDefinition> {
    vec![
        &SEARCH_DATA,
        &CREATE_REMINDER,
        &APPEND_NOTE,
        &MOVE_FILE,
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSummary {
    pub name: String,
    pub param_type: &'static str,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: &'static str,
    pub description: &'static str,
    pub mutating: bool,
    pub parameters: Vec<ParamSummary>,
}

/// JSON-serializable view of [`catalog`], for the tool-listing endpoint and
/// for the prompt handed to the reasoning loop's tool-selection call.
pub fn catalog_summary() -> Vec<ToolSummary> {
    catalog()
        .into_iter()
        .map(|def| ToolSummary {
            name: def.name,
            description: def.description,
            mutating: def.mutating,
            parameters: def
                .parameters
                .iter()
                .map(|(name, schema)| ParamSummary {
                    name: name.to_string(),
                    param_type: schema.param_type.name(),
                    required: schema.required,
                    description: schema.description,
                })
                .collect(),
        })
        .collect()
}

static SEARCH_DATA: ToolDefinition = ToolDefinition {
    name: "search_data",
    description: "Search the indexed personal knowledge store for documents matching a query.",
    mutating: false,
    parameters: &[
        (
            "query",
            ParamSchema {
                param_type: ParamType::String,
                required: true,
                description: "free-text search query",
            },
        ),
        (
            "limit",
            ParamSchema {
                param_type: ParamType::Integer,
                required: false,
                description: "maximum number of results to return",
            },
        ),
    ],
};

static CREATE_REMINDER: ToolDefinition = ToolDefinition {
    name: "create_reminder",
    description: "Create a new reminder document.",
    mutating: true,
    parameters: &[
        (
            "title",
            ParamSchema {
                param_type: ParamType::String,
                required: true,
                description: "reminder title",
            },
        ),
        (
            "due_at",
            ParamSchema {
                param_type: ParamType::Integer,
                required: false,
                description: "due time as a unix timestamp",
            },
        ),
    ],
};

static APPEND_NOTE: ToolDefinition = ToolDefinition {
    name: "append_note",
    description: "Append text to an existing note, or create a new one if note_id is absent.",
    mutating: true,
    parameters: &[
        (
            "note_id",
            ParamSchema {
                param_type: ParamType::String,
                required: false,
                description: "id of the note document to append to",
            },
        ),
        (
            "text",
            ParamSchema {
                param_type: ParamType::String,
                required: true,
                description: "text to append",
            },
        ),
    ],
};

static MOVE_FILE: ToolDefinition = ToolDefinition {
    name: "move_file",
    description: "Move a file on disk from one path to another.",
    mutating: true,
    parameters: &[
        (
            "source_path",
            ParamSchema {
                param_type: ParamType::String,
                required: true,
                description: "existing file path",
            },
        ),
        (
            "destination_path",
            ParamSchema {
                param_type: ParamType::String,
                required: true,
                description: "new file path",
            },
        ),
    ],
};

fn definition(name: &str) -> Result<&'static ToolDefinition, ToolError> {
    catalog()
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| ToolError::ToolNotFound(name.to_string()))
}

/// Reserved keys the registry threads through to tools out-of-band; never
/// part of tool-specific validation and always stripped before hashing or
/// execution.
fn is_reserved_key(key: &str) -> bool {
    key.starts_with('_')
}

/// Check `arguments` against a tool's declared schema: required parameters
/// present, types matching, and (in strict mode) no unknown parameters.
pub fn validate(def: &ToolDefinition, arguments: &Value, strict: bool) -> Result<(), ToolError> {
    let object = arguments.as_object().cloned().unwrap_or_default();

    for (name, schema) in def.parameters {
        match object.get(*name) {
            Some(value) if !schema.param_type.matches(value) => {
                return Err(ToolError::InvalidParameterType {
                    name: name.to_string(),
                    expected: schema.param_type.name().to_string(),
                    actual: json_type_name(value).to_string(),
                });
            }
            Some(_) => {}
            None if schema.required => return Err(ToolError::MissingParameter(name.to_string())),
            None => {}
        }
    }

    if strict {
        let known: Vec<&str> = def.parameters.iter().map(|(n, _)| *n).collect();
        for key in object.keys() {
            if is_reserved_key(key) || key == "confirm" || key == "operation_hash" {
                continue;
            }
            if !known.contains(&key.as_str()) {
                return Err(ToolError::UnknownParameter(key.clone()));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonical JSON used for the operation hash: arguments sorted by key with
/// reserved `_*` keys and the protocol fields (`confirm`, `operation_hash`)
/// stripped, so the hash binds only to the tool's semantic input.
fn canonical_arguments(arguments: &Value) -> String {
    let object = arguments.as_object().cloned().unwrap_or_default();
    let sorted: BTreeMap<String, Value> = object
        .into_iter()
        .filter(|(k, _)| !is_reserved_key(k) && k != "confirm" && k != "operation_hash")
        .collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

pub fn operation_hash(tool_name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(canonical_arguments(arguments).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub tool_name: String,
    pub was_dry_run: bool,
    pub is_mutating: bool,
    pub requires_confirmation: bool,
    pub operation_hash: Option<String>,
    /// The plan a dry run was recorded under. A caller must echo this back
    /// unchanged on the confirming call — `find_dry_run_audit` looks up the
    /// prior dry run by `(plan_id, operation_hash)`, so a confirm sent under
    /// a different plan id is rejected even with the right hash.
    pub plan_id: String,
    pub result: Option<Value>,
}

/// Call context threaded through to the audit record; `correlation_id` and
/// `plan_id` tie a reasoning loop's retries and a dry-run/confirm pair
/// together respectively.
pub struct CallContext {
    pub correlation_id: String,
    pub plan_id: String,
    pub step_index: i64,
}

pub struct ToolRegistry<'a> {
    store: &'a DocumentStore,
    config: &'a Config,
    provider: &'a dyn EmbeddingProvider,
}

impl<'a> ToolRegistry<'a> {
    pub fn new(store: &'a DocumentStore, config: &'a Config, provider: &'a dyn EmbeddingProvider) -> Self {
        Self {
            store,
            config,
            provider,
        }
    }

    /// Invoke `tool_name` with `arguments`. Mutating tools without
    /// `confirm=true` are forced into a dry run; a confirm with a stale or
    /// missing `operation_hash` aborts before anything executes. An audit
    /// record is written for every call, successful or not, before the
    /// result is returned to the caller.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        confirm: bool,
        claimed_hash: Option<&str>,
        ctx: &CallContext,
    ) -> Result<CallResult, ToolError> {
        let started = Utc::now();
        let outcome = self
            .call_inner(tool_name, &arguments, confirm, claimed_hash, ctx)
            .await;

        let duration_ms = (Utc::now() - started).num_milliseconds().max(0);
        let hash = operation_hash(tool_name, &arguments);

        let (is_dry_run, result_json, error) = match &outcome {
            Ok(call_result) => (
                call_result.was_dry_run,
                call_result
                    .result
                    .as_ref()
                    .and_then(|v| serde_json::to_string(v).ok()),
                None,
            ),
            Err(e) => (!confirm, None, Some(e.to_string())),
        };

        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            correlation_id: ctx.correlation_id.clone(),
            plan_id: ctx.plan_id.clone(),
            step_index: ctx.step_index,
            tool_name: tool_name.to_string(),
            arguments_json: serde_json::to_string(&arguments).unwrap_or_default(),
            is_dry_run,
            result_json,
            error,
            duration_ms,
            operation_hash: Some(hash),
            created_at: started.timestamp(),
        };
        self.store.record_audit(&record).await?;

        outcome
    }

    async fn call_inner(
        &self,
        tool_name: &str,
        arguments: &Value,
        confirm: bool,
        claimed_hash: Option<&str>,
        ctx: &CallContext,
    ) -> Result<CallResult, ToolError> {
        let def = definition(tool_name)?;
        validate(def, arguments, true)?;

        let hash = operation_hash(tool_name, arguments);

        if def.mutating {
            if !confirm {
                return Ok(CallResult {
                    tool_name: tool_name.to_string(),
                    was_dry_run: true,
                    is_mutating: true,
                    requires_confirmation: true,
                    operation_hash: Some(hash),
                    plan_id: ctx.plan_id.clone(),
                    result: None,
                });
            }
            if claimed_hash != Some(hash.as_str()) {
                return Err(ToolError::ConfirmationMismatch);
            }
            // The safety invariant binds confirm to a prior dry run, not
            // merely to a hash the caller could compute themselves without
            // ever executing one.
            let prior_dry_run = self
                .store
                .find_dry_run_audit(&ctx.plan_id, &hash)
                .await?;
            if prior_dry_run.is_none() {
                return Err(ToolError::ConfirmationMismatch);
            }
        }

        let result = self.execute(tool_name, arguments).await?;

        Ok(CallResult {
            tool_name: tool_name.to_string(),
            was_dry_run: false,
            is_mutating: def.mutating,
            requires_confirmation: false,
            operation_hash: Some(hash),
            plan_id: ctx.plan_id.clone(),
            result: Some(result),
        })
    }

    async fn execute(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolError> {
        match tool_name {
            "search_data" => self.execute_search_data(arguments).await,
            "create_reminder" => self.execute_create_reminder(arguments).await,
            "append_note" => self.execute_append_note(arguments).await,
            "move_file" => self.execute_move_file(arguments).await,
            other => Err(ToolError::ToolNotFound(other.to_string())),
        }
    }

    async fn execute_search_data(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = string_arg(arguments, "query")?;
        let limit = integer_arg(arguments, "limit").unwrap_or(self.config.retrieval.final_limit);

        let response = hybrid_search(self.store, self.config, self.provider, &query, &[], limit)
            .await
            .map_err(|e| ToolError::ProcessFailed("search_data".to_string(), e.to_string()))?;

        Ok(serde_json::json!({
            "results": response.results,
            "search_type": matches!(response.search_type, SearchType::Hybrid)
                .then(|| "hybrid")
                .unwrap_or("bm25_only"),
        }))
    }

    async fn execute_create_reminder(&self, arguments: &Value) -> Result<Value, ToolError> {
        let title = string_arg(arguments, "title")?;
        let due_at = integer_arg(arguments, "due_at");
        let now = Utc::now();

        let record = RawRecord {
            doc_type: DocumentType::Reminder,
            app_source: "reminders".to_string(),
            source_id: Uuid::new_v4().to_string(),
            source_path: None,
            title: Some(title.clone()),
            content: title,
            created_at: now,
            updated_at: now,
            metadata_json: "{}".to_string(),
            satellite: SatelliteFields::Reminder(ReminderFields {
                due_at,
                completed: false,
            }),
        };

        let (id, _) = self
            .store
            .upsert_document(&record, now.timestamp())
            .await?;
        self.store.upsert_satellite(&id, &record.satellite).await?;

        let chunks = crate::chunk::chunk_document(
            &id,
            record.doc_type,
            &record.content,
            self.config.chunking.max_chunk_size,
            self.config.chunking.overlap,
        )
        .map_err(|e| ToolError::ProcessFailed("create_reminder".to_string(), e.to_string()))?;
        self.store.replace_chunks(&id, &chunks).await?;

        Ok(serde_json::json!({ "document_id": id }))
    }

    async fn execute_append_note(&self, arguments: &Value) -> Result<Value, ToolError> {
        let text = string_arg(arguments, "text")?;
        let note_id = arguments.get("note_id").and_then(|v| v.as_str());
        let now = Utc::now();

        let (id, content, source_id) = match note_id {
            Some(existing_id) => {
                let detail = self
                    .store
                    .get_document(existing_id)
                    .await?
                    .ok_or_else(|| {
                        ToolError::ProcessFailed(
                            "append_note".to_string(),
                            format!("no such note: {existing_id}"),
                        )
                    })?;
                let combined = format!("{}\n{}", detail.document.content, text);
                (
                    Some(detail.document.id),
                    combined,
                    detail.document.source_id,
                )
            }
            None => (None, text, Uuid::new_v4().to_string()),
        };

        let record = RawRecord {
            doc_type: DocumentType::Note,
            app_source: "notes".to_string(),
            source_id,
            source_path: None,
            title: None,
            content,
            created_at: now,
            updated_at: now,
            metadata_json: "{}".to_string(),
            satellite: SatelliteFields::Note(NoteFields::default()),
        };

        let (document_id, _) = self
            .store
            .upsert_document(&record, now.timestamp())
            .await?;
        debug_assert!(note_id.is_none() || id.as_deref() == Some(document_id.as_str()));
        self.store
            .upsert_satellite(&document_id, &record.satellite)
            .await?;

        let chunks = crate::chunk::chunk_document(
            &document_id,
            record.doc_type,
            &record.content,
            self.config.chunking.max_chunk_size,
            self.config.chunking.overlap,
        )
        .map_err(|e| ToolError::ProcessFailed("append_note".to_string(), e.to_string()))?;
        self.store.replace_chunks(&document_id, &chunks).await?;

        Ok(serde_json::json!({ "document_id": document_id }))
    }

    async fn execute_move_file(&self, arguments: &Value) -> Result<Value, ToolError> {
        let source = string_arg(arguments, "source_path")?;
        let destination = string_arg(arguments, "destination_path")?;

        let source_path = std::path::PathBuf::from(&source);
        let destination_path = std::path::PathBuf::from(&destination);

        tokio::task::spawn_blocking(move || std::fs::rename(&source_path, &destination_path))
            .await
            .map_err(|e| ToolError::ProcessFailed("move_file".to_string(), e.to_string()))?
            .map_err(|e| ToolError::ProcessFailed("move_file".to_string(), e.to_string()))?;

        Ok(serde_json::json!({ "source_path": source, "destination_path": destination }))
    }
}

fn string_arg(arguments: &Value, name: &str) -> Result<String, ToolError> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::MissingParameter(name.to_string()))
}

fn integer_arg(arguments: &Value, name: &str) -> Option<i64> {
    arguments.get(name).and_then(|v| v.as_i64())
}
