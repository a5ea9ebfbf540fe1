//! Document Model & Invariants (C3): canonical hashing, dedup/upsert,
//! tombstoning, and the satellite/chunk/embedding/relationship/audit
//! persistence operations built on top of the Connection Broker.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use thiserror::Error;

use crate::broker::{BrokerError, ConnectionBroker};
use crate::db::{deserialize_f32, serialize_f32, StorageError};
use crate::models::{
    AuditRecord, Chunk, ContactFields, Document, DocumentType, EmailFields, EventFields,
    FileFields, MessageFields, NoteFields, RawRecord, ReminderFields, Relationship,
    SatelliteFields,
};

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of [`DocumentStore::upsert_document`], per the C3 insert contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No existing row for (app_source, source_id): a new row was inserted.
    Inserted,
    /// An existing row's hash differed: mutable fields were updated in place.
    Updated,
    /// An existing row's hash matched: only `last_seen_at` was bumped.
    Seen,
}

pub struct DocumentDetail {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

/// One record's outcome within a [`DocumentStore::ingest_batch`] call.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub document_id: String,
    pub outcome: UpsertOutcome,
}

pub struct DocumentStore {
    broker: ConnectionBroker,
}

impl DocumentStore {
    pub fn new(broker: ConnectionBroker) -> Self {
        Self { broker }
    }

    /// Run a read-only query directly against the pool's concurrent
    /// readers. No write path may reach for this — writes go through
    /// `self.broker.execute`/`self.broker.transaction` so the single-writer
    /// guarantee (C2) actually holds.
    pub fn read_pool(&self) -> &sqlx::SqlitePool {
        self.broker.pool()
    }

    /// Insert or update a Document from a raw record, returning which of the
    /// three C3 outcomes occurred. The canonical hash covers `source_id`,
    /// `title`, and `content` — the stable textual fields named in the
    /// document model. The lookup-then-branch-then-write sequence runs as a
    /// single broker job so a concurrent upsert on the same
    /// (app_source, source_id) can't race between the read and the write.
    pub async fn upsert_document(
        &self,
        record: &RawRecord,
        now: i64,
    ) -> Result<(String, UpsertOutcome), DocumentStoreError> {
        let hash = canonical_hash(&record.source_id, record.title.as_deref(), &record.content);
        let record = record.clone();

        let outcome = self
            .broker
            .execute(move |pool| {
                Box::pin(async move {
                    let existing = sqlx::query(
                        "SELECT id, hash FROM documents WHERE app_source = ? AND source_id = ?",
                    )
                    .bind(&record.app_source)
                    .bind(&record.source_id)
                    .fetch_optional(pool)
                    .await?;

                    if let Some(row) = existing {
                        let id: String = row.get("id");
                        let existing_hash: String = row.get("hash");

                        if existing_hash == hash {
                            sqlx::query("UPDATE documents SET last_seen_at = ? WHERE id = ?")
                                .bind(now)
                                .bind(&id)
                                .execute(pool)
                                .await?;
                            return Ok((id, UpsertOutcome::Seen));
                        }

                        sqlx::query(
                            r#"
                            UPDATE documents SET
                                title = ?, content = ?, source_path = ?, hash = ?,
                                updated_at = ?, last_seen_at = ?, deleted = 0, metadata_json = ?
                            WHERE id = ?
                            "#,
                        )
                        .bind(&record.title)
                        .bind(&record.content)
                        .bind(&record.source_path)
                        .bind(&hash)
                        .bind(record.updated_at.timestamp())
                        .bind(now)
                        .bind(&record.metadata_json)
                        .bind(&id)
                        .execute(pool)
                        .await?;

                        return Ok((id, UpsertOutcome::Updated));
                    }

                    let id = uuid::Uuid::new_v4().to_string();
                    sqlx::query(
                        r#"
                        INSERT INTO documents
                            (id, doc_type, title, content, app_source, source_id, source_path,
                             hash, created_at, updated_at, last_seen_at, deleted, metadata_json)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                        "#,
                    )
                    .bind(&id)
                    .bind(record.doc_type.as_str())
                    .bind(&record.title)
                    .bind(&record.content)
                    .bind(&record.app_source)
                    .bind(&record.source_id)
                    .bind(&record.source_path)
                    .bind(&hash)
                    .bind(record.created_at.timestamp())
                    .bind(record.updated_at.timestamp())
                    .bind(now)
                    .bind(&record.metadata_json)
                    .execute(pool)
                    .await?;

                    Ok((id, UpsertOutcome::Inserted))
                })
            })
            .await??;

        Ok(outcome)
    }

    /// Insert or replace the per-type satellite row for a document.
    pub async fn upsert_satellite(
        &self,
        document_id: &str,
        fields: &SatelliteFields,
    ) -> Result<(), DocumentStoreError> {
        match fields {
            SatelliteFields::Email(f) => self.upsert_email(document_id, f).await,
            SatelliteFields::Event(f) => self.upsert_event(document_id, f).await,
            SatelliteFields::Reminder(f) => self.upsert_reminder(document_id, f).await,
            SatelliteFields::Note(f) => self.upsert_note(document_id, f).await,
            SatelliteFields::File(f) => self.upsert_file(document_id, f).await,
            SatelliteFields::Message(f) => self.upsert_message(document_id, f).await,
            SatelliteFields::Contact(f) => self.upsert_contact(document_id, f).await,
        }
    }

    async fn upsert_email(
        &self,
        document_id: &str,
        f: &EmailFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO email_fields (document_id, thread_id, from_addr, to_addrs, cc_addrs, mailbox, is_read, is_flagged)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET
                            thread_id = excluded.thread_id, from_addr = excluded.from_addr,
                            to_addrs = excluded.to_addrs, cc_addrs = excluded.cc_addrs,
                            mailbox = excluded.mailbox, is_read = excluded.is_read, is_flagged = excluded.is_flagged
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.thread_id)
                    .bind(f.from_addr)
                    .bind(f.to_addrs)
                    .bind(f.cc_addrs)
                    .bind(f.mailbox)
                    .bind(f.is_read)
                    .bind(f.is_flagged)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_event(
        &self,
        document_id: &str,
        f: &EventFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO event_fields (document_id, start, end, location)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET
                            start = excluded.start, end = excluded.end, location = excluded.location
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.start)
                    .bind(f.end)
                    .bind(f.location)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_reminder(
        &self,
        document_id: &str,
        f: &ReminderFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO reminder_fields (document_id, due_at, completed)
                        VALUES (?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET
                            due_at = excluded.due_at, completed = excluded.completed
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.due_at)
                    .bind(f.completed)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_note(
        &self,
        document_id: &str,
        f: &NoteFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO note_fields (document_id, folder) VALUES (?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET folder = excluded.folder
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.folder)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_file(
        &self,
        document_id: &str,
        f: &FileFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO file_fields (document_id, path, mime_type) VALUES (?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET path = excluded.path, mime_type = excluded.mime_type
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.path)
                    .bind(f.mime_type)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_message(
        &self,
        document_id: &str,
        f: &MessageFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO message_fields (document_id, thread_id, from_contact, is_from_me, service, chat_name)
                        VALUES (?, ?, ?, ?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET
                            thread_id = excluded.thread_id, from_contact = excluded.from_contact,
                            is_from_me = excluded.is_from_me, service = excluded.service, chat_name = excluded.chat_name
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.thread_id)
                    .bind(f.from_contact)
                    .bind(f.is_from_me)
                    .bind(f.service)
                    .bind(f.chat_name)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    async fn upsert_contact(
        &self,
        document_id: &str,
        f: &ContactFields,
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let f = f.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO contact_fields (document_id, display_name, organization) VALUES (?, ?, ?)
                        ON CONFLICT(document_id) DO UPDATE SET
                            display_name = excluded.display_name, organization = excluded.organization
                        "#,
                    )
                    .bind(document_id)
                    .bind(f.display_name)
                    .bind(f.organization)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    /// Atomically replace all chunks (and their embeddings) for a document.
    pub async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<(), DocumentStoreError> {
        let document_id = document_id.to_string();
        let chunks = chunks.to_vec();

        self.broker
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
                        .bind(&document_id)
                        .execute(&mut **tx)
                        .await?;
                    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                        .bind(&document_id)
                        .execute(&mut **tx)
                        .await?;

                    for chunk in &chunks {
                        sqlx::query(
                            r#"
                            INSERT INTO chunks (id, document_id, chunk_index, text, start_offset, end_offset, hash, metadata_json)
                            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                            "#,
                        )
                        .bind(&chunk.id)
                        .bind(&chunk.document_id)
                        .bind(chunk.chunk_index)
                        .bind(&chunk.text)
                        .bind(chunk.start_offset)
                        .bind(chunk.end_offset)
                        .bind(&chunk.hash)
                        .bind(chunk.metadata.to_string())
                        .execute(&mut **tx)
                        .await?;
                    }

                    Ok(())
                })
            })
            .await?;

        Ok(())
    }

    /// Persist a chunk's embedding. Callers must already have L2-normalized
    /// `vector` (the boundary rule: normalize once, here, never elsewhere).
    pub async fn upsert_embedding(
        &self,
        chunk_id: &str,
        document_id: &str,
        model: &str,
        dimensions: usize,
        vector: &[f32],
    ) -> Result<(), DocumentStoreError> {
        let blob = serialize_f32(vector);
        let now = Utc::now().timestamp();
        let chunk_id = chunk_id.to_string();
        let document_id = document_id.to_string();
        let model = model.to_string();

        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO embeddings (chunk_id, document_id, model, dimensions, vector, created_at)
                        VALUES (?, ?, ?, ?, ?, ?)
                        ON CONFLICT(chunk_id) DO UPDATE SET
                            model = excluded.model, dimensions = excluded.dimensions,
                            vector = excluded.vector, created_at = excluded.created_at
                        "#,
                    )
                    .bind(chunk_id)
                    .bind(document_id)
                    .bind(model)
                    .bind(dimensions as i64)
                    .bind(blob)
                    .bind(now)
                    .execute(pool)
                    .await
                })
            })
            .await??;

        Ok(())
    }

    /// Decode a stored embedding blob back into a float vector.
    pub fn decode_vector(blob: &[u8]) -> Vec<f32> {
        deserialize_f32(blob)
    }

    /// Delete every persisted embedding, for a model change or dimension
    /// migration that needs every chunk re-embedded from scratch.
    pub async fn delete_all_embeddings(&self) -> Result<(), DocumentStoreError> {
        self.broker
            .execute(|pool| Box::pin(async move { sqlx::query("DELETE FROM embeddings").execute(pool).await }))
            .await??;
        Ok(())
    }

    /// Mark documents in `app_source` not seen since `sync_started_at` as
    /// tombstoned. Returns the number of rows newly tombstoned.
    pub async fn tombstone_not_seen_since(
        &self,
        app_source: &str,
        sync_started_at: i64,
    ) -> Result<u64, DocumentStoreError> {
        let app_source = app_source.to_string();
        let result = self
            .broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE documents SET deleted = 1 WHERE app_source = ? AND last_seen_at < ? AND deleted = 0",
                    )
                    .bind(app_source)
                    .bind(sync_started_at)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(result.rows_affected())
    }

    pub async fn record_relationship(
        &self,
        rel: &Relationship,
    ) -> Result<(), DocumentStoreError> {
        let rel = rel.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO relationships (from_document_id, to_document_id, relationship_type, strength, created_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(from_document_id, to_document_id, relationship_type) DO UPDATE SET
                            strength = excluded.strength
                        "#,
                    )
                    .bind(rel.from_document_id)
                    .bind(rel.to_document_id)
                    .bind(rel.relationship_type)
                    .bind(rel.strength)
                    .bind(rel.created_at)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    /// Ingest a batch of records inside a single transaction: hash-dedup,
    /// Document upsert, satellite upsert, and relationship emission all
    /// commit or roll back together, so a failure partway through a batch
    /// leaves no partial writes from that batch behind. Chunking and
    /// embedding happen after this returns, outside any transaction — they
    /// are CPU/network-bound work, not part of the row-level atomicity a
    /// batch guarantees.
    pub async fn ingest_batch(
        &self,
        records: &[RawRecord],
        now: i64,
    ) -> Result<Vec<BatchOutcome>, DocumentStoreError> {
        let records = records.to_vec();
        let outcomes = self
            .broker
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut outcomes = Vec::with_capacity(records.len());
                    for record in &records {
                        let (document_id, outcome) = upsert_document_tx(tx, record, now).await?;
                        upsert_satellite_tx(tx, &document_id, &record.satellite).await?;
                        emit_relationships_tx(tx, &document_id, &record.satellite, now).await?;
                        outcomes.push(BatchOutcome {
                            document_id,
                            outcome,
                        });
                    }
                    Ok(outcomes)
                })
            })
            .await?;
        Ok(outcomes)
    }

    /// Persist a sync checkpoint (the last successful `last_seen_at` cursor
    /// for a source), so the next incremental sync knows where to resume.
    pub async fn save_sync_checkpoint(
        &self,
        app_source: &str,
        last_sync_at: i64,
    ) -> Result<(), DocumentStoreError> {
        let app_source = app_source.to_string();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO sync_checkpoints (app_source, last_sync_at) VALUES (?, ?)
                        ON CONFLICT(app_source) DO UPDATE SET last_sync_at = excluded.last_sync_at
                        "#,
                    )
                    .bind(app_source)
                    .bind(last_sync_at)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    pub async fn get_document(
        &self,
        id: &str,
    ) -> Result<Option<DocumentDetail>, DocumentStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, doc_type, title, content, app_source, source_id, source_path,
                   hash, created_at, updated_at, last_seen_at, deleted, metadata_json
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.read_pool())
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let doc_type_str: String = row.get("doc_type");
        let document = Document {
            id: row.get("id"),
            doc_type: doc_type_str.parse().unwrap_or(DocumentType::Note),
            title: row.get("title"),
            content: row.get("content"),
            app_source: row.get("app_source"),
            source_id: row.get("source_id"),
            source_path: row.get("source_path"),
            hash: row.get("hash"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_seen_at: row.get("last_seen_at"),
            deleted: row.get::<i64, _>("deleted") != 0,
            metadata_json: row.get("metadata_json"),
        };

        let chunk_rows = sqlx::query(
            "SELECT id, document_id, chunk_index, text, start_offset, end_offset, hash, metadata_json FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(id)
        .fetch_all(self.read_pool())
        .await?;

        let chunks = chunk_rows
            .iter()
            .map(|r| {
                let metadata_json: String = r.get("metadata_json");
                Chunk {
                    id: r.get("id"),
                    document_id: r.get("document_id"),
                    chunk_index: r.get("chunk_index"),
                    text: r.get("text"),
                    start_offset: r.get("start_offset"),
                    end_offset: r.get("end_offset"),
                    hash: r.get("hash"),
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                }
            })
            .collect();

        Ok(Some(DocumentDetail { document, chunks }))
    }

    pub async fn record_audit(&self, record: &AuditRecord) -> Result<(), DocumentStoreError> {
        let record = record.clone();
        self.broker
            .execute(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO audit_records
                            (id, correlation_id, plan_id, step_index, tool_name, arguments_json,
                             is_dry_run, result_json, error, duration_ms, operation_hash, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(record.id)
                    .bind(record.correlation_id)
                    .bind(record.plan_id)
                    .bind(record.step_index)
                    .bind(record.tool_name)
                    .bind(record.arguments_json)
                    .bind(record.is_dry_run)
                    .bind(record.result_json)
                    .bind(record.error)
                    .bind(record.duration_ms)
                    .bind(record.operation_hash)
                    .bind(record.created_at)
                    .execute(pool)
                    .await
                })
            })
            .await??;
        Ok(())
    }

    /// Look up a prior dry-run Audit Record by `plan_id` and `operation_hash`
    /// — used by the Tool Registry to check the safety invariant before a
    /// confirmed execution.
    pub async fn find_dry_run_audit(
        &self,
        plan_id: &str,
        operation_hash: &str,
    ) -> Result<Option<AuditRecord>, DocumentStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, plan_id, step_index, tool_name, arguments_json,
                   is_dry_run, result_json, error, duration_ms, operation_hash, created_at
            FROM audit_records
            WHERE plan_id = ? AND operation_hash = ? AND is_dry_run = 1
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(plan_id)
        .bind(operation_hash)
        .fetch_optional(self.read_pool())
        .await?;

        Ok(row.map(|r| AuditRecord {
            id: r.get("id"),
            correlation_id: r.get("correlation_id"),
            plan_id: r.get("plan_id"),
            step_index: r.get("step_index"),
            tool_name: r.get("tool_name"),
            arguments_json: r.get("arguments_json"),
            is_dry_run: r.get::<i64, _>("is_dry_run") != 0,
            result_json: r.get("result_json"),
            error: r.get("error"),
            duration_ms: r.get("duration_ms"),
            operation_hash: r.get("operation_hash"),
            created_at: r.get("created_at"),
        }))
    }

    /// List persisted audit records, newest first, optionally filtered by
    /// `correlation_id` and/or `plan_id` — the general-purpose counterpart
    /// to [`DocumentStore::find_dry_run_audit`]'s narrow dry-run lookup.
    pub async fn find_audit_records(
        &self,
        correlation_id: Option<&str>,
        plan_id: Option<&str>,
    ) -> Result<Vec<AuditRecord>, DocumentStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, plan_id, step_index, tool_name, arguments_json,
                   is_dry_run, result_json, error, duration_ms, operation_hash, created_at
            FROM audit_records
            WHERE (?1 IS NULL OR correlation_id = ?1)
              AND (?2 IS NULL OR plan_id = ?2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(correlation_id)
        .bind(plan_id)
        .fetch_all(self.read_pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AuditRecord {
                id: r.get("id"),
                correlation_id: r.get("correlation_id"),
                plan_id: r.get("plan_id"),
                step_index: r.get("step_index"),
                tool_name: r.get("tool_name"),
                arguments_json: r.get("arguments_json"),
                is_dry_run: r.get::<i64, _>("is_dry_run") != 0,
                result_json: r.get("result_json"),
                error: r.get("error"),
                duration_ms: r.get("duration_ms"),
                operation_hash: r.get("operation_hash"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

/// Transaction-scoped counterpart to `upsert_document`, used by
/// [`DocumentStore::ingest_batch`] so every record in a batch shares one
/// `BEGIN`/`COMMIT`.
async fn upsert_document_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &RawRecord,
    now: i64,
) -> Result<(String, UpsertOutcome), sqlx::Error> {
    let hash = canonical_hash(&record.source_id, record.title.as_deref(), &record.content);

    let existing =
        sqlx::query("SELECT id, hash FROM documents WHERE app_source = ? AND source_id = ?")
            .bind(&record.app_source)
            .bind(&record.source_id)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some(row) = existing {
        let id: String = row.get("id");
        let existing_hash: String = row.get("hash");

        if existing_hash == hash {
            sqlx::query("UPDATE documents SET last_seen_at = ? WHERE id = ?")
                .bind(now)
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            return Ok((id, UpsertOutcome::Seen));
        }

        sqlx::query(
            r#"
            UPDATE documents SET
                title = ?, content = ?, source_path = ?, hash = ?,
                updated_at = ?, last_seen_at = ?, deleted = 0, metadata_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.title)
        .bind(&record.content)
        .bind(&record.source_path)
        .bind(&hash)
        .bind(record.updated_at.timestamp())
        .bind(now)
        .bind(&record.metadata_json)
        .bind(&id)
        .execute(&mut **tx)
        .await?;

        return Ok((id, UpsertOutcome::Updated));
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, doc_type, title, content, app_source, source_id, source_path,
             hash, created_at, updated_at, last_seen_at, deleted, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(&id)
    .bind(record.doc_type.as_str())
    .bind(&record.title)
    .bind(&record.content)
    .bind(&record.app_source)
    .bind(&record.source_id)
    .bind(&record.source_path)
    .bind(&hash)
    .bind(record.created_at.timestamp())
    .bind(record.updated_at.timestamp())
    .bind(now)
    .bind(&record.metadata_json)
    .execute(&mut **tx)
    .await?;

    Ok((id, UpsertOutcome::Inserted))
}

/// Transaction-scoped counterpart to `upsert_satellite`.
async fn upsert_satellite_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    fields: &SatelliteFields,
) -> Result<(), sqlx::Error> {
    match fields {
        SatelliteFields::Email(f) => {
            sqlx::query(
                r#"
                INSERT INTO email_fields (document_id, thread_id, from_addr, to_addrs, cc_addrs, mailbox, is_read, is_flagged)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET
                    thread_id = excluded.thread_id, from_addr = excluded.from_addr,
                    to_addrs = excluded.to_addrs, cc_addrs = excluded.cc_addrs,
                    mailbox = excluded.mailbox, is_read = excluded.is_read, is_flagged = excluded.is_flagged
                "#,
            )
            .bind(document_id)
            .bind(&f.thread_id)
            .bind(&f.from_addr)
            .bind(&f.to_addrs)
            .bind(&f.cc_addrs)
            .bind(&f.mailbox)
            .bind(f.is_read)
            .bind(f.is_flagged)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::Event(f) => {
            sqlx::query(
                r#"
                INSERT INTO event_fields (document_id, start, end, location)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET
                    start = excluded.start, end = excluded.end, location = excluded.location
                "#,
            )
            .bind(document_id)
            .bind(f.start)
            .bind(f.end)
            .bind(&f.location)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::Reminder(f) => {
            sqlx::query(
                r#"
                INSERT INTO reminder_fields (document_id, due_at, completed)
                VALUES (?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET
                    due_at = excluded.due_at, completed = excluded.completed
                "#,
            )
            .bind(document_id)
            .bind(f.due_at)
            .bind(f.completed)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::Note(f) => {
            sqlx::query(
                r#"
                INSERT INTO note_fields (document_id, folder) VALUES (?, ?)
                ON CONFLICT(document_id) DO UPDATE SET folder = excluded.folder
                "#,
            )
            .bind(document_id)
            .bind(&f.folder)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::File(f) => {
            sqlx::query(
                r#"
                INSERT INTO file_fields (document_id, path, mime_type) VALUES (?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET path = excluded.path, mime_type = excluded.mime_type
                "#,
            )
            .bind(document_id)
            .bind(&f.path)
            .bind(&f.mime_type)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::Message(f) => {
            sqlx::query(
                r#"
                INSERT INTO message_fields (document_id, thread_id, from_contact, is_from_me, service, chat_name)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET
                    thread_id = excluded.thread_id, from_contact = excluded.from_contact,
                    is_from_me = excluded.is_from_me, service = excluded.service, chat_name = excluded.chat_name
                "#,
            )
            .bind(document_id)
            .bind(&f.thread_id)
            .bind(&f.from_contact)
            .bind(f.is_from_me)
            .bind(&f.service)
            .bind(&f.chat_name)
            .execute(&mut **tx)
            .await?;
        }
        SatelliteFields::Contact(f) => {
            sqlx::query(
                r#"
                INSERT INTO contact_fields (document_id, display_name, organization) VALUES (?, ?, ?)
                ON CONFLICT(document_id) DO UPDATE SET
                    display_name = excluded.display_name, organization = excluded.organization
                "#,
            )
            .bind(document_id)
            .bind(&f.display_name)
            .bind(&f.organization)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Derive and persist relationships for a record within the same batch
/// transaction — currently the message → contact edge the coordinator's
/// batch contract names: a message's `from_contact` resolved against an
/// already-ingested contact document. Silently a no-op when the record
/// isn't a message, `from_contact` is unset, or no contact document with
/// that `source_id` exists yet (contacts can ingest after messages in the
/// fixed source order, so this is expected, not an error).
async fn emit_relationships_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    fields: &SatelliteFields,
    now: i64,
) -> Result<(), sqlx::Error> {
    let SatelliteFields::Message(message) = fields else {
        return Ok(());
    };
    let Some(contact_source_id) = message.from_contact.as_deref() else {
        return Ok(());
    };

    let contact_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM documents WHERE app_source = 'contacts' AND source_id = ?",
    )
    .bind(contact_source_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(contact_id) = contact_id else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO relationships (from_document_id, to_document_id, relationship_type, strength, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(from_document_id, to_document_id, relationship_type) DO UPDATE SET
            strength = excluded.strength
        "#,
    )
    .bind(document_id)
    .bind(contact_id)
    .bind("sent_by")
    .bind(1.0_f64)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Canonical SHA-256 hash over the stable fields named in the document model:
/// `source_id`, `title`, `content`.
pub fn canonical_hash(source_id: &str, title: Option<&str>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(title.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionBroker;
    use crate::migrate::run_migrations;
    use chrono::Utc;

    async fn test_store() -> DocumentStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        DocumentStore::new(ConnectionBroker::new(pool))
    }

    fn sample_record(source_id: &str, content: &str) -> RawRecord {
        RawRecord {
            doc_type: DocumentType::Note,
            app_source: "notes".into(),
            source_id: source_id.into(),
            source_path: None,
            title: Some("Title".into()),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Note(NoteFields::default()),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_unchanged_hash() {
        let store = test_store().await;
        let rec = sample_record("n1", "hello world");

        let (id1, outcome1) = store.upsert_document(&rec, 100).await.unwrap();
        assert_eq!(outcome1, UpsertOutcome::Inserted);

        let (id2, outcome2) = store.upsert_document(&rec, 200).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(outcome2, UpsertOutcome::Seen);

        let detail = store.get_document(&id1).await.unwrap().unwrap();
        assert_eq!(detail.document.last_seen_at, 200);
    }

    #[tokio::test]
    async fn upsert_updates_on_hash_change() {
        let store = test_store().await;
        let rec1 = sample_record("n1", "hello world");
        let (id1, _) = store.upsert_document(&rec1, 100).await.unwrap();

        let rec2 = sample_record("n1", "hello mars");
        let (id2, outcome) = store.upsert_document(&rec2, 150).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(outcome, UpsertOutcome::Updated);

        let detail = store.get_document(&id1).await.unwrap().unwrap();
        assert_eq!(detail.document.content, "hello mars");
    }

    #[tokio::test]
    async fn tombstones_unseen_documents() {
        let store = test_store().await;
        let rec = sample_record("n1", "hello world");
        let (id, _) = store.upsert_document(&rec, 100).await.unwrap();

        let tombstoned = store.tombstone_not_seen_since("notes", 200).await.unwrap();
        assert_eq!(tombstoned, 1);

        let detail = store.get_document(&id).await.unwrap().unwrap();
        assert!(detail.document.deleted);
    }

    #[test]
    fn canonical_hash_is_deterministic() {
        let a = canonical_hash("x", Some("t"), "body");
        let b = canonical_hash("x", Some("t"), "body");
        assert_eq!(a, b);

        let c = canonical_hash("x", Some("t"), "different body");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn ingest_batch_commits_every_record_in_one_transaction() {
        let store = test_store().await;
        let batch = vec![sample_record("a", "alpha"), sample_record("b", "beta")];

        let outcomes = store.ingest_batch(&batch, 100).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.outcome == UpsertOutcome::Inserted));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.read_pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn ingest_batch_rolls_back_whole_batch_on_conflict() {
        let store = test_store().await;

        // Same source_id/title/content => same canonical hash, but different
        // app_source => neither looks like an existing row to the other, so
        // both attempt an INSERT and the second collides on `documents.hash`.
        let rec_a = sample_record("dup", "same content");
        let mut rec_b = sample_record("dup", "same content");
        rec_b.app_source = "files".into();

        let result = store.ingest_batch(&[rec_a, rec_b], 100).await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.read_pool())
            .await
            .unwrap();
        assert_eq!(count, 0, "a failed batch must not leave partial writes behind");
    }

    #[tokio::test]
    async fn ingest_batch_emits_message_to_contact_relationship() {
        let store = test_store().await;

        let contact = RawRecord {
            doc_type: DocumentType::Contact,
            app_source: "contacts".into(),
            source_id: "alice@example.com".into(),
            source_path: None,
            title: Some("Alice".into()),
            content: "Alice".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Contact(ContactFields {
                display_name: Some("Alice".into()),
                organization: None,
            }),
        };
        let (contact_id, _) = store.upsert_document(&contact, 100).await.unwrap();
        store
            .upsert_satellite(&contact_id, &contact.satellite)
            .await
            .unwrap();

        let message = RawRecord {
            doc_type: DocumentType::Message,
            app_source: "messages".into(),
            source_id: "m1".into(),
            source_path: None,
            title: None,
            content: "hey".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Message(MessageFields {
                thread_id: None,
                from_contact: Some("alice@example.com".into()),
                is_from_me: false,
                service: None,
                chat_name: None,
            }),
        };

        let outcomes = store.ingest_batch(&[message], 200).await.unwrap();
        let message_id = &outcomes[0].document_id;

        let rel_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relationships WHERE from_document_id = ? AND to_document_id = ? AND relationship_type = 'sent_by'",
        )
        .bind(message_id)
        .bind(&contact_id)
        .fetch_one(store.read_pool())
        .await
        .unwrap();
        assert_eq!(rel_count, 1);
    }

    #[tokio::test]
    async fn ingest_batch_skips_relationship_when_contact_missing() {
        let store = test_store().await;

        let message = RawRecord {
            doc_type: DocumentType::Message,
            app_source: "messages".into(),
            source_id: "m1".into(),
            source_path: None,
            title: None,
            content: "hey".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Message(MessageFields {
                thread_id: None,
                from_contact: Some("nobody@example.com".into()),
                is_from_me: false,
                service: None,
                chat_name: None,
            }),
        };

        let outcomes = store.ingest_batch(&[message], 100).await.unwrap();
        assert_eq!(outcomes.len(), 1);

        let rel_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
            .fetch_one(store.read_pool())
            .await
            .unwrap();
        assert_eq!(rel_count, 0);
    }

    #[tokio::test]
    async fn find_audit_records_filters_by_plan_id() {
        let store = test_store().await;
        let record = |id: &str, plan_id: &str, correlation_id: &str| AuditRecord {
            id: id.to_string(),
            correlation_id: correlation_id.to_string(),
            plan_id: plan_id.to_string(),
            step_index: 0,
            tool_name: "search_data".to_string(),
            arguments_json: "{}".to_string(),
            is_dry_run: false,
            result_json: None,
            error: None,
            duration_ms: 1,
            operation_hash: None,
            created_at: 100,
        };

        store.record_audit(&record("r1", "plan-a", "corr-a")).await.unwrap();
        store.record_audit(&record("r2", "plan-b", "corr-a")).await.unwrap();

        let for_plan_a = store.find_audit_records(None, Some("plan-a")).await.unwrap();
        assert_eq!(for_plan_a.len(), 1);
        assert_eq!(for_plan_a[0].id, "r1");

        let for_corr_a = store.find_audit_records(Some("corr-a"), None).await.unwrap();
        assert_eq!(for_corr_a.len(), 2);

        let all = store.find_audit_records(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
