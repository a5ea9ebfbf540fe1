//! Ingest Coordinator (C5): drives extractors in a fixed order, persisting
//! each batch inside its own transaction and chunking/embedding documents
//! as they land.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::backup;
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::extractors::SourceExtractor;
use crate::models::{IngestStats, IngestStatus};
use crate::store::{DocumentStore, UpsertOutcome};

/// The order sources are drawn down in, matching the coordinator contract.
pub const FIXED_SOURCE_ORDER: &[&str] = &[
    "calendar", "mail", "messages", "contacts", "whatsapp", "notes", "files", "reminders",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingest coordinator not initialized")]
    NotInitialized,
    #[error("database initialization failed: {0}")]
    DatabaseInitializationFailed(String),
    #[error("backup failed: {0}")]
    BackupFailed(String),
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
}

pub struct IngestCoordinator {
    store: Arc<DocumentStore>,
    config: Arc<Config>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl IngestCoordinator {
    pub fn new(
        store: Arc<DocumentStore>,
        config: Arc<Config>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            config,
            provider,
        }
    }

    /// Run every registered extractor in [`FIXED_SOURCE_ORDER`], skipping
    /// any source with no extractor registered. Never aborts the overall
    /// run on a single source's failure.
    pub async fn run_all(
        &self,
        extractors: &HashMap<String, Box<dyn SourceExtractor>>,
        full_sync: bool,
    ) -> Result<Vec<IngestStats>, IngestError> {
        if self.config.ingest.backup_before_sync {
            backup::backup_store(&self.config)
                .await
                .map_err(|e| IngestError::BackupFailed(e.to_string()))?;
        }

        let mut results = Vec::new();

        for source in FIXED_SOURCE_ORDER {
            let extractor = match extractors.get(*source) {
                Some(e) => e.as_ref(),
                None => {
                    results.push(IngestStats {
                        source: source.to_string(),
                        status: IngestStatus::Skipped,
                        items_processed: 0,
                        items_created: 0,
                        items_updated: 0,
                        items_tombstoned: 0,
                        errors: 0,
                        duration_ms: 0,
                    });
                    continue;
                }
            };

            let stats = self.run_source(extractor, full_sync).await;
            results.push(stats);

            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.ingest.inter_source_sleep_ms,
            ))
            .await;
        }

        Ok(results)
    }

    /// Run a single extractor end to end, never propagating its failure —
    /// callers get a per-source status back instead.
    pub async fn run_source(
        &self,
        extractor: &dyn SourceExtractor,
        full_sync: bool,
    ) -> IngestStats {
        let source = extractor.app_source().to_string();
        let started = Instant::now();
        let sync_started_at = chrono::Utc::now().timestamp();

        let since = if full_sync {
            None
        } else {
            self.load_checkpoint(&source).await
        };

        let records = match extractor.extract(full_sync, since).await {
            Ok(r) => r,
            Err(e) => {
                warn!(source = %source, error = %e, "extractor failed");
                return IngestStats {
                    source,
                    status: IngestStatus::Failed,
                    items_processed: 0,
                    items_created: 0,
                    items_updated: 0,
                    items_tombstoned: 0,
                    errors: 1,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        if records.is_empty() {
            return IngestStats {
                source,
                status: IngestStatus::Success,
                items_processed: 0,
                items_created: 0,
                items_updated: 0,
                items_tombstoned: 0,
                errors: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let mut created = 0u64;
        let mut updated = 0u64;
        let mut errors = 0u64;
        let batch_size = self.config.ingest.batch_size.max(1);

        for batch in records.chunks(batch_size) {
            let now = chrono::Utc::now().timestamp();
            match self.store.ingest_batch(batch, now).await {
                Ok(outcomes) => {
                    for (record, batch_outcome) in batch.iter().zip(outcomes.iter()) {
                        match batch_outcome.outcome {
                            UpsertOutcome::Inserted => created += 1,
                            UpsertOutcome::Updated => updated += 1,
                            UpsertOutcome::Seen => continue,
                        }

                        if let Err(e) = self.chunk_and_embed(&batch_outcome.document_id, record).await {
                            warn!(source = %source, error = %e, "failed to chunk/embed record");
                            errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(source = %source, error = %e, batch_len = batch.len(), "batch ingest failed, rolled back");
                    errors += batch.len() as u64;
                }
            }
        }

        let tombstoned = if full_sync {
            self.store
                .tombstone_not_seen_since(&source, sync_started_at)
                .await
                .unwrap_or(0)
        } else {
            0
        };

        let max_seen = records
            .iter()
            .map(|r| r.updated_at.timestamp())
            .max()
            .unwrap_or(sync_started_at);
        self.save_checkpoint(&source, max_seen).await;

        info!(
            source = %source,
            processed = records.len(),
            created,
            updated,
            tombstoned,
            errors,
            "source ingest complete"
        );

        let status = if errors == 0 {
            IngestStatus::Success
        } else if errors < records.len() as u64 {
            IngestStatus::Warning
        } else {
            IngestStatus::Failed
        };

        IngestStats {
            source,
            status,
            items_processed: records.len() as u64,
            items_created: created,
            items_updated: updated,
            items_tombstoned: tombstoned,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Chunk and (if enabled) embed a document that was just inserted or
    /// updated by [`crate::store::DocumentStore::ingest_batch`]. Runs after
    /// that batch's transaction has committed — chunking is CPU-bound and
    /// embedding is a network call, neither belongs inside the write lock a
    /// batch transaction holds.
    async fn chunk_and_embed(
        &self,
        document_id: &str,
        record: &crate::models::RawRecord,
    ) -> Result<(), anyhow::Error> {
        let chunks = chunk_document(
            document_id,
            record.doc_type,
            &record.content,
            self.config.chunking.max_chunk_size,
            self.config.chunking.overlap,
        )?;
        self.store.replace_chunks(document_id, &chunks).await?;

        if self.config.embedding.is_enabled() {
            self.embed_document_chunks(document_id, &chunks).await;
        }

        Ok(())
    }

    /// Embeds chunks that lack a current-model embedding. Failure of one
    /// chunk does not abort the document — it's left for the next embedding
    /// pass to retry.
    async fn embed_document_chunks(&self, document_id: &str, chunks: &[crate::models::Chunk]) {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        if texts.is_empty() {
            return;
        }

        match embed_texts(self.provider.as_ref(), &self.config.embedding, &texts).await {
            Ok(vectors) => {
                for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                    if let Err(e) = self
                        .store
                        .upsert_embedding(
                            &chunk.id,
                            document_id,
                            self.provider.model_name(),
                            self.provider.dims(),
                            vector,
                        )
                        .await
                    {
                        warn!(chunk_id = %chunk.id, error = %e, "failed to persist embedding");
                    }
                }
            }
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "embedding batch failed, deferred to next run");
            }
        }
    }

    async fn load_checkpoint(&self, app_source: &str) -> Option<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT last_sync_at FROM sync_checkpoints WHERE app_source = ?",
        )
        .bind(app_source)
        .fetch_optional(self.store.read_pool())
        .await
        .ok()
        .flatten()
    }

    async fn save_checkpoint(&self, app_source: &str, last_sync_at: i64) {
        if let Err(e) = self.store.save_sync_checkpoint(app_source, last_sync_at).await {
            warn!(source = %app_source, error = %e, "failed to persist checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionBroker;
    use crate::embedding::DisabledProvider;
    use crate::extractors::StaticExtractor;
    use crate::migrate::run_migrations;
    use crate::models::{DocumentType, NoteFields, RawRecord, SatelliteFields};
    use chrono::Utc;

    fn test_config() -> Config {
        let toml = r#"
            [db]
            path = "./test.db"
            [chunking]
            max_chunk_size = 512
            overlap = 50
            [retrieval]
            [server]
            bind = "127.0.0.1:8080"
        "#;
        toml::from_str(toml).unwrap()
    }

    async fn test_coordinator() -> IngestCoordinator {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(DocumentStore::new(ConnectionBroker::new(pool)));
        let config = Arc::new(test_config());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(DisabledProvider);
        IngestCoordinator::new(store, config, provider)
    }

    fn note(id: &str, content: &str) -> RawRecord {
        RawRecord {
            doc_type: DocumentType::Note,
            app_source: "notes".into(),
            source_id: id.into(),
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
    async fn empty_source_reports_success_with_zero_processed() {
        let coordinator = test_coordinator().await;
        let extractor = StaticExtractor::empty("notes");
        let stats = coordinator.run_source(&extractor, true).await;
        assert_eq!(stats.status, IngestStatus::Success);
        assert_eq!(stats.items_processed, 0);
    }

    #[tokio::test]
    async fn ingest_is_idempotent_on_rerun() {
        let coordinator = test_coordinator().await;
        let records = vec![note("n1", "hello"), note("n2", "world")];
        let extractor = StaticExtractor::new("notes", records);

        let first = coordinator.run_source(&extractor, true).await;
        assert_eq!(first.items_created, 2);
        assert_eq!(first.items_updated, 0);

        let second = coordinator.run_source(&extractor, true).await;
        assert_eq!(second.items_created, 0);
        assert_eq!(second.items_updated, 0);
    }

    #[tokio::test]
    async fn full_sync_tombstones_missing_documents() {
        let coordinator = test_coordinator().await;
        let extractor_a = StaticExtractor::new("notes", vec![note("n1", "hello")]);
        coordinator.run_source(&extractor_a, true).await;

        // last_seen_at/sync_started_at are epoch-second resolution; cross a
        // second boundary so the tombstone comparison isn't a coin flip.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let extractor_b = StaticExtractor::new("notes", vec![note("n2", "world")]);
        let stats = coordinator.run_source(&extractor_b, true).await;
        assert_eq!(stats.items_tombstoned, 1);
    }
}
