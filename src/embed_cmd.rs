//! Embedding CLI commands: `kenny embed pending` and `kenny embed rebuild`.
//!
//! A chunk is "pending" when it has no row in `embeddings` for the
//! currently configured model — chunk replacement already deletes all
//! embeddings for a document (see [`crate::store::DocumentStore::replace_chunks`]),
//! so a chunk whose text changed is always re-embedded by virtue of being a
//! brand new chunk row; there is no separate staleness check to perform.

use anyhow::{bail, Result};
use sqlx::Row;

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::store::DocumentStore;

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
}

/// Embed chunks that don't yet have an embedding row for the configured
/// model.
pub async fn run_embed_pending(
    config: &Config,
    store: &DocumentStore,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pending = find_pending_chunks(store, provider.model_name(), limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        return Ok(());
    }

    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size).max(1);
    let (embedded, failed) = embed_batches(store, config, provider.as_ref(), &pending, batch_size).await;

    println!("embed pending");
    println!("  chunks embedded: {}", embedded);
    println!("  chunks failed:   {}", failed);

    Ok(())
}

/// Delete every embedding and regenerate from scratch, for a model change
/// or dimension migration.
pub async fn run_embed_rebuild(
    config: &Config,
    store: &DocumentStore,
    batch_size_override: Option<usize>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;

    store.delete_all_embeddings().await?;

    let all_chunks = find_pending_chunks(store, provider.model_name(), None).await?;

    if all_chunks.is_empty() {
        println!("embed rebuild");
        println!("  no chunks to embed");
        return Ok(());
    }

    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size).max(1);
    let (embedded, failed) = embed_batches(store, config, provider.as_ref(), &all_chunks, batch_size).await;

    println!("embed rebuild");
    println!("  chunks embedded: {}", embedded);
    println!("  chunks failed:   {}", failed);

    Ok(())
}

async fn embed_batches(
    store: &DocumentStore,
    config: &Config,
    provider: &dyn EmbeddingProvider,
    pending: &[PendingChunk],
    batch_size: usize,
) -> (u64, u64) {
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match embedding::embed_texts(provider, &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vector) in batch.iter().zip(vectors.into_iter()) {
                    let result = store
                        .upsert_embedding(
                            &item.chunk_id,
                            &item.document_id,
                            provider.model_name(),
                            provider.dims(),
                            &vector,
                        )
                        .await;
                    match result {
                        Ok(()) => embedded += 1,
                        Err(_) => failed += 1,
                    }
                }
            }
            Err(_) => failed += batch.len() as u64,
        }
    }

    (embedded, failed)
}

async fn find_pending_chunks(
    store: &DocumentStore,
    model_name: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id AS document_id, c.text AS text
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL AND d.deleted = 0
        ORDER BY c.document_id, c.chunk_index
        "#,
    )
    .bind(model_name)
    .fetch_all(store.read_pool())
    .await?;

    let mut pending: Vec<PendingChunk> = rows
        .into_iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
        })
        .collect();

    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionBroker;
    use crate::chunk::chunk_document;
    use crate::migrate::run_migrations;
    use crate::models::{DocumentType, NoteFields, RawRecord, SatelliteFields};
    use chrono::Utc;

    async fn test_store() -> DocumentStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        DocumentStore::new(ConnectionBroker::new(pool))
    }

    async fn seed_document(store: &DocumentStore) -> String {
        let record = RawRecord {
            doc_type: DocumentType::Note,
            app_source: "notes".into(),
            source_id: "n1".into(),
            source_path: None,
            title: Some("Title".into()),
            content: "hello world, this is a longer note with some content".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata_json: "{}".into(),
            satellite: SatelliteFields::Note(NoteFields::default()),
        };
        let (id, _) = store.upsert_document(&record, 100).await.unwrap();
        store.upsert_satellite(&id, &record.satellite).await.unwrap();
        let chunks = chunk_document(&id, record.doc_type, &record.content, 512, 50).unwrap();
        store.replace_chunks(&id, &chunks).await.unwrap();
        id
    }

    #[tokio::test]
    async fn finds_chunks_with_no_embedding_row() {
        let store = test_store().await;
        seed_document(&store).await;

        let pending = find_pending_chunks(&store, "mock", None).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn chunk_is_no_longer_pending_after_embedding() {
        let store = test_store().await;
        let doc_id = seed_document(&store).await;
        let pending = find_pending_chunks(&store, "mock", None).await.unwrap();
        let chunk = &pending[0];

        store
            .upsert_embedding(&chunk.chunk_id, &doc_id, "mock", 3, &[0.1, 0.2, 0.3])
            .await
            .unwrap();

        let remaining = find_pending_chunks(&store, "mock", None).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn a_different_model_name_treats_chunks_as_pending_again() {
        let store = test_store().await;
        let doc_id = seed_document(&store).await;
        let pending = find_pending_chunks(&store, "mock", None).await.unwrap();
        let chunk = &pending[0];

        store
            .upsert_embedding(&chunk.chunk_id, &doc_id, "mock", 3, &[0.1, 0.2, 0.3])
            .await
            .unwrap();

        let pending_for_new_model = find_pending_chunks(&store, "text-embedding-3-small", None)
            .await
            .unwrap();
        assert_eq!(pending_for_new_model.len(), 1);
    }
}
