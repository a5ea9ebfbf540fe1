//! Lexical Index (C7), Vector Index (C8), and Hybrid Search (C9).
//!
//! Lexical retrieval goes through the `documents_fts` virtual table
//! maintained by the triggers in [`crate::migrate`]; vector retrieval is a
//! brute-force cosine scan bounded by `retrieval.candidate_k_vector`, since
//! no ANN index is required at this scale. Hybrid search runs both branches
//! concurrently, min-max normalizes each list, and fuses them by configured
//! weight.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::Row;
use thiserror::Error;

use crate::config::Config;
use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::models::{DocumentType, SearchResult};
use crate::store::{DocumentStore, DocumentStoreError};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Storage(#[from] DocumentStoreError),
    #[error("query failed: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Whether a hybrid search actually used both branches, or degraded to
/// lexical-only because embeddings were unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Hybrid,
    Bm25Only,
}

pub struct HybridSearchResponse {
    pub results: Vec<SearchResult>,
    pub search_type: SearchType,
}

struct LexicalHit {
    document_id: String,
    title: Option<String>,
    app_source: String,
    source_path: Option<String>,
    updated_at: i64,
    rank: f64,
    snippet: String,
}

struct VectorHit {
    document_id: String,
    title: Option<String>,
    app_source: String,
    source_path: Option<String>,
    updated_at: i64,
    similarity: f32,
    snippet: String,
}

/// Query the `documents_fts` virtual table and join back to `documents` for
/// display fields, honoring the `(rank asc, updated_at desc, id asc)` order
/// the lexical contract requires.
async fn lexical_search(
    store: &DocumentStore,
    query: &str,
    types: &[DocumentType],
    limit: i64,
) -> Result<Vec<LexicalHit>, SearchError> {
    let mut sql = String::from(
        r#"
        SELECT d.id AS document_id, d.title, d.app_source, d.source_path, d.updated_at,
               snippet(documents_fts, 2, '⟦', '⟧', '…', 32) AS snippet,
               bm25(documents_fts) AS rank
        FROM documents_fts
        JOIN documents d ON d.id = documents_fts.document_id
        WHERE documents_fts MATCH ? AND d.deleted = 0
        "#,
    );

    if !types.is_empty() {
        let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
        sql.push_str(&format!(" AND d.doc_type IN ({})", placeholders.join(",")));
    }

    sql.push_str(" ORDER BY rank ASC, d.updated_at DESC, d.id ASC LIMIT ?");

    let mut q = sqlx::query(&sql).bind(query);
    for t in types {
        q = q.bind(t.as_str());
    }
    q = q.bind(limit);

    let rows = q.fetch_all(store.read_pool()).await?;

    Ok(rows
        .iter()
        .map(|r| LexicalHit {
            document_id: r.get("document_id"),
            title: r.get("title"),
            app_source: r.get("app_source"),
            source_path: r.get("source_path"),
            updated_at: r.get("updated_at"),
            rank: r.get("rank"),
            snippet: r.get("snippet"),
        })
        .collect())
}

/// Brute-force cosine scan over the `k_cand` most recently updated
/// embeddings, discarding anything below `relevance_floor`, keeping the
/// best-scoring chunk per document, and returning the top `limit`.
async fn vector_search(
    store: &DocumentStore,
    query_vector: &[f32],
    k_cand: i64,
    relevance_floor: f32,
    limit: i64,
) -> Result<Vec<VectorHit>, SearchError> {
    let rows = sqlx::query(
        r#"
        SELECT d.id AS document_id, d.title, d.app_source, d.source_path, d.updated_at,
               c.text AS chunk_text, e.vector AS vector
        FROM embeddings e
        JOIN chunks c ON c.id = e.chunk_id
        JOIN documents d ON d.id = e.document_id
        WHERE d.deleted = 0
        ORDER BY d.updated_at DESC
        LIMIT ?
        "#,
    )
    .bind(k_cand)
    .fetch_all(store.read_pool())
    .await?;

    let mut best: HashMap<String, VectorHit> = HashMap::new();

    for row in &rows {
        let blob: Vec<u8> = row.get("vector");
        let vector = DocumentStore::decode_vector(&blob);
        let similarity = cosine_similarity(query_vector, &vector);

        if similarity < relevance_floor {
            continue;
        }

        let document_id: String = row.get("document_id");
        let text: String = row.get("chunk_text");
        let snippet = truncate_snippet(&text, 160);

        let candidate = VectorHit {
            document_id: document_id.clone(),
            title: row.get("title"),
            app_source: row.get("app_source"),
            source_path: row.get("source_path"),
            updated_at: row.get("updated_at"),
            similarity,
            snippet,
        };

        match best.get(&document_id) {
            Some(existing) if existing.similarity >= similarity => {}
            _ => {
                best.insert(document_id, candidate);
            }
        }
    }

    let mut hits: Vec<VectorHit> = best.into_values().collect();
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    hits.truncate(limit.max(0) as usize);

    Ok(hits)
}

fn truncate_snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

/// Min-max normalize a list of raw scores to `[0, 1]`. A single value or a
/// list where every value is equal normalizes to `1.0` uniformly — there is
/// no meaningful spread to rank within, so nothing should be penalized.
fn normalize_minmax(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    if values.len() == 1 {
        return vec![1.0];
    }

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; values.len()];
    }

    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Run C7's lexical branch and, if embeddings are enabled and a query
/// vector can be obtained, C8's vector branch concurrently; fuse the two
/// normalized lists by `retrieval.w_bm25`/`retrieval.w_emb`. Degrades to
/// `bm25_only` rather than failing when embeddings are unavailable. Never
/// returns an error for "no results" — an empty result set is a success.
pub async fn hybrid_search(
    store: &DocumentStore,
    config: &Config,
    provider: &dyn EmbeddingProvider,
    query: &str,
    types: &[DocumentType],
    limit: i64,
) -> Result<HybridSearchResponse, SearchError> {
    let candidate_limit = (limit * config.retrieval.candidate_factor).max(limit);

    let query_vector = if config.embedding.is_enabled() {
        embed_query(provider, &config.embedding, query).await.ok()
    } else {
        None
    };

    let (lexical_hits, vector_hits) = match &query_vector {
        Some(vector) => {
            let (lex, vec) = tokio::join!(
                lexical_search(store, query, types, candidate_limit),
                vector_search(
                    store,
                    vector,
                    config.retrieval.candidate_k_vector,
                    config.retrieval.relevance_floor,
                    candidate_limit,
                )
            );
            (lex?, vec.unwrap_or_default())
        }
        None => (
            lexical_search(store, query, types, candidate_limit).await?,
            Vec::new(),
        ),
    };

    let search_type = if query_vector.is_some() {
        SearchType::Hybrid
    } else {
        SearchType::Bm25Only
    };

    let bm25_norm = normalize_minmax(&lexical_hits.iter().map(|h| h.rank).collect::<Vec<_>>())
        .into_iter()
        .map(|v| 1.0 - v)
        .collect::<Vec<_>>();
    let emb_norm = normalize_minmax(
        &vector_hits
            .iter()
            .map(|h| h.similarity as f64)
            .collect::<Vec<_>>(),
    );

    let mut fused: HashMap<String, SearchResult> = HashMap::new();

    for (hit, norm) in lexical_hits.iter().zip(bm25_norm.iter()) {
        fused.insert(
            hit.document_id.clone(),
            SearchResult {
                document_id: hit.document_id.clone(),
                title: hit.title.clone(),
                snippet: hit.snippet.clone(),
                app_source: hit.app_source.clone(),
                source_path: hit.source_path.clone(),
                bm25_score: *norm,
                embedding_score: 0.0,
                score: config.retrieval.w_bm25 * norm,
            },
        );
    }

    for (hit, norm) in vector_hits.iter().zip(emb_norm.iter()) {
        fused
            .entry(hit.document_id.clone())
            .and_modify(|existing| {
                existing.embedding_score = *norm;
                existing.score += config.retrieval.w_emb * norm;
            })
            .or_insert_with(|| SearchResult {
                document_id: hit.document_id.clone(),
                title: hit.title.clone(),
                snippet: hit.snippet.clone(),
                app_source: hit.app_source.clone(),
                source_path: hit.source_path.clone(),
                bm25_score: 0.0,
                embedding_score: *norm,
                score: config.retrieval.w_emb * norm,
            });
    }

    let updated_at: HashMap<String, i64> = lexical_hits
        .iter()
        .map(|h| (h.document_id.clone(), h.updated_at))
        .chain(vector_hits.iter().map(|h| (h.document_id.clone(), h.updated_at)))
        .collect();

    let mut results: Vec<SearchResult> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ua = updated_at.get(&a.document_id).copied().unwrap_or(0);
                let ub = updated_at.get(&b.document_id).copied().unwrap_or(0);
                ub.cmp(&ua)
            })
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    results.truncate(limit.max(0) as usize);

    Ok(HybridSearchResponse {
        results,
        search_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_minmax(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        assert_eq!(normalize_minmax(&[5.0]), vec![1.0]);
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_minmax(&[0.0, 5.0, 10.0]);
        assert_eq!(result, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_normalize_all_equal() {
        let result = normalize_minmax(&[3.0, 3.0, 3.0]);
        assert_eq!(result, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_scores_always_in_unit() {
        let result = normalize_minmax(&[-10.0, 0.0, 1000.0, 7.5]);
        assert!(result.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_hybrid_alpha_zero_equals_keyword() {
        // w_bm25 = 0.0: fused score should be driven entirely by the
        // embedding-normalized component.
        let w_bm25 = 0.0;
        let w_emb = 1.0;
        let bm25_norm = 0.9;
        let emb_norm = 0.3;
        let fused = w_bm25 * bm25_norm + w_emb * emb_norm;
        assert!((fused - emb_norm).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_alpha_one_equals_vector() {
        let w_bm25 = 1.0;
        let w_emb = 0.0;
        let bm25_norm = 0.9;
        let emb_norm = 0.3;
        let fused = w_bm25 * bm25_norm + w_emb * emb_norm;
        assert!((fused - bm25_norm).abs() < 1e-9);
    }

    #[test]
    fn truncate_snippet_adds_ellipsis_when_over_limit() {
        let text = "a".repeat(200);
        let snippet = truncate_snippet(&text, 160);
        assert_eq!(snippet.chars().count(), 161);
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn truncate_snippet_passes_short_text_through() {
        assert_eq!(truncate_snippet("hello", 160), "hello");
    }
}
