//! Document retrieval by ID.
//!
//! Fetches a full document and its chunks via [`DocumentStore::get_document`].
//! Used by both the `kenny get` CLI command and `POST /tools/get` HTTP endpoint.

use serde::Serialize;
use thiserror::Error;

use crate::models::DocumentType;
use crate::store::{DocumentStore, DocumentStoreError};

#[derive(Debug, Error)]
pub enum GetError {
    #[error(transparent)]
    Storage(#[from] DocumentStoreError),
    #[error("document not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub chunk_index: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub title: Option<String>,
    pub content: String,
    pub app_source: String,
    pub source_id: String,
    pub source_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted: bool,
    pub chunks: Vec<ChunkResponse>,
}

/// Fetch a document by id, returning [`GetError::NotFound`] if no row exists
/// (tombstoned documents are still returned — callers check `deleted`).
pub async fn get_document(
    store: &DocumentStore,
    id: &str,
) -> Result<DocumentResponse, GetError> {
    let detail = store
        .get_document(id)
        .await?
        .ok_or_else(|| GetError::NotFound(id.to_string()))?;

    Ok(DocumentResponse {
        id: detail.document.id,
        doc_type: detail.document.doc_type,
        title: detail.document.title,
        content: detail.document.content,
        app_source: detail.document.app_source,
        source_id: detail.document.source_id,
        source_path: detail.document.source_path,
        created_at: detail.document.created_at,
        updated_at: detail.document.updated_at,
        deleted: detail.document.deleted,
        chunks: detail
            .chunks
            .into_iter()
            .map(|c| ChunkResponse {
                chunk_index: c.chunk_index,
                text: c.text,
            })
            .collect(),
    })
}
