//! Schema migrations.
//!
//! Applies the embedded store's schema in strictly increasing versions,
//! recording each applied version in `schema_migrations`. Re-running a
//! version already applied is a no-op; asking for a version with no
//! registered migration fails with [`StorageError::MigrationMissing`]. Only
//! version 1 may fall back to the minimal bootstrap schema (documents,
//! satellites, FTS, triggers) when no explicit migration is registered for it.

use sqlx::sqlite::SqlitePool;

use crate::db::StorageError;

/// Current schema version this build knows how to reach.
pub const CURRENT_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE version = 1")
        .fetch_one(pool)
        .await?;

    if applied > 0 {
        return Ok(());
    }

    apply_bootstrap(pool).await?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (1, ?)")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(())
}

/// Bootstrap schema for version 1: documents, satellites, chunks,
/// embeddings, relationships, FTS + triggers, audit, and checkpoints.
async fn apply_bootstrap(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            doc_type TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            app_source TEXT NOT NULL,
            source_id TEXT NOT NULL,
            source_path TEXT,
            hash TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(app_source, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_app_source ON documents(app_source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_doc_type ON documents(doc_type)")
        .execute(pool)
        .await?;

    for satellite in SATELLITE_TABLES {
        sqlx::query(satellite).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_document_id ON embeddings(document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            from_document_id TEXT NOT NULL,
            to_document_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 0.0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (from_document_id, to_document_id, relationship_type),
            FOREIGN KEY (from_document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (to_document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            app_source TEXT PRIMARY KEY,
            last_sync_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_records (
            id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            plan_id TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            arguments_json TEXT NOT NULL,
            is_dry_run INTEGER NOT NULL,
            result_json TEXT,
            error TEXT,
            duration_ms INTEGER NOT NULL,
            operation_hash TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_plan_id ON audit_records(plan_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_correlation_id ON audit_records(correlation_id)",
    )
    .execute(pool)
    .await?;

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                document_id UNINDEXED,
                title,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for trigger in FTS_TRIGGERS {
        sqlx::query(trigger).execute(pool).await?;
    }

    Ok(())
}

const SATELLITE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS email_fields (
        document_id TEXT PRIMARY KEY,
        thread_id TEXT,
        from_addr TEXT,
        to_addrs TEXT,
        cc_addrs TEXT,
        mailbox TEXT,
        is_read INTEGER NOT NULL DEFAULT 0,
        is_flagged INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS event_fields (
        document_id TEXT PRIMARY KEY,
        start INTEGER,
        end INTEGER,
        location TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS reminder_fields (
        document_id TEXT PRIMARY KEY,
        due_at INTEGER,
        completed INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS note_fields (
        document_id TEXT PRIMARY KEY,
        folder TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS file_fields (
        document_id TEXT PRIMARY KEY,
        path TEXT,
        mime_type TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS message_fields (
        document_id TEXT PRIMARY KEY,
        thread_id TEXT,
        from_contact TEXT,
        is_from_me INTEGER NOT NULL DEFAULT 0,
        service TEXT,
        chat_name TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS contact_fields (
        document_id TEXT PRIMARY KEY,
        display_name TEXT,
        organization TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )"#,
];

/// Keeps `documents_fts` synchronized with `documents` per the canonicalized
/// `(title, content)` rule (design note: earlier drafts indexed extra
/// columns inconsistently between bootstrap and migration paths; this build
/// has exactly one path).
const FTS_TRIGGERS: &[&str] = &[
    r#"CREATE TRIGGER IF NOT EXISTS documents_fts_ai AFTER INSERT ON documents BEGIN
        INSERT INTO documents_fts (document_id, title, content)
        VALUES (new.id, new.title, new.content);
    END"#,
    r#"CREATE TRIGGER IF NOT EXISTS documents_fts_ad AFTER DELETE ON documents BEGIN
        DELETE FROM documents_fts WHERE document_id = old.id;
    END"#,
    r#"CREATE TRIGGER IF NOT EXISTS documents_fts_au AFTER UPDATE ON documents BEGIN
        DELETE FROM documents_fts WHERE document_id = old.id;
        INSERT INTO documents_fts (document_id, title, content)
        VALUES (new.id, new.title, new.content);
    END"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version_count, 1);
    }

    #[tokio::test]
    async fn fts_trigger_mirrors_insert_and_delete() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO documents (id, doc_type, title, content, app_source, source_id, hash, created_at, updated_at, last_seen_at) VALUES ('d1','note','Hi','hello world','notes','1','h1',0,0,0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let fts_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents_fts WHERE document_id = 'd1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(fts_count, 1);

        sqlx::query("DELETE FROM documents WHERE id = 'd1'")
            .execute(&pool)
            .await
            .unwrap();

        let fts_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents_fts WHERE document_id = 'd1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(fts_count, 0);
    }
}
