//! Ledger schema.
//!
//! Three tables, all created idempotently:
//! - `sync_records`: one row per `(source, external_id)`, the dedup key
//!   consulted by reconciliation.
//! - `imported_posts`: a copy of every successfully ingested post with
//!   its metadata and outbound links.
//! - `sync_manifests`: one row per source describing the last run.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create any missing tables and indexes on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_records (
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT,
            status TEXT NOT NULL,
            vector_prefix TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_synced_at INTEGER NOT NULL,
            PRIMARY KEY (source, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS imported_posts (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            title TEXT NOT NULL,
            subtitle TEXT,
            author TEXT,
            url TEXT NOT NULL,
            published_at INTEGER NOT NULL,
            content TEXT NOT NULL,
            content_html TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            imported_at INTEGER NOT NULL,
            UNIQUE(source, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_manifests (
            source TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            status TEXT NOT NULL,
            last_sync_at INTEGER NOT NULL,
            post_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(source, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_imported_posts_published \
         ON imported_posts(published_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
