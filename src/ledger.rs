//! Durable record of what has been synced.
//!
//! The ledger answers one question for reconciliation (which identities
//! of a source are already synced) and records the outcome of every item
//! and every run. Writes are best-effort from the pipeline's point of
//! view: a failed ledger write is logged and does not undo vector writes
//! that already happened.

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{ExtractedPost, FeedItem, RunSummary, SyncRecord, SyncStatus};

/// Environment variable consulted last when resolving the owner.
pub const OWNER_ENV: &str = "SYNC_USER_ID";

/// Outcome of one item, as recorded in the ledger.
pub enum ItemOutcome<'a> {
    Synced {
        post: &'a ExtractedPost,
        chunk_count: usize,
    },
    Failed {
        error: &'a str,
    },
}

#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// Identities of `source` whose status is synced.
    async fn synced_identifiers(&self, source: &str) -> Result<HashSet<String>>;

    /// Owner to attribute imported posts to.
    ///
    /// Resolution order: the source's own manifest, any manifest,
    /// `configured`, then the `SYNC_USER_ID` environment variable.
    async fn resolve_owner(&self, source: &str, configured: Option<&str>) -> Result<String>;

    /// Vector prefix and chunk count last written for an item, if any.
    async fn indexed_chunks(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<(String, usize)>>;

    async fn record_outcome(
        &self,
        source: &str,
        owner: &str,
        item: &FeedItem,
        outcome: ItemOutcome<'_>,
    ) -> Result<()>;

    /// Update the source's manifest after a run.
    async fn record_run(&self, source: &str, owner: &str, summary: &RunSummary) -> Result<()>;
}

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All ledger rows for `source`, most recent first.
    pub async fn records(&self, source: &str) -> Result<Vec<SyncRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source, external_id, url, status, vector_prefix, chunk_count,
                   last_error, last_synced_at
            FROM sync_records
            WHERE source = ?
            ORDER BY last_synced_at DESC
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(SyncRecord {
                    source: row.get("source"),
                    external_id: row.get("external_id"),
                    url: row.get("url"),
                    status: SyncStatus::parse(&status)
                        .ok_or_else(|| anyhow::anyhow!("Unknown sync status: {}", status))?,
                    vector_prefix: row.get("vector_prefix"),
                    chunk_count: row.get("chunk_count"),
                    last_error: row.get("last_error"),
                    last_synced_at: row.get("last_synced_at"),
                })
            })
            .collect()
    }

    async fn manifest_owner(&self, source: Option<&str>) -> Result<Option<String>> {
        let owner: Option<String> = match source {
            Some(source) => {
                sqlx::query_scalar("SELECT owner FROM sync_manifests WHERE source = ?")
                    .bind(source)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT owner FROM sync_manifests ORDER BY last_sync_at DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(owner.filter(|o| !o.trim().is_empty()))
    }

    async fn record_synced(
        &self,
        source: &str,
        owner: &str,
        item: &FeedItem,
        post: &ExtractedPost,
        chunk_count: usize,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let metadata = serde_json::json!({
            "slug": post.slug,
            "links": post.links,
            "feed_creator": item.creator,
            "chunk_count": chunk_count,
        });

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sync_records (source, external_id, url, title, status, vector_prefix,
                                      chunk_count, last_error, last_synced_at)
            VALUES (?, ?, ?, ?, 'synced', ?, ?, NULL, ?)
            ON CONFLICT(source, external_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                status = 'synced',
                vector_prefix = excluded.vector_prefix,
                chunk_count = excluded.chunk_count,
                last_error = NULL,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(source)
        .bind(item.identity())
        .bind(&post.canonical_url)
        .bind(&post.title)
        .bind(&post.slug)
        .bind(chunk_count as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO imported_posts (id, owner, source, external_id, title, subtitle, author,
                                        url, published_at, content, content_html,
                                        metadata_json, imported_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, external_id) DO UPDATE SET
                owner = excluded.owner,
                title = excluded.title,
                subtitle = excluded.subtitle,
                author = excluded.author,
                url = excluded.url,
                published_at = excluded.published_at,
                content = excluded.content,
                content_html = excluded.content_html,
                metadata_json = excluded.metadata_json,
                imported_at = excluded.imported_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(owner)
        .bind(source)
        .bind(item.identity())
        .bind(&post.title)
        .bind(&post.subtitle)
        .bind(&post.author)
        .bind(&post.canonical_url)
        .bind(post.published_at.timestamp())
        .bind(&post.plain_text)
        .bind(&post.raw_article_html)
        .bind(metadata.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_failed(&self, source: &str, item: &FeedItem, error: &str) -> Result<()> {
        // A failed retry of an already-synced item keeps its synced status;
        // its vectors from the earlier run are still in the index.
        sqlx::query(
            r#"
            INSERT INTO sync_records (source, external_id, url, title, status, vector_prefix,
                                      chunk_count, last_error, last_synced_at)
            VALUES (?, ?, ?, ?, 'error', NULL, 0, ?, ?)
            ON CONFLICT(source, external_id) DO UPDATE SET
                status = CASE WHEN sync_records.status = 'synced' THEN 'synced' ELSE 'error' END,
                last_error = excluded.last_error,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(source)
        .bind(item.identity())
        .bind(&item.link)
        .bind(&item.title)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncLedger for SqliteLedger {
    async fn synced_identifiers(&self, source: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT external_id FROM sync_records WHERE source = ? AND status = 'synced'",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn indexed_chunks(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<(String, usize)>> {
        let row: Option<(Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT vector_prefix, chunk_count
            FROM sync_records
            WHERE source = ? AND external_id = ?
            "#,
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(prefix, count)| prefix.map(|p| (p, count.max(0) as usize))))
    }

    async fn resolve_owner(&self, source: &str, configured: Option<&str>) -> Result<String> {
        if let Some(owner) = self.manifest_owner(Some(source)).await? {
            return Ok(owner);
        }
        if let Some(owner) = self.manifest_owner(None).await? {
            return Ok(owner);
        }
        if let Some(owner) = configured.filter(|o| !o.trim().is_empty()) {
            return Ok(owner.to_string());
        }
        match std::env::var(OWNER_ENV) {
            Ok(owner) if !owner.trim().is_empty() => Ok(owner),
            _ => bail!(
                "No owner for imported posts: set sync.owner in config or {}",
                OWNER_ENV
            ),
        }
    }

    async fn record_outcome(
        &self,
        source: &str,
        owner: &str,
        item: &FeedItem,
        outcome: ItemOutcome<'_>,
    ) -> Result<()> {
        match outcome {
            ItemOutcome::Synced { post, chunk_count } => {
                self.record_synced(source, owner, item, post, chunk_count)
                    .await
            }
            ItemOutcome::Failed { error } => self.record_failed(source, item, error).await,
        }
    }

    async fn record_run(&self, source: &str, owner: &str, summary: &RunSummary) -> Result<()> {
        let status = if summary.interrupted {
            "interrupted"
        } else if summary.failed() > 0 && summary.succeeded == 0 {
            "error"
        } else {
            "completed"
        };
        let error_message = if summary.failures.is_empty() {
            None
        } else {
            let titles: Vec<&str> = summary.failures.iter().map(|f| f.title.as_str()).collect();
            Some(format!("Failed: {}", titles.join(", ")))
        };

        let post_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_records WHERE source = ? AND status = 'synced'",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sync_manifests (source, owner, status, last_sync_at, post_count,
                                        error_message)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                owner = excluded.owner,
                status = excluded.status,
                last_sync_at = excluded.last_sync_at,
                post_count = excluded.post_count,
                error_message = excluded.error_message
            "#,
        )
        .bind(source)
        .bind(owner)
        .bind(status)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_count)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::ItemFailure;
    use chrono::{TimeZone, Utc};

    async fn ledger() -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open(&dir.path().join("ledger.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (dir, SqliteLedger::new(pool))
    }

    fn item(guid: &str) -> FeedItem {
        FeedItem {
            title: format!("Post {}", guid),
            link: format!("https://example.com/p/{}", guid),
            guid: guid.to_string(),
            ..FeedItem::default()
        }
    }

    fn post(slug: &str) -> ExtractedPost {
        ExtractedPost {
            title: "Title".into(),
            subtitle: String::new(),
            author: "Nate".into(),
            published_at: Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap(),
            canonical_url: format!("https://example.com/p/{}", slug),
            slug: slug.into(),
            plain_text: "body".into(),
            raw_article_html: "<p>body</p>".into(),
            links: vec![],
        }
    }

    #[tokio::test]
    async fn test_only_synced_identities_are_skipped() {
        let (_dir, ledger) = ledger().await;
        let p = post("a");
        ledger
            .record_outcome(
                "nate",
                "u1",
                &item("a"),
                ItemOutcome::Synced { post: &p, chunk_count: 3 },
            )
            .await
            .unwrap();
        ledger
            .record_outcome("nate", "u1", &item("b"), ItemOutcome::Failed { error: "boom" })
            .await
            .unwrap();

        let synced = ledger.synced_identifiers("nate").await.unwrap();
        assert_eq!(synced, ["a".to_string()].into_iter().collect());
        assert!(ledger.synced_identifiers("other").await.unwrap().is_empty());

        let records = ledger.records("nate").await.unwrap();
        assert_eq!(records.len(), 2);
        let failed = records.iter().find(|r| r.external_id == "b").unwrap();
        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failure_keeps_synced_status() {
        let (_dir, ledger) = ledger().await;
        let p = post("a");
        ledger
            .record_outcome(
                "nate",
                "u1",
                &item("a"),
                ItemOutcome::Synced { post: &p, chunk_count: 2 },
            )
            .await
            .unwrap();
        ledger
            .record_outcome("nate", "u1", &item("a"), ItemOutcome::Failed { error: "timeout" })
            .await
            .unwrap();

        let records = ledger.records("nate").await.unwrap();
        assert_eq!(records[0].status, SyncStatus::Synced);
        assert_eq!(records[0].chunk_count, 2);
        assert_eq!(records[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_resync_overwrites_imported_post() {
        let (_dir, ledger) = ledger().await;
        let p = post("a");
        for _ in 0..2 {
            ledger
                .record_outcome(
                    "nate",
                    "u1",
                    &item("a"),
                    ItemOutcome::Synced { post: &p, chunk_count: 1 },
                )
                .await
                .unwrap();
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM imported_posts")
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_owner_resolution_order() {
        let (_dir, ledger) = ledger().await;
        assert_eq!(
            ledger.resolve_owner("nate", Some("configured")).await.unwrap(),
            "configured"
        );

        let summary = RunSummary::new("other", false);
        ledger.record_run("other", "from-other", &summary).await.unwrap();
        assert_eq!(
            ledger.resolve_owner("nate", Some("configured")).await.unwrap(),
            "from-other"
        );

        ledger.record_run("nate", "from-nate", &summary).await.unwrap();
        assert_eq!(ledger.resolve_owner("nate", None).await.unwrap(), "from-nate");
    }

    #[tokio::test]
    async fn test_record_run_manifest() {
        let (_dir, ledger) = ledger().await;
        let p = post("a");
        ledger
            .record_outcome(
                "nate",
                "u1",
                &item("a"),
                ItemOutcome::Synced { post: &p, chunk_count: 1 },
            )
            .await
            .unwrap();

        let mut summary = RunSummary::new("nate", false);
        summary.succeeded = 1;
        summary.failures.push(ItemFailure {
            identity: "b".into(),
            title: "B".into(),
            reason: "extract failed".into(),
        });
        summary.failures.push(ItemFailure {
            identity: "c".into(),
            title: "Third Post".into(),
            reason: "timed out".into(),
        });
        ledger.record_run("nate", "u1", &summary).await.unwrap();

        let row = sqlx::query(
            "SELECT status, post_count, error_message FROM sync_manifests WHERE source = 'nate'",
        )
        .fetch_one(ledger.pool())
        .await
        .unwrap();
        assert_eq!(row.get::<String, _>("status"), "completed");
        assert_eq!(row.get::<i64, _>("post_count"), 1);
        assert_eq!(
            row.get::<Option<String>, _>("error_message").as_deref(),
            Some("Failed: B, Third Post")
        );

        ledger
            .record_run("nate", "u1", &RunSummary::new("nate", false))
            .await
            .unwrap();
        let message: Option<String> =
            sqlx::query_scalar("SELECT error_message FROM sync_manifests WHERE source = 'nate'")
                .fetch_one(ledger.pool())
                .await
                .unwrap();
        assert_eq!(message, None);
    }

    #[tokio::test]
    async fn test_indexed_chunks_survive_failed_retry() {
        let (_dir, ledger) = ledger().await;
        assert_eq!(ledger.indexed_chunks("nate", "a").await.unwrap(), None);

        let p = post("slug-a");
        ledger
            .record_outcome(
                "nate",
                "u1",
                &item("a"),
                ItemOutcome::Synced { post: &p, chunk_count: 4 },
            )
            .await
            .unwrap();
        ledger
            .record_outcome("nate", "u1", &item("a"), ItemOutcome::Failed { error: "boom" })
            .await
            .unwrap();
        assert_eq!(
            ledger.indexed_chunks("nate", "a").await.unwrap(),
            Some(("slug-a".to_string(), 4))
        );

        // Never-synced failures have no vectors.
        ledger
            .record_outcome("nate", "u1", &item("b"), ItemOutcome::Failed { error: "boom" })
            .await
            .unwrap();
        assert_eq!(ledger.indexed_chunks("nate", "b").await.unwrap(), None);
    }
}
