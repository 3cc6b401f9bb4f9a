//! Sync pipeline orchestration.
//!
//! Coordinates the full flow for one source: feed → reconcile → render →
//! extract → chunk → embed → upsert → ledger. Items are processed one at
//! a time over a single browser session, with a polite delay between
//! them.
//!
//! ```text
//!  feed ──► reconcile ──► for each item:
//!                            render (browser)
//!                            extract ──► chunk ──► embed ──► upsert
//!                            ledger (best effort) ──► backup (optional)
//! ```
//!
//! A failing item is recorded and skipped; it never aborts the run.
//! Conditions that make every item fail (feed unreachable, missing
//! credentials, no owner, browser unreachable) abort before any item is
//! processed.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::browser::{BrowserClient, PageRenderer, ProtocolError};
use crate::chunk::{chunk_id, chunk_post};
use crate::config::{ChunkingConfig, Config, IndexConfig};
use crate::db;
use crate::embedding::{create_embedder, embed_all, Embedder, EmbeddingError};
use crate::extract::{ExtractError, Extractor};
use crate::feed::{self, build_feed_headers, FeedClient};
use crate::ledger::{ItemOutcome, SqliteLedger, SyncLedger};
use crate::migrate;
use crate::models::{ExtractedPost, FeedItem, ItemFailure, RunSummary};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::vector_index::{build_records, create_index, IndexError, VectorIndex};

/// Flags of one `postsync sync` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub limit: Option<usize>,
    pub force: bool,
    pub dry_run: bool,
}

/// Why a single item failed.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("render failed: {0}")]
    Render(#[from] ProtocolError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("index write failed: {0}")]
    Index(#[from] IndexError),
    #[error("item timed out after {0}s")]
    Timeout(u64),
}

/// What a successfully ingested item contributed to the run.
#[derive(Debug, Clone, Copy)]
struct ItemDone {
    chunks: usize,
    links: usize,
}

/// Per-item processing stages for one source, wired to its collaborators.
pub struct Pipeline<'a> {
    /// Configured source name (ledger key).
    pub source: &'a str,
    /// Tag stamped on chunk metadata.
    pub tag: &'a str,
    pub namespace: &'a str,
    pub owner: &'a str,
    pub renderer: &'a dyn PageRenderer,
    pub extractor: &'a Extractor,
    pub embedder: &'a dyn Embedder,
    pub index: &'a dyn VectorIndex,
    pub ledger: &'a dyn SyncLedger,
    pub chunking: &'a ChunkingConfig,
    pub index_config: &'a IndexConfig,
    pub item_delay: Duration,
    pub item_timeout: Duration,
    pub backup_dir: Option<&'a Path>,
    pub progress: &'a dyn SyncProgressReporter,
}

impl Pipeline<'_> {
    /// Process `items` in order, accumulating results into `summary`.
    ///
    /// Counters are updated after every item, so a caller that stops
    /// awaiting this future still holds an accurate partial summary.
    pub async fn run(&self, items: &[FeedItem], summary: &mut RunSummary) {
        let total = items.len() as u64;

        for (i, item) in items.iter().enumerate() {
            if i > 0 && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }

            self.progress.report(SyncProgressEvent::Ingesting {
                source: self.source.to_string(),
                n: i as u64 + 1,
                total,
                title: item.title.clone(),
            });

            let outcome = tokio::time::timeout(self.item_timeout, self.process_item(item))
                .await
                .unwrap_or_else(|_| Err(ItemError::Timeout(self.item_timeout.as_secs())));

            match outcome {
                Ok(done) => {
                    tracing::info!(
                        source = self.source,
                        title = %item.title,
                        chunks = done.chunks,
                        links = done.links,
                        "Synced item"
                    );
                    summary.succeeded += 1;
                    summary.chunks_written += done.chunks;
                    summary.links_extracted += done.links;
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        source = self.source,
                        title = %item.title,
                        url = %item.link,
                        error = %reason,
                        "Item failed"
                    );
                    if let Err(ledger_err) = self
                        .ledger
                        .record_outcome(
                            self.source,
                            self.owner,
                            item,
                            ItemOutcome::Failed { error: &reason },
                        )
                        .await
                    {
                        tracing::warn!(error = %ledger_err, "Failed to record item failure");
                    }
                    summary.failures.push(ItemFailure {
                        identity: item.identity().to_string(),
                        title: item.title.clone(),
                        reason,
                    });
                }
            }
        }
    }

    async fn process_item(&self, item: &FeedItem) -> Result<ItemDone, ItemError> {
        let html = self.renderer.render(&item.link).await?;
        let mut post = self.extractor.extract(&html, &item.link)?;
        if post.title.is_empty() {
            post.title = item.title.clone();
        }

        let chunks = chunk_post(&post, self.tag, self.chunking);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(self.embedder, &texts).await?;
        let records = build_records(&chunks, vectors, self.namespace, self.index_config)?;
        let written = self.index.upsert(self.namespace, &records).await?;
        self.delete_stale_vectors(item, &post.slug, chunks.len()).await?;

        // Vectors are already written; a ledger failure only means the
        // item is retried (and overwritten) next run.
        if let Err(e) = self
            .ledger
            .record_outcome(
                self.source,
                self.owner,
                item,
                ItemOutcome::Synced {
                    post: &post,
                    chunk_count: chunks.len(),
                },
            )
            .await
        {
            tracing::warn!(title = %post.title, error = %e, "Failed to record synced item");
        }

        if let Some(dir) = self.backup_dir {
            if let Err(e) = write_backup(dir, self.source, item, &post).await {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to write local backup");
            }
        }

        Ok(ItemDone {
            chunks: written,
            links: post.links.len(),
        })
    }

    /// Remove vectors an earlier ingest of `item` wrote that the new
    /// chunk set no longer overwrites.
    ///
    /// Runs before the ledger update, so a failed delete leaves the old
    /// chunk count on record for the next attempt.
    async fn delete_stale_vectors(
        &self,
        item: &FeedItem,
        slug: &str,
        chunk_count: usize,
    ) -> Result<(), ItemError> {
        let previous = match self.ledger.indexed_chunks(self.source, item.identity()).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(
                    title = %item.title,
                    error = %e,
                    "Failed to read previous chunk count"
                );
                return Ok(());
            }
        };
        let Some((prefix, old_count)) = previous else {
            return Ok(());
        };

        let first_stale = if prefix == slug { chunk_count } else { 0 };
        let stale: Vec<String> = (first_stale..old_count).map(|i| chunk_id(&prefix, i)).collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.index.delete(self.namespace, &stale).await?;
        tracing::info!(title = %item.title, removed = stale.len(), "Removed stale vectors");
        Ok(())
    }
}

/// Save the extracted post as `<dir>/<YYYY-MM-DD>-<slug>.json`.
async fn write_backup(
    dir: &Path,
    source: &str,
    item: &FeedItem,
    post: &ExtractedPost,
) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let file = dir.join(backup_file_name(post));
    let body = serde_json::json!({
        "source": source,
        "external_id": item.identity(),
        "post": post,
    });
    tokio::fs::write(&file, serde_json::to_string_pretty(&body)?).await?;
    tracing::debug!(file = %file.display(), "Wrote local backup");
    Ok(())
}

fn backup_file_name(post: &ExtractedPost) -> String {
    let slug = if post.slug.is_empty() { "post" } else { &post.slug };
    format!("{}-{}.json", post.published_at.format("%Y-%m-%d"), slug)
}

// ═══════════════════════════════════════════════════════════════════════
// run_sync
// ═══════════════════════════════════════════════════════════════════════

/// Sync one configured source.
///
/// Returns `Ok` even when individual items failed; the summary carries
/// the failures. Returns `Err` only for run-fatal conditions.
pub async fn run_sync(
    config: &Config,
    source_name: &str,
    opts: SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<RunSummary> {
    let source = config.source(source_name)?;
    let mut summary = RunSummary::new(source_name, opts.dry_run);

    // Credentials are checked before anything touches the network.
    let services = if opts.dry_run {
        None
    } else {
        Some(live_services(config)?)
    };

    progress.report(SyncProgressEvent::Fetching {
        source: source_name.to_string(),
    });
    let client = FeedClient::from_config(&config.sync)?;
    let headers = build_feed_headers(source)?;
    let items = client
        .fetch_items(&source.feed_url, headers)
        .await
        .with_context(|| format!("Failed to fetch feed for '{}'", source_name))?;

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let ledger = SqliteLedger::new(pool);

    let unique = feed::dedupe(items);
    summary.considered = unique.len();
    let synced = ledger.synced_identifiers(source_name).await?;
    let pending = feed::reconcile(unique, &synced, opts.force);
    summary.skipped = summary.considered - pending.len();
    summary.planned = feed::limit(pending, opts.limit);

    tracing::info!(
        source = source_name,
        considered = summary.considered,
        skipped = summary.skipped,
        planned = summary.planned.len(),
        "Reconciled feed"
    );

    let Some((embedder, index)) = services else {
        print_summary(&summary);
        ledger.pool().close().await;
        return Ok(summary);
    };

    let owner = ledger
        .resolve_owner(source_name, config.sync.owner.as_deref())
        .await?;

    if !summary.planned.is_empty() {
        let extractor = Extractor::for_source(source)?;
        let backup_dir = config.sync.backup_dir.as_ref().map(|d| d.join(source_name));
        let browser = BrowserClient::connect(&config.browser)
            .await
            .with_context(|| {
                format!(
                    "Browser not reachable at {}; start it with remote debugging enabled",
                    config.browser.discovery_url()
                )
            })?;

        let pipeline = Pipeline {
            source: source_name,
            tag: source.tag_or(source_name),
            namespace: &source.namespace,
            owner: &owner,
            renderer: &browser,
            extractor: &extractor,
            embedder: embedder.as_ref(),
            index: index.as_ref(),
            ledger: &ledger,
            chunking: &config.chunking,
            index_config: &config.index,
            item_delay: Duration::from_millis(config.sync.item_delay_ms),
            item_timeout: Duration::from_secs(config.sync.item_timeout_secs),
            backup_dir: backup_dir.as_deref(),
            progress,
        };

        let items = std::mem::take(&mut summary.planned);
        let interrupted = tokio::select! {
            _ = pipeline.run(&items, &mut summary) => false,
            _ = tokio::signal::ctrl_c() => true,
        };
        summary.planned = items;
        summary.interrupted = interrupted;
        progress.report(SyncProgressEvent::Finished {
            source: source_name.to_string(),
            succeeded: summary.succeeded as u64,
            failed: summary.failed() as u64,
        });
        if interrupted {
            tracing::warn!(source = source_name, "Interrupted; stopping after partial run");
        }

        browser.close().await;
    }

    if let Err(e) = ledger.record_run(source_name, &owner, &summary).await {
        tracing::warn!(error = %e, "Failed to update sync manifest");
    }

    print_summary(&summary);
    ledger.pool().close().await;
    Ok(summary)
}

/// Sync every configured source in name order.
///
/// A run-fatal error in one source is reported and the next source is
/// still attempted; the combined result is an error if any source failed.
pub async fn run_sync_all(
    config: &Config,
    opts: SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<Vec<RunSummary>> {
    if config.sources.is_empty() {
        bail!("No sources configured. Add a [sources.<name>] table to the config file.");
    }

    let mut summaries = Vec::new();
    let mut failed = Vec::new();
    for name in config.sources.keys() {
        match run_sync(config, name, opts, progress).await {
            Ok(summary) => {
                let interrupted = summary.interrupted;
                summaries.push(summary);
                if interrupted {
                    break;
                }
            }
            Err(e) => {
                eprintln!("sync {}: {:#}", name, e);
                failed.push(name.as_str());
            }
        }
    }

    if !failed.is_empty() {
        bail!("Sync failed for: {}", failed.join(", "));
    }
    Ok(summaries)
}

/// Embedder and index for a live run; disabled providers are rejected.
fn live_services(config: &Config) -> Result<(Box<dyn Embedder>, Box<dyn VectorIndex>)> {
    if !config.embedding.is_enabled() {
        bail!("embedding.provider is 'disabled'; configure it or use --dry-run");
    }
    if !config.index.is_enabled() {
        bail!("index.provider is 'disabled'; configure it or use --dry-run");
    }
    let embedder = create_embedder(&config.embedding)?;
    let index = create_index(&config.index)?;
    Ok((embedder, index))
}

/// Print the end-of-run report to stdout.
pub fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("sync {} (dry-run)", summary.source);
        println!("  feed items: {}", summary.considered);
        println!("  already synced: {}", summary.skipped);
        println!("  planned: {}", summary.planned.len());
        for item in &summary.planned {
            println!("    - {} <{}>", item.title, item.link);
        }
        println!("ok");
        return;
    }

    println!("sync {}", summary.source);
    println!("  feed items: {}", summary.considered);
    println!("  already synced: {}", summary.skipped);
    println!("  attempted: {}", summary.succeeded + summary.failed());
    println!("  succeeded: {}", summary.succeeded);
    println!("  failed: {}", summary.failed());
    for failure in &summary.failures {
        println!("    - {}: {}", failure.title, failure.reason);
    }
    println!("  chunks written: {}", summary.chunks_written);
    println!("  links extracted: {}", summary.links_extracted);
    if summary.interrupted {
        println!("interrupted");
    } else {
        println!("ok");
    }
}
