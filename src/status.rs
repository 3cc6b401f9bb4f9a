//! Ledger overview for `postsync status`.
//!
//! Shows, per configured source, how many items are synced or errored,
//! how many chunks were written, and when the source last ran.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Per-source ledger counts.
struct SourceStatus {
    source: String,
    synced: i64,
    errored: i64,
    chunks: i64,
    last_run: Option<(String, i64)>,
}

/// Query the ledger and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let record_rows = sqlx::query(
        r#"
        SELECT
            source,
            SUM(CASE WHEN status = 'synced' THEN 1 ELSE 0 END) AS synced,
            SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS errored,
            SUM(CASE WHEN status = 'synced' THEN chunk_count ELSE 0 END) AS chunks
        FROM sync_records
        GROUP BY source
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let manifest_rows = sqlx::query("SELECT source, status, last_sync_at FROM sync_manifests")
        .fetch_all(&pool)
        .await?;

    let mut names: Vec<String> = config.sources.keys().cloned().collect();
    for row in record_rows.iter().chain(manifest_rows.iter()) {
        let source: String = row.get("source");
        if !names.contains(&source) {
            names.push(source);
        }
    }

    let statuses: Vec<SourceStatus> = names
        .into_iter()
        .map(|source| {
            let counts = record_rows.iter().find(|r| r.get::<String, _>("source") == source);
            let last_run = manifest_rows
                .iter()
                .find(|m| m.get::<String, _>("source") == source)
                .map(|m| (m.get::<String, _>("status"), m.get::<i64, _>("last_sync_at")));
            SourceStatus {
                synced: counts.map(|r| r.get("synced")).unwrap_or(0),
                errored: counts.map(|r| r.get("errored")).unwrap_or(0),
                chunks: counts.map(|r| r.get("chunks")).unwrap_or(0),
                last_run,
                source,
            }
        })
        .collect();

    println!("postsync status");
    println!("  database: {}", config.db.path.display());
    println!();
    println!(
        "  {:<20} {:>7} {:>7} {:>8}   {}",
        "SOURCE", "SYNCED", "ERRORS", "CHUNKS", "LAST RUN"
    );
    println!("  {}", "-".repeat(72));
    for s in &statuses {
        let run_display = match &s.last_run {
            Some((status, ts)) => format!("{} ({})", format_ts_relative(*ts), status),
            None => "never".to_string(),
        };
        println!(
            "  {:<20} {:>7} {:>7} {:>8}   {}",
            s.source, s.synced, s.errored, s.chunks, run_display
        );
    }

    pool.close().await;
    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
