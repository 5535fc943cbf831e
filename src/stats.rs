//! Index statistics and health overview.
//!
//! Prints a quick summary of what's indexed: file counts, chunk counts,
//! embedding coverage, cache size, and a per-source breakdown. Used by
//! `mnemo stats` to give confidence that syncs and embeddings are working.

use sqlx::Row;

use crate::error::Result;
use crate::store::Store;

struct SourceStats {
    source: String,
    file_count: i64,
    chunk_count: i64,
    embedded_count: i64,
    last_mtime: Option<i64>,
}

/// Query the store and print a stats summary.
pub async fn run_stats(store: &Store) -> Result<()> {
    let stats = store.stats().await?;

    println!("mnemo — Index Stats");
    println!("===================");
    println!();
    println!("  Size:          {}", format_bytes(stats.db_size_bytes));
    println!();
    println!("  Files:         {}", stats.total_files);
    println!("  Chunks:        {}", stats.total_chunks);
    println!(
        "  Embedded:      {} / {} ({}%)",
        stats.total_vectors,
        stats.total_chunks,
        if stats.total_chunks > 0 {
            (stats.total_vectors * 100) / stats.total_chunks
        } else {
            0
        }
    );
    println!("  Cache entries: {}", stats.cache_entries);

    let rows = sqlx::query(
        r#"
        SELECT
            f.source,
            COUNT(DISTINCT f.path) AS file_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT CASE WHEN c.embedding IS NOT NULL THEN c.id END) AS embedded_count,
            MAX(f.mtime) AS last_mtime
        FROM files f
        LEFT JOIN chunks c ON c.path = f.path AND c.source = f.source
        GROUP BY f.source
        ORDER BY file_count DESC
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    let source_stats: Vec<SourceStats> = rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            file_count: row.get("file_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
            last_mtime: row.get("last_mtime"),
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<16} {:>6} {:>8} {:>10}   {}",
            "SOURCE", "FILES", "CHUNKS", "EMBEDDED", "LAST CHANGE"
        );
        println!("  {}", "-".repeat(64));

        for s in &source_stats {
            let change_display = match s.last_mtime {
                Some(ts) if ts > 0 => format_ts_relative(ts),
                _ => "unknown".to_string(),
            };
            println!(
                "  {:<16} {:>6} {:>8} {:>10}   {}",
                s.source, s.file_count, s.chunk_count, s.embedded_count, change_display
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative_recent() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now - 10), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
