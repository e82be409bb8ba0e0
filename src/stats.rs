//! Database statistics: collections, their dimensions, and unit counts.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::{db, migrate};

#[derive(Debug, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub dims: i64,
    pub units: i64,
    pub sources: i64,
    /// Highest sequence number handed out so far.
    pub last_seq: i64,
}

pub async fn collect(config: &Config) -> Result<Vec<CollectionStats>> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let rows = sqlx::query(
        r#"
        SELECT
            c.name,
            c.dims,
            c.next_seq - 1 AS last_seq,
            COUNT(u.identity) AS units,
            COUNT(DISTINCT u.source_file) AS sources
        FROM collections c
        LEFT JOIN units u ON u.collection = c.name
        GROUP BY c.name
        ORDER BY c.name
        "#,
    )
    .fetch_all(&pool)
    .await?;
    pool.close().await;

    Ok(rows
        .iter()
        .map(|row| CollectionStats {
            name: row.get("name"),
            dims: row.get("dims"),
            units: row.get("units"),
            sources: row.get("sources"),
            last_seq: row.get("last_seq"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let collections = collect(config).await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("semdup stats");
    println!("============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    if collections.is_empty() {
        println!("  No collections yet. Run `semdup index` or `semdup report`.");
        return Ok(());
    }

    println!(
        "  {:<20} {:>6} {:>8} {:>8} {:>8}",
        "COLLECTION", "DIMS", "UNITS", "FILES", "SEQ"
    );
    for c in &collections {
        println!(
            "  {:<20} {:>6} {:>8} {:>8} {:>8}",
            c.name, c.dims, c.units, c.sources, c.last_seq
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
