//! Database statistics and ingestion status.
//!
//! `medctx stats` prints record counts with per-type and per-category
//! breakdowns; `medctx status` adds the spreadsheet checkpoint state and the
//! list of files the next ingestion run would process.

use anyhow::Result;

use crate::config::Config;
use crate::ingest::{IngestSummary, Pipeline};
use crate::models::format_ts_date;
use crate::store::Store;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config, store: &Store) -> Result<()> {
    let stats = store.stats().await?;
    let (by_type, by_category) = store.breakdown().await?;
    let last = store.last_processed_at().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("medctx database stats");
    println!("=====================");
    println!();
    println!("  Database:         {}", config.db.path.display());
    println!("  Size:             {}", format_bytes(db_size));
    println!();
    println!("  Total Patients:   {}", stats.total_patients);
    println!("  Total Documents:  {}", stats.total_documents);
    println!("  Total Images:     {}", stats.total_images);
    println!("  Processed Files:  {}", stats.processed_files);
    println!(
        "  Last ingestion:   {}",
        last.map(format_ts_relative).unwrap_or_else(|| "never".to_string())
    );

    print_breakdown("Documents by type", "TYPE", &by_type);
    print_breakdown("Images by category", "CATEGORY", &by_category);
    println!();
    Ok(())
}

fn print_breakdown(title: &str, column: &str, rows: &[(String, i64)]) {
    if rows.is_empty() {
        return;
    }
    println!();
    println!("  {}:", title);
    println!("  {:<36} {:>6}", column, "COUNT");
    println!("  {}", "-".repeat(43));
    for (name, n) in rows {
        println!("  {:<36} {:>6}", name, n);
    }
}

/// Run the status command.
pub async fn run_status(pipeline: &Pipeline) -> Result<()> {
    let status = pipeline.ingestion_status().await?;

    println!("Spreadsheet: {}", status.spreadsheet.path);
    println!(
        "  state: {}",
        match (status.spreadsheet.exists, status.spreadsheet.processed) {
            (false, _) => "missing",
            (true, true) => "processed",
            (true, false) => "pending",
        }
    );
    println!(
        "Records: {} patients, {} documents, {} images",
        status.stats.total_patients, status.stats.total_documents, status.stats.total_images
    );
    if status.pending.is_empty() {
        println!("Pending files: none");
    } else {
        println!("Pending files: {}", status.pending.len());
        for path in &status.pending {
            println!("  {}", path);
        }
    }
    if !status.errors.is_empty() {
        println!("Unreadable files: {}", status.errors.len());
        for e in &status.errors {
            println!("  {}", e);
        }
    }
    Ok(())
}

/// Print an ingestion summary in the same block style as `stats`.
pub fn print_summary(summary: &IngestSummary) {
    if summary.dry_run {
        println!("ingest (dry-run)");
        println!("  files pending: {}", summary.pending.len());
        for path in &summary.pending {
            println!("    {}", path);
        }
        return;
    }

    println!("ingest");
    println!("  files processed: {}", summary.files_processed);
    println!("  rows: {}", summary.rows);
    println!("  skipped rows: {}", summary.skipped_rows);
    println!("  documents stored: {}", summary.documents);
    println!("  images analysed: {}", summary.images);
    println!("  images missing: {}", summary.images_missing);
    println!("  elapsed: {:.1}s", summary.elapsed_secs);
    if !summary.errors.is_empty() {
        println!("  errors: {}", summary.errors.len());
        for e in &summary.errors {
            println!("    {}", e);
        }
    }
    println!("{}", summary.status);
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

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_date(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_date(ts)
    }
}
