//! # Upload garbage collection
//!
//! Finds multipart tasks whose snapshot outlived the configured lifecycle
//! and, with `--delete`, removes their staging and snapshot files.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use spacebox_multipart::UploadTaskManager;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Actually delete expired tasks (default is dry-run)
    #[arg(long)]
    delete: bool,
}

pub fn run(manager: &UploadTaskManager, args: GcArgs) -> Result<()> {
    println!();
    println!("  Spacebox Upload Garbage Collection");
    println!("  ==================================");

    let now = Utc::now();
    let expired = manager
        .expired_tasks(now)
        .context("Failed to scan upload snapshots")?;

    let mut staged_bytes = 0u64;
    for task in &expired {
        let size = match manager.get_or_load(&task.upload_id) {
            Ok(t) => t.params().size,
            Err(_) => 0,
        };
        staged_bytes += size;
        println!(
            "    {}  {}  {}",
            task.upload_id,
            task.modified.format("%Y-%m-%d %H:%M"),
            format_bytes(size)
        );
    }

    println!();
    println!("  Upload Statistics:");
    println!(
        "    📦 Snapshot lifecycle: {} days",
        manager.config().lifecycle_secs / 86_400
    );
    println!(
        "    🗑️  Expired tasks:      {} ({})",
        format_number(expired.len() as u64),
        format_bytes(staged_bytes)
    );

    if !args.delete {
        println!();
        println!("  📋 Dry run complete. Use --delete to remove expired tasks.");
        println!();
        return Ok(());
    }

    println!();
    if expired.is_empty() {
        println!("  ✨ No expired tasks to delete!");
    } else {
        let report = manager
            .gc_expired(now)
            .context("Failed to collect expired tasks")?;
        for (upload_id, err) in &report.failed {
            eprintln!("  ❌ Failed to delete {}: {}", upload_id, err);
        }
        println!(
            "  ✅ Deleted: {} tasks",
            format_number(report.removed.len() as u64)
        );
    }
    println!();
    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.00 MB");
        assert_eq!(format_bytes(4_831_838_208), "4.50 GB");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(2_592_000), "2,592,000");
    }
}
