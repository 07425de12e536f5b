//! Dataset discovery and file fingerprints.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::DatasetConfig;

/// A supplementary document found under the documents root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the documents root, `/`-separated.
    pub relative: String,
}

/// Content hash plus modification time, the change-detection key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub mtime_ns: i64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn fingerprint(path: &Path, bytes: &[u8]) -> Result<Fingerprint> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(Fingerprint {
        content_hash: sha256_hex(bytes),
        mtime_ns,
    })
}

/// Result of walking the documents root.
#[derive(Debug, Default)]
pub struct DocumentScan {
    pub files: Vec<ScannedFile>,
    /// Entries the walk could not read; the rest of the tree is still scanned.
    pub errors: Vec<String>,
}

/// Supplementary documents matching the include globs, sorted by relative path.
///
/// The primary spreadsheet is never returned even if a glob matches it. Only
/// invalid globs fail the scan; unreadable entries land in
/// [`DocumentScan::errors`].
pub fn scan_documents(dataset: &DatasetConfig) -> Result<DocumentScan> {
    let root = dataset.documents_path();
    if !root.is_dir() {
        debug!(root = %root.display(), "Documents directory missing, nothing to scan");
        return Ok(DocumentScan::default());
    }

    let include_set = build_globset(&dataset.include_globs)?;
    let mut excludes = vec!["**/.*".to_string(), "**/~$*".to_string()];
    excludes.extend(dataset.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;
    let spreadsheet = dataset.spreadsheet_path();

    let mut scan = DocumentScan::default();
    for entry in WalkDir::new(&root).follow_links(dataset.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                warn!(path = %path, error = %e, "Skipping unreadable entry");
                scan.errors.push(format!("{}: {}", path, e));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path == spreadsheet {
            continue;
        }

        let relative = path
            .strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        scan.files.push(ScannedFile {
            path: path.to_path_buf(),
            relative,
        });
    }

    scan.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(scan)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
