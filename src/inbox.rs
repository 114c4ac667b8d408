//! Inbox scanning for `shelf scan`.
//!
//! Walks the configured input directory and returns the files that pass
//! the include/exclude globs, sorted by relative path so repeated scans
//! submit in the same order.

use anyhow::{anyhow, bail, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::Config;

pub fn scan_inbox(config: &Config) -> Result<Vec<PathBuf>> {
    let input = config
        .input
        .as_ref()
        .ok_or_else(|| anyhow!("[input] is not configured"))?;

    let root = &input.dir;
    if !root.exists() {
        bail!("Inbox directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&input.include_globs)?;

    let mut excludes = vec!["**/.*".to_string(), "**/.*/**".to_string()];
    excludes.extend(input.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();

        if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
            continue;
        }

        files.push((rel_str.into_owned(), path.to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // Case-insensitive so scanner output like SCAN.PDF is picked up.
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}
