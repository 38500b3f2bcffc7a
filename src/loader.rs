//! Dataset loading
//!
//! Reads conversation exports from disk. A path may be a file holding a JSON
//! array of conversations, a file holding one conversation object, or a
//! directory whose `*.json` files are read concurrently. A conversation that
//! does not deserialize is skipped and counted; a file that is not JSON at
//! all fails the load.

use crate::models::Conversation;
use anyhow::{Context, Result};
use futures::future::try_join_all;
use glob::glob;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub files: usize,
    pub conversations: usize,
    /// Entries that were not valid conversations.
    pub skipped: usize,
}

impl LoadReport {
    fn merge(&mut self, other: &LoadReport) {
        self.files += other.files;
        self.conversations += other.conversations;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadedDataset {
    pub conversations: Vec<Conversation>,
    pub report: LoadReport,
}

/// Load every conversation under `path`.
pub async fn load_conversations(path: &Path) -> Result<LoadedDataset> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Input not found: {}", path.display()))?;

    let files = if metadata.is_dir() {
        find_json_files(path)?
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        warn!(directory = %path.display(), "No .json files found");
    }

    let loaded = try_join_all(files.iter().map(|file| load_file(file))).await?;

    let mut dataset = LoadedDataset::default();
    for part in loaded {
        dataset.report.merge(&part.report);
        dataset.conversations.extend(part.conversations);
    }

    info!(
        files = dataset.report.files,
        conversations = dataset.report.conversations,
        skipped = dataset.report.skipped,
        "Dataset loaded"
    );
    Ok(dataset)
}

/// `*.json` files directly inside `dir`, in path order.
fn find_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*.json");
    let mut files: Vec<PathBuf> = glob(&pattern.to_string_lossy())
        .with_context(|| format!("Invalid search pattern: {}", pattern.display()))?
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Unreadable directory entry");
                None
            }
        })
        .collect();
    files.sort();
    Ok(files)
}

async fn load_file(path: &Path) -> Result<LoadedDataset> {
    debug!(file = %path.display(), "Reading export");
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut dataset = parse_export(&bytes).with_context(|| format!("Failed to parse {}", path.display()))?;
    dataset.report.files = 1;
    Ok(dataset)
}

/// Parse one export document.
pub fn parse_export(bytes: &[u8]) -> Result<LoadedDataset> {
    let value: Value = serde_json::from_slice(bytes).context("Export is not valid JSON")?;

    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => anyhow::bail!("Expected a JSON array of conversations or a single conversation object"),
    };

    let mut dataset = LoadedDataset::default();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<Conversation>(item) {
            Ok(conversation) => dataset.conversations.push(conversation),
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed conversation");
                dataset.report.skipped += 1;
            }
        }
    }
    dataset.report.conversations = dataset.conversations.len();
    Ok(dataset)
}
