//! Trade history persistence.
//!
//! The history is what cooldown, hourly and exposure limits are computed
//! from, so a crash mid-save must never leave a truncated file behind.
//! Saves write a sibling temp file and rename it over the target; a reader
//! sees either the previous history or the new one.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{TradeHistory, TradeHistoryEntry};

pub const DEFAULT_HISTORY_FILE: &str = "sentinel_history.json";

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Persist the history as a JSON array, oldest entry first.
pub fn save_history(history: &TradeHistory, path: Option<&str>) -> Result<()> {
    let path = Path::new(path.unwrap_or(DEFAULT_HISTORY_FILE));
    let entries: Vec<&TradeHistoryEntry> = history.iter().collect();
    let json = serde_json::to_vec_pretty(&entries).context("Failed to serialise trade history")?;

    let staging = staging_path(path);
    let mut file = fs::File::create(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    file.write_all(&json)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    drop(file);

    fs::rename(&staging, path)
        .with_context(|| format!("Failed to replace history at {}", path.display()))?;

    debug!(path = %path.display(), entries = entries.len(), "History saved");
    Ok(())
}

/// Load the history, keeping only the newest capped entries. `None` means
/// no history was ever saved at `path`.
pub fn load_history(path: Option<&str>) -> Result<Option<TradeHistory>> {
    let path = Path::new(path.unwrap_or(DEFAULT_HISTORY_FILE));

    let staging = staging_path(path);
    if staging.exists() {
        // Left by a save that died before the rename; the target is intact.
        warn!(path = %staging.display(), "Discarding interrupted history save");
        if let Err(e) = fs::remove_file(&staging) {
            warn!(error = %e, "Could not remove stale history temp file");
        }
    }

    if !path.exists() {
        info!(path = %path.display(), "No saved history found, starting fresh");
        return Ok(None);
    }

    let json = fs::read(path)
        .with_context(|| format!("Failed to read history from {}", path.display()))?;
    let entries: Vec<TradeHistoryEntry> = serde_json::from_slice(&json)
        .with_context(|| format!("Failed to parse history from {}", path.display()))?;

    let history = TradeHistory::from_entries(entries);
    info!(path = %path.display(), entries = history.len(), "History loaded from disk");
    Ok(Some(history))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
