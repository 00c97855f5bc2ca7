//! Durable manager state.
//!
//! One timestamp-named `*.state.json` per save: the save instant, every
//! tag definition, and the known pcap metadata. The new file is written
//! first and the previously active one deleted afterwards; recovery scans
//! the directory and picks the newest file that parses, so a crash
//! between the two steps only leaves a stale extra file behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use streamidx::builder::PcapInfo;

pub const STATE_SUFFIX: &str = ".state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub saved: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
    #[serde(default)]
    pub pcaps: Vec<PcapInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    pub definition: String,
    pub color: String,
    #[serde(default)]
    pub converters: Vec<String>,
}

/// Writes a new state file and then removes `previous`. Returns the new
/// path.
pub fn save(state_dir: &Path, previous: Option<&Path>, state: &StateFile) -> Result<PathBuf> {
    let name = format!(
        "{}{}",
        state.saved.format("%Y%m%d-%H%M%S%.6f"),
        STATE_SUFFIX
    );
    let path = state_dir.join(name);
    let json = serde_json::to_vec_pretty(state).context("failed to encode state")?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;

    if let Some(previous) = previous {
        if previous != path {
            if let Err(e) = fs::remove_file(previous) {
                warn!(path = %previous.display(), error = %e, "unable to delete old state file");
            }
        }
    }
    Ok(path)
}

/// All state files in the directory, unordered.
pub fn list(state_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(state_dir)
        .with_context(|| format!("failed to read state dir {}", state_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(STATE_SUFFIX))
                .unwrap_or(false)
        {
            files.push(path);
        }
    }
    Ok(files)
}

pub fn read(path: &Path) -> Result<StateFile> {
    let raw =
        fs::read(path).with_context(|| format!("failed to read state file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(saved: DateTime<Utc>, tag: &str) -> StateFile {
        StateFile {
            saved,
            tags: vec![TagRecord {
                name: tag.to_string(),
                definition: "id:1".to_string(),
                color: "#112233".to_string(),
                converters: vec![],
            }],
            pcaps: vec![],
        }
    }

    #[test]
    fn save_roundtrips_and_deletes_previous() {
        let dir = TempDir::new().unwrap();
        let first = save(dir.path(), None, &state(Utc::now(), "tag/a")).unwrap();
        assert!(first.exists());

        let second = save(
            dir.path(),
            Some(&first),
            &state(Utc::now(), "tag/b"),
        )
        .unwrap();
        assert!(!first.exists());
        assert!(second.exists());

        let files = list(dir.path()).unwrap();
        assert_eq!(files, vec![second.clone()]);
        let loaded = read(&second).unwrap();
        assert_eq!(loaded.tags[0].name, "tag/b");
    }

    #[test]
    fn list_ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        save(dir.path(), None, &state(Utc::now(), "tag/a")).unwrap();
        assert_eq!(list(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_state_file_errors_on_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("zzz{STATE_SUFFIX}"));
        fs::write(&path, b"{not json").unwrap();
        assert!(read(&path).is_err());
    }
}
