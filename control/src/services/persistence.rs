use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Node;

/// On-disk form of the registry: every node ever seen, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub nodes: BTreeMap<String, Node>,
}

/// Read the state file. `Ok(None)` when it does not exist yet.
pub fn read_state(path: &Path) -> Result<Option<PersistedState>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read state {:?}", path))?;
    let state = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse state {:?}", path))?;
    Ok(Some(state))
}

/// Write through a sibling temp file so a crash never leaves a torn file.
pub fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }
    }

    let bytes = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn default_state_path() -> PathBuf {
    let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("meshfleet");
    dir.push("state.json");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_node;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_state(&dir.path().join("state.json")).unwrap().is_none());
    }

    #[test]
    fn test_write_creates_parent_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = PersistedState::default();
        state.nodes.insert("a".to_string(), test_node("a"));
        write_state(&path, &state).unwrap();

        let loaded = read_state(&path).unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert!(loaded.nodes["a"].same_config(&state.nodes["a"]));
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"nodes\": [").unwrap();

        assert!(read_state(&path).is_err());
    }
}
