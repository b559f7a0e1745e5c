use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StartupError;

/// Replace `path` with the JSON encoding of `value`.
///
/// The document is written and synced to a sibling temp file first, then
/// renamed over the target, so readers only ever see the old or new contents.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp = temp_path(path);
    let bytes = serde_json::to_vec_pretty(value).context("failed to encode state")?;
    {
        let mut file =
            File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

/// Read a JSON state file. A missing file is `Ok(None)`; unreadable or
/// undecodable contents are fatal.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StartupError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StartupError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StartupError::CorruptState {
            path: path.to_path_buf(),
            source,
        })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1);

        write_json(&path, &value).unwrap();
        let loaded: Option<BTreeMap<String, i32>> = read_json(&path).unwrap();

        assert_eq!(loaded, Some(value));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_none_and_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Option<Vec<String>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(missing.is_none());

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "{not json").unwrap();
        let err = read_json::<Vec<String>>(&garbage).unwrap_err();
        assert!(matches!(err, StartupError::CorruptState { .. }));
    }
}
