//! JSON files for shard snapshots.
//!
//! The on-disk format belongs to whoever persists the model; these helpers
//! only give tools and tests a simple way to write a [`ShardSnapshot`] out
//! and read it back.

use std::path::{Path, PathBuf};

use crate::error::{Result, ShardError};
use crate::shard::ShardSnapshot;

/// File name used for the shard of `rank` inside a checkpoint directory.
pub fn shard_file_name(rank: usize) -> String {
    format!("shard-{rank}.json")
}

/// Path of the shard of `rank` inside `dir`.
pub fn shard_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(shard_file_name(rank))
}

/// Writes `snapshot` to `path` as JSON, creating parent directories.
pub fn save_snapshot(path: &Path, snapshot: &ShardSnapshot) -> Result<()> {
    tracing::info!(
        path = %path.display(),
        rank = snapshot.rank,
        rows = snapshot.len(),
        "Saving shard snapshot"
    );

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ShardError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let json = serde_json::to_string(snapshot)?;
    std::fs::write(path, json).map_err(|e| ShardError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Reads a snapshot previously written by [`save_snapshot`].
pub fn load_snapshot(path: &Path) -> Result<ShardSnapshot> {
    let json = std::fs::read_to_string(path).map_err(|e| ShardError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let snapshot: ShardSnapshot = serde_json::from_str(&json)?;
    tracing::debug!(path = %path.display(), rows = snapshot.len(), "Loaded shard snapshot");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmbeddingShard;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = EmbeddingShard::new(1, 8, 3).unwrap();
        shard.assign(7, &[0.1, 0.2, 0.3]).unwrap();
        shard.assign(9, &[0.4, 0.5, 0.6]).unwrap();

        let path = shard_path(&dir.path().join("step-10"), 1);
        save_snapshot(&path, &shard.snapshot()).unwrap();
        assert!(path.ends_with("shard-1.json"));

        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, shard.snapshot());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_snapshot(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ShardError::Io { .. }));
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_snapshot(&path),
            Err(ShardError::Serialization(_))
        ));
    }
}
