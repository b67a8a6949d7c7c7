//! On-disk snapshot and manifest for a session index.
//!
//! Each session directory holds `index.json` (every entry) and `manifest.json` (counts and
//! timestamps). Both are written to a temporary sibling and renamed into place, snapshot
//! first, so a reader only ever sees a complete checkpoint.

use super::IndexError;
use super::store::{IndexEntry, VectorIndex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;

/// Snapshot file name inside a session directory.
pub const SNAPSHOT_FILE: &str = "index.json";
/// Manifest file name inside a session directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Summary written alongside every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version.
    pub version: u32,
    /// Entries in the snapshot.
    pub chunk_count: usize,
    /// Embedding width, absent for an empty index.
    pub dimension: Option<usize>,
    /// When the index was first written.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the index was last checkpointed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: &'a [IndexEntry],
}

/// Write `index` as the session's current checkpoint.
pub async fn save(dir: &Path, index: &VectorIndex) -> Result<Manifest, IndexError> {
    let now = OffsetDateTime::now_utc();
    let created_at = match read_manifest(dir).await {
        Ok(Some(previous)) => previous.created_at,
        _ => now,
    };

    let snapshot = serde_json::to_vec(&SnapshotRef {
        version: FORMAT_VERSION,
        entries: index.entries(),
    })?;
    write_atomic(&dir.join(SNAPSHOT_FILE), &snapshot).await?;

    let manifest = Manifest {
        version: FORMAT_VERSION,
        chunk_count: index.len(),
        dimension: index.dimension(),
        created_at,
        updated_at: now,
    };
    write_manifest(dir, &manifest).await?;

    tracing::debug!(
        dir = %dir.display(),
        chunk_count = manifest.chunk_count,
        "Checkpointed index"
    );
    Ok(manifest)
}

/// Load the checkpoint in `dir`. A missing snapshot means there is no index yet.
pub async fn load(dir: &Path) -> Result<Option<(VectorIndex, Manifest)>, IndexError> {
    let snapshot_path = dir.join(SNAPSHOT_FILE);
    let bytes = match tokio::fs::read(&snapshot_path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IndexError::Persistence {
                path: snapshot_path,
                source,
            });
        }
    };

    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version > FORMAT_VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    let index = VectorIndex::from_entries(snapshot.entries)?;

    let manifest = match read_manifest(dir).await {
        Ok(Some(manifest)) if manifest.chunk_count == index.len() => manifest,
        Ok(Some(stale)) => {
            tracing::warn!(
                dir = %dir.display(),
                manifest_count = stale.chunk_count,
                snapshot_count = index.len(),
                "Manifest disagrees with snapshot; rewriting from snapshot"
            );
            let repaired = Manifest {
                chunk_count: index.len(),
                dimension: index.dimension(),
                updated_at: OffsetDateTime::now_utc(),
                ..stale
            };
            write_manifest(dir, &repaired).await?;
            repaired
        }
        Ok(None) | Err(_) => {
            tracing::warn!(dir = %dir.display(), "Manifest missing or unreadable; regenerating");
            let now = OffsetDateTime::now_utc();
            let regenerated = Manifest {
                version: FORMAT_VERSION,
                chunk_count: index.len(),
                dimension: index.dimension(),
                created_at: now,
                updated_at: now,
            };
            write_manifest(dir, &regenerated).await?;
            regenerated
        }
    };

    Ok(Some((index, manifest)))
}

async fn read_manifest(dir: &Path) -> Result<Option<Manifest>, IndexError> {
    let path = dir.join(MANIFEST_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(IndexError::Persistence { path, source }),
    }
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(&dir.join(MANIFEST_FILE), &bytes).await
}

/// Write `bytes` to a temporary sibling, flush it, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let temp = temp_path(path);
    let persistence = |source| IndexError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::create(&temp).await.map_err(persistence)?;
    file.write_all(bytes).await.map_err(persistence)?;
    file.sync_all().await.map_err(persistence)?;
    drop(file);
    tokio::fs::rename(&temp, path).await.map_err(persistence)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ChunkKind, ChunkMetadata};
    use tempfile::TempDir;

    fn sample_index(count: usize) -> VectorIndex {
        VectorIndex::from_entries(
            (0..count)
                .map(|i| IndexEntry {
                    chunk_id: format!("chunk-{i}"),
                    embedding: vec![i as f32 + 1.0, 0.5],
                    text: format!("body {i}"),
                    metadata: ChunkMetadata::new("doc.txt", ChunkKind::Page, 1),
                })
                .collect(),
        )
        .expect("index")
    }

    #[tokio::test]
    async fn missing_snapshot_means_no_index() {
        let dir = TempDir::new().expect("tempdir");
        assert!(load(dir.path()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_then_load_preserves_entries_and_created_at() {
        let dir = TempDir::new().expect("tempdir");
        let first = save(dir.path(), &sample_index(2)).await.expect("save");
        let second = save(dir.path(), &sample_index(3)).await.expect("save");
        assert_eq!(first.created_at, second.created_at);

        let (index, manifest) = load(dir.path()).await.expect("load").expect("index");
        assert_eq!(index.len(), 3);
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(manifest.dimension, Some(2));
        assert_eq!(index.entries()[2].text, "body 2");
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_manifest_is_regenerated() {
        let dir = TempDir::new().expect("tempdir");
        save(dir.path(), &sample_index(2)).await.expect("save");
        std::fs::remove_file(dir.path().join(MANIFEST_FILE)).expect("remove");

        let (_, manifest) = load(dir.path()).await.expect("load").expect("index");
        assert_eq!(manifest.chunk_count, 2);
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn snapshot_wins_over_stale_manifest() {
        let dir = TempDir::new().expect("tempdir");
        save(dir.path(), &sample_index(4)).await.expect("save");
        let mut manifest: Manifest = serde_json::from_slice(
            &std::fs::read(dir.path().join(MANIFEST_FILE)).expect("read"),
        )
        .expect("parse");
        manifest.chunk_count = 1;
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).expect("encode"),
        )
        .expect("write");

        let (index, repaired) = load(dir.path()).await.expect("load").expect("index");
        assert_eq!(index.len(), 4);
        assert_eq!(repaired.chunk_count, 4);
    }

    #[tokio::test]
    async fn unwritable_directory_reports_persistence_error() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("gone");
        let error = save(&missing, &sample_index(1)).await.unwrap_err();
        assert!(matches!(error, IndexError::Persistence { .. }));
    }
}
