use super::clock::Clock;
use crate::index::IndexHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

const TRASH_PREFIX: &str = ".trash-";

/// Errors raised by session bookkeeping.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live session has this id.
    #[error("session {0} not found")]
    NotFound(Uuid),
    /// Creating, renaming, or removing session storage failed.
    #[error("session storage error at {path}: {source}")]
    Storage {
        /// Path being manipulated.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: Uuid,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last successful ingestion or query.
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    /// Entries in the session index.
    pub chunk_count: usize,
    /// Whether an index is attached.
    pub has_index: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    index: Option<IndexHandle>,
    deleted: bool,
}

struct SessionEntry {
    id: Uuid,
    created_at: OffsetDateTime,
    storage_dir: PathBuf,
    last_accessed_nanos: AtomicI64,
    chunk_count: AtomicUsize,
    has_index: AtomicBool,
    state: Arc<Mutex<SessionState>>,
}

impl SessionEntry {
    fn last_accessed(&self) -> OffsetDateTime {
        let nanos = self.last_accessed_nanos.load(Ordering::Acquire);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).unwrap_or(self.created_at)
    }

    fn idle_for(&self, now: OffsetDateTime) -> time::Duration {
        now - self.last_accessed()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            created_at: self.created_at,
            last_accessed: self.last_accessed(),
            chunk_count: self.chunk_count.load(Ordering::Acquire),
            has_index: self.has_index.load(Ordering::Acquire),
        }
    }
}

fn to_nanos(instant: OffsetDateTime) -> i64 {
    i64::try_from(instant.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

/// Exclusive access to one session, held across ingestion, queries, and deletion.
pub struct SessionGuard {
    entry: Arc<SessionEntry>,
    state: OwnedMutexGuard<SessionState>,
}

impl SessionGuard {
    /// Session id.
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    /// Directory reserved for this session's index files.
    pub fn storage_dir(&self) -> &Path {
        &self.entry.storage_dir
    }

    /// Attached index, if any.
    pub fn index(&self) -> Option<IndexHandle> {
        self.state.index.clone()
    }

    /// Attach or replace the session's index.
    pub fn attach_index(&mut self, handle: IndexHandle) {
        self.entry
            .chunk_count
            .store(handle.len(), Ordering::Release);
        self.entry.has_index.store(true, Ordering::Release);
        self.state.index = Some(handle);
    }
}

/// Tracks live sessions, their isolated storage, and their last access.
pub struct SessionRegistry {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    /// Open a registry rooted at `root`, creating it if needed.
    ///
    /// Leftover trash from interrupted deletions and session directories from a previous
    /// process are removed; sessions do not outlive the process that created them.
    pub async fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, SessionError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| SessionError::Storage {
                path: root.clone(),
                source,
            })?;
        purge_stale_directories(&root).await?;
        tracing::info!(root = %root.display(), "Session registry ready");
        Ok(Self {
            root,
            clock,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Root directory holding every session's storage.
    pub fn storage_root(&self) -> &Path {
        &self.root
    }

    /// Current time according to the registry clock.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Allocate a new session with its own storage directory.
    pub async fn create(&self) -> Result<Uuid, SessionError> {
        let mut sessions = self.sessions.write().await;
        let mut id = Uuid::new_v4();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let storage_dir = self.root.join(id.to_string());
        tokio::fs::create_dir(&storage_dir)
            .await
            .map_err(|source| SessionError::Storage {
                path: storage_dir.clone(),
                source,
            })?;

        let now = self.clock.now();
        sessions.insert(
            id,
            Arc::new(SessionEntry {
                id,
                created_at: now,
                storage_dir,
                last_accessed_nanos: AtomicI64::new(to_nanos(now)),
                chunk_count: AtomicUsize::new(0),
                has_index: AtomicBool::new(false),
                state: Arc::new(Mutex::new(SessionState::default())),
            }),
        );
        tracing::info!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Whether `id` names a live session.
    pub async fn exists(&self, id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Live session ids.
    pub async fn list(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Record an access now. Access times never move backwards.
    pub async fn touch(&self, id: Uuid) -> Result<(), SessionError> {
        let entry = self.entry(id).await?;
        entry
            .last_accessed_nanos
            .fetch_max(to_nanos(self.clock.now()), Ordering::AcqRel);
        Ok(())
    }

    /// Snapshot of a session, or `None` when it does not exist.
    pub async fn info(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).map(|entry| entry.info())
    }

    /// Wait for exclusive access to a session.
    ///
    /// Fails with [`SessionError::NotFound`] if the session is deleted while waiting.
    pub async fn lock(&self, id: Uuid) -> Result<SessionGuard, SessionError> {
        let entry = self.entry(id).await?;
        let state = Arc::clone(&entry.state).lock_owned().await;
        if state.deleted {
            return Err(SessionError::NotFound(id));
        }
        Ok(SessionGuard { entry, state })
    }

    /// Attach an index to a session.
    pub async fn attach_index(&self, id: Uuid, handle: IndexHandle) -> Result<(), SessionError> {
        let mut guard = self.lock(id).await?;
        guard.attach_index(handle);
        Ok(())
    }

    /// Current index handle of a session.
    pub async fn get_index(&self, id: Uuid) -> Result<Option<IndexHandle>, SessionError> {
        Ok(self.lock(id).await?.index())
    }

    /// Delete a session's storage and registry entry together.
    ///
    /// Returns `Ok(false)` when the session does not exist. If the storage cannot be moved
    /// aside, nothing is removed and the error is returned.
    pub async fn delete(&self, id: Uuid) -> Result<bool, SessionError> {
        let guard = match self.lock(id).await {
            Ok(guard) => guard,
            Err(SessionError::NotFound(_)) => return Ok(false),
            Err(error) => return Err(error),
        };
        self.delete_locked(guard).await?;
        Ok(true)
    }

    /// Sessions whose last access is more than `threshold` ago.
    pub async fn idle_sessions(&self, threshold: Duration) -> Vec<Uuid> {
        let now = self.clock.now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.idle_for(now) > threshold)
            .map(|entry| entry.id)
            .collect()
    }

    /// Delete `id` if, once no operation holds it, it is still idle beyond `threshold`.
    pub async fn delete_if_idle(&self, id: Uuid, threshold: Duration) -> Result<bool, SessionError> {
        let guard = match self.lock(id).await {
            Ok(guard) => guard,
            Err(SessionError::NotFound(_)) => return Ok(false),
            Err(error) => return Err(error),
        };
        if guard.entry.idle_for(self.clock.now()) <= threshold {
            tracing::debug!(session_id = %id, "Session became active before sweep; keeping");
            return Ok(false);
        }
        self.delete_locked(guard).await?;
        Ok(true)
    }

    async fn delete_locked(&self, mut guard: SessionGuard) -> Result<(), SessionError> {
        let id = guard.entry.id;
        let trash = self.root.join(format!("{TRASH_PREFIX}{id}"));

        match tokio::fs::rename(&guard.entry.storage_dir, &trash).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(session_id = %id, "Session storage already missing");
            }
            Err(source) => {
                return Err(SessionError::Storage {
                    path: guard.entry.storage_dir.clone(),
                    source,
                });
            }
        }

        self.sessions.write().await.remove(&id);
        guard.state.deleted = true;
        guard.state.index = None;
        guard.entry.has_index.store(false, Ordering::Release);
        drop(guard);

        match tokio::fs::remove_dir_all(&trash).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(session_id = %id, error = %error, "Failed to remove session trash")
            }
        }
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    async fn entry(&self, id: Uuid) -> Result<Arc<SessionEntry>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }
}

async fn purge_stale_directories(root: &Path) -> Result<(), SessionError> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|source| SessionError::Storage {
            path: root.to_path_buf(),
            source,
        })?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale = name.starts_with(TRASH_PREFIX) || Uuid::parse_str(&name).is_ok();
        if !stale {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::info!(path = %path.display(), "Removed stale session storage"),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to remove stale session storage")
            }
        }
    }
    Ok(())
}
