//! Resumable upload sessions
//!
//! A session stages bytes under `uploads/<session id>` in strict order, and on
//! commit hands the staged file to the [`BlobStore`] once its hash has been
//! checked against the digest the client claims.
//!
//! Every operation on a session holds that session's lock for its whole
//! duration, so the offset check and the write happen together. Distinct
//! sessions never contend.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::digest::{self, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::repository::Repository;
use crate::store::{Blob, BlobStore, BLOBS, UPLOADS};

/// Opaque, per-attempt upload session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| RegistryError::SessionNotFound(s.to_owned()))
    }
}

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing written yet.
    Initiated,
    /// At least one chunk has been written.
    Writing,
    /// Published as a blob.
    Committed,
    /// Discarded by the client or by expiry.
    Aborted,
}

impl SessionState {
    /// Whether the session can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }
}

/// Server-side record of an in-progress upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Session identifier
    pub id: SessionId,
    /// Repository the upload targets
    pub repository: Repository,
    /// Bytes staged so far
    pub write_offset: u64,
    /// Where the staged bytes live in the bucket
    pub staged: Utf8PathBuf,
    /// Lifecycle state
    pub state: SessionState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time a chunk or commit attempt touched the session
    pub updated_at: DateTime<Utc>,
}

fn staged_path(id: &SessionId) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{UPLOADS}/{id}"))
}

type Slot = Arc<Mutex<UploadSession>>;

#[derive(Debug)]
struct Inner {
    store: BlobStore,
    sessions: DashMap<SessionId, Slot>,
    /// Sessions reaped by [`UploadManager::expire_idle`], and when.
    expired: DashMap<SessionId, DateTime<Utc>>,
}

/// Owns every open upload session.
#[derive(Debug, Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    /// Create a manager that commits into `store`.
    pub fn new(store: BlobStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                sessions: DashMap::new(),
                expired: DashMap::new(),
            }),
        }
    }

    /// The store sessions commit into.
    pub fn store(&self) -> &BlobStore {
        &self.inner.store
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Open a new upload session for `repository`.
    #[tracing::instrument(skip_all, fields(%repository))]
    pub async fn create_session(&self, repository: Repository) -> RegistryResult<SessionId> {
        let id = SessionId::new();
        let staged = staged_path(&id);

        self.inner
            .store
            .bucket()
            .write_at(&staged, 0, &mut &b""[..])
            .await?;

        let now = Utc::now();
        let session = UploadSession {
            id,
            repository,
            write_offset: 0,
            staged,
            state: SessionState::Initiated,
            created_at: now,
            updated_at: now,
        };

        self.inner
            .sessions
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::debug!(session = %id, "created upload session");
        Ok(id)
    }

    fn missing(&self, id: &SessionId) -> RegistryError {
        if self.inner.expired.contains_key(id) {
            RegistryError::SessionExpired(id.to_string())
        } else {
            RegistryError::SessionNotFound(id.to_string())
        }
    }

    /// Take the session's lock, failing if it is unknown or finished.
    async fn lock(&self, id: &SessionId) -> RegistryResult<OwnedMutexGuard<UploadSession>> {
        let slot = self
            .inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| self.missing(id))?;

        let session = slot.lock_owned().await;

        // Committed, aborted or reaped while we waited.
        if session.state.is_terminal() {
            return Err(self.missing(id));
        }

        Ok(session)
    }

    /// A snapshot of the session.
    pub async fn session(&self, id: &SessionId) -> RegistryResult<UploadSession> {
        Ok(self.lock(id).await?.clone())
    }

    /// Bytes staged so far, for clients resuming an upload.
    pub async fn status(&self, id: &SessionId) -> RegistryResult<u64> {
        Ok(self.lock(id).await?.write_offset)
    }

    /// Append a chunk which the client says starts at `start`.
    ///
    /// Fails with [`RegistryError::RangeConflict`] unless `start` is exactly
    /// the number of bytes already staged. Returns the new offset.
    #[tracing::instrument(skip(self, id, data), fields(session = %id, len = data.len()))]
    pub async fn append_chunk(
        &self,
        id: &SessionId,
        start: u64,
        data: Bytes,
    ) -> RegistryResult<u64> {
        self.write(id, Some(start), data).await
    }

    /// Append a chunk at wherever the upload currently ends.
    #[tracing::instrument(skip_all, fields(session = %id, len = data.len()))]
    pub async fn append(&self, id: &SessionId, data: Bytes) -> RegistryResult<u64> {
        self.write(id, None, data).await
    }

    async fn write(&self, id: &SessionId, start: Option<u64>, data: Bytes) -> RegistryResult<u64> {
        let mut session = self.lock(id).await?;

        if let Some(start) = start {
            if start != session.write_offset {
                return Err(RegistryError::RangeConflict {
                    offset: session.write_offset,
                    requested: start,
                });
            }
        }

        let offset = self
            .inner
            .store
            .bucket()
            .write_at(&session.staged, session.write_offset, &mut &data[..])
            .await?;

        session.write_offset = offset;
        session.state = SessionState::Writing;
        session.updated_at = Utc::now();
        tracing::trace!(offset, "staged chunk");

        Ok(offset)
    }

    /// Verify the staged bytes against `claimed` and publish them as a blob.
    ///
    /// On a digest mismatch the session stays open, so the client can fix the
    /// upload and commit again, or abort. The commit runs on its own task and
    /// completes even if the caller stops waiting for it.
    #[tracing::instrument(skip_all, fields(session = %id, digest = %claimed))]
    pub async fn commit(&self, id: &SessionId, claimed: &Digest) -> RegistryResult<Blob> {
        let manager = self.clone();
        let id = *id;
        let claimed = claimed.clone();

        tokio::spawn(
            async move { manager.commit_locked(&id, &claimed).await }.in_current_span(),
        )
        .await?
    }

    async fn commit_locked(&self, id: &SessionId, claimed: &Digest) -> RegistryResult<Blob> {
        let mut session = self.lock(id).await?;
        session.updated_at = Utc::now();

        let store = &self.inner.store;

        // Drop anything a failed write left past the acknowledged offset.
        store
            .bucket()
            .write_at(&session.staged, session.write_offset, &mut &b""[..])
            .await?;

        let actual = store.hash(&session.staged, claimed.algorithm()).await?;
        if !digest::verify(claimed, &actual) {
            tracing::warn!(%actual, "staged content does not match claimed digest");
            return Err(RegistryError::DigestMismatch {
                expected: claimed.clone(),
                actual,
            });
        }

        let blob = store.promote(claimed, &session.staged).await?;
        session.state = SessionState::Committed;
        self.inner.sessions.remove(id);

        tracing::debug!(size = blob.size, "committed upload");
        Ok(blob)
    }

    /// Discard the session and its staged bytes.
    #[tracing::instrument(skip_all, fields(session = %id))]
    pub async fn abort(&self, id: &SessionId) -> RegistryResult<()> {
        let mut session = self.lock(id).await?;
        self.discard(&mut session).await
    }

    /// Remove staged data, then retire the session. If the data can't be
    /// removed the session stays open so the removal can be retried.
    async fn discard(&self, session: &mut UploadSession) -> RegistryResult<()> {
        match self.inner.store.bucket().delete(&session.staged).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }

        session.state = SessionState::Aborted;
        self.inner.sessions.remove(&session.id);
        tracing::debug!(
            session = %session.id,
            created_at = %session.created_at,
            idle_since = %session.updated_at,
            offset = session.write_offset,
            "discarded upload session"
        );
        Ok(())
    }

    /// Abort every session that has not been touched for longer than
    /// `max_age`, returning how many were reaped.
    ///
    /// Sessions with an operation in flight are skipped. Reaped ids are
    /// remembered for another `max_age` so that clients get
    /// [`RegistryError::SessionExpired`] instead of a bare not-found.
    #[tracing::instrument(skip(self))]
    pub async fn expire_idle(&self, max_age: Duration) -> RegistryResult<usize> {
        let now = Utc::now();
        let Some(cutoff) = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let candidates: Vec<(SessionId, Slot)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut reaped = 0;
        let mut failure = None;
        for (id, slot) in candidates {
            let Ok(mut session) = slot.try_lock_owned() else {
                continue;
            };

            if session.state.is_terminal() || session.updated_at >= cutoff {
                continue;
            }

            self.inner.expired.insert(id, now);
            match self.discard(&mut session).await {
                Ok(()) => reaped += 1,
                Err(error) => {
                    self.inner.expired.remove(&id);
                    tracing::warn!(session = %id, %error, "unable to reap idle session");
                    failure = Some(error);
                }
            }
        }

        self.inner.expired.retain(|_, at| *at >= cutoff);

        match failure {
            Some(error) => Err(error),
            None => Ok(reaped),
        }
    }

    /// Run [`UploadManager::expire_idle`] every `interval` on a background task.
    pub fn spawn_reaper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    match manager.expire_idle(max_age).await {
                        Ok(0) => {}
                        Ok(reaped) => tracing::info!(reaped, "expired idle upload sessions"),
                        Err(error) => tracing::error!(%error, "upload session sweep failed"),
                    }
                }
            }
            .instrument(tracing::info_span!("upload-reaper")),
        )
    }

    /// Delete staged data which belongs to no open session, such as uploads
    /// left behind by a previous process, along with whatever interrupted
    /// storage writes left under the upload and blob prefixes. Meant to run at
    /// startup, before any requests are served.
    #[tracing::instrument(skip(self))]
    pub async fn reclaim_orphans(&self) -> RegistryResult<usize> {
        let bucket = self.inner.store.bucket();

        let mut reclaimed = 0;
        for prefix in [UPLOADS, BLOBS] {
            match bucket.sweep_partial(Some(Utf8Path::new(prefix))).await {
                Ok(swept) => reclaimed += swept,
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        let staged = match bucket.list(Some(Utf8Path::new(UPLOADS))).await {
            Ok(staged) => staged,
            Err(error) if error.is_not_found() => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        for path in staged {
            let path = Utf8PathBuf::from(path);
            let live = path
                .file_name()
                .and_then(|name| name.parse::<SessionId>().ok())
                .is_some_and(|id| self.inner.sessions.contains_key(&id));
            if live {
                continue;
            }

            match bucket.delete(&path).await {
                Ok(()) => reclaimed += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        if reclaimed > 0 {
            tracing::info!(reclaimed, "removed orphaned upload data");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;
    use storage::MemoryStorage;

    fn manager() -> UploadManager {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        UploadManager::new(BlobStore::new(storage.bucket("test")))
    }

    fn repo() -> Repository {
        Repository::new("library", "app").unwrap()
    }

    fn sha256(data: &[u8]) -> Digest {
        Digest::of(Algorithm::Sha256, data)
    }

    async fn staged_bytes(manager: &UploadManager, id: &SessionId) -> Vec<u8> {
        let mut buf = Vec::new();
        manager
            .store()
            .bucket()
            .download(&staged_path(id), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn chunks_append_in_order() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();
        assert_eq!(manager.status(&id).await.unwrap(), 0);

        let offset = manager
            .append_chunk(&id, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(offset, 6);

        let offset = manager
            .append_chunk(&id, 6, Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(offset, 11);
        assert_eq!(manager.status(&id).await.unwrap(), 11);

        let session = manager.session(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Writing);
        assert_eq!(session.repository, repo());
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();

        manager
            .append_chunk(&id, 0, Bytes::from_static(b"AAAA"))
            .await
            .unwrap();
        manager
            .append_chunk(&id, 4, Bytes::from_static(b"BB"))
            .await
            .unwrap();

        let err = manager
            .append_chunk(&id, 0, Bytes::from_static(b"BB"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::RangeConflict {
                offset: 6,
                requested: 0
            }
        ));

        assert_eq!(manager.status(&id).await.unwrap(), 6);
        assert_eq!(staged_bytes(&manager, &id).await, b"AAAABB");
    }

    #[tokio::test]
    async fn commit_publishes_blob() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();
        let digest = sha256(b"hello");

        assert_eq!(
            manager
                .append_chunk(&id, 0, Bytes::from_static(b"hello"))
                .await
                .unwrap(),
            5
        );

        let blob = manager.commit(&id, &digest).await.unwrap();
        assert_eq!(blob.digest, digest);
        assert_eq!(blob.size, 5);
        assert!(manager.store().exists(&digest).await.unwrap());

        // The session is gone, and so is its staged data.
        assert_eq!(manager.active_sessions(), 0);
        assert!(matches!(
            manager.status(&id).await.unwrap_err(),
            RegistryError::SessionNotFound(_)
        ));
        assert!(!manager
            .store()
            .bucket()
            .exists(&staged_path(&id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn commit_with_wrong_digest_keeps_session_open() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();
        manager
            .append_chunk(&id, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let wrong: Digest = format!("sha256:{}", "de".repeat(32)).parse().unwrap();
        let err = manager.commit(&id, &wrong).await.unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!manager.store().exists(&wrong).await.unwrap());

        let session = manager.session(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Writing);
        assert_eq!(session.write_offset, 5);

        let right = sha256(b"hello");
        manager.commit(&id, &right).await.unwrap();
        assert!(manager.store().exists(&right).await.unwrap());
    }

    #[tokio::test]
    async fn empty_upload_commits_empty_blob() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();

        let blob = manager.commit(&id, &sha256(b"")).await.unwrap();
        assert_eq!(blob.size, 0);
    }

    #[tokio::test]
    async fn identical_uploads_share_one_copy() {
        let manager = manager();
        let digest = sha256(b"same layer");

        let first = manager.create_session(repo()).await.unwrap();
        let second = manager
            .create_session(Repository::new("other", "app").unwrap())
            .await
            .unwrap();
        assert_ne!(first, second);

        for id in [&first, &second] {
            manager
                .append_chunk(id, 0, Bytes::from_static(b"same layer"))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            manager.commit(&first, &digest),
            manager.commit(&second, &digest)
        );
        assert_eq!(a.unwrap(), b.unwrap());

        let blobs = manager
            .store()
            .bucket()
            .list(Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(blobs.len(), 1);

        let staged = manager
            .store()
            .bucket()
            .list(Some(Utf8Path::new(UPLOADS)))
            .await
            .unwrap();
        assert!(staged.is_empty(), "{staged:?}");
    }

    #[tokio::test]
    async fn abort_discards_session() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();
        manager
            .append(&id, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        manager.abort(&id).await.unwrap();
        assert_eq!(manager.active_sessions(), 0);
        assert!(matches!(
            manager.abort(&id).await.unwrap_err(),
            RegistryError::SessionNotFound(_)
        ));
        assert!(matches!(
            manager
                .append_chunk(&id, 7, Bytes::from_static(b"more"))
                .await
                .unwrap_err(),
            RegistryError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_chunks_for_same_offset() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();

        let (a, b) = tokio::join!(
            manager.append_chunk(&id, 0, Bytes::from_static(b"first")),
            manager.append_chunk(&id, 0, Bytes::from_static(b"other")),
        );

        // Exactly one of the writers wins the offset.
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(manager.status(&id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let manager = manager();
        let idle = manager.create_session(repo()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = manager.create_session(repo()).await.unwrap();

        let reaped = manager
            .expire_idle(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        assert!(matches!(
            manager.status(&idle).await.unwrap_err(),
            RegistryError::SessionExpired(_)
        ));
        assert!(matches!(
            manager
                .append_chunk(&idle, 0, Bytes::from_static(b"late"))
                .await
                .unwrap_err(),
            RegistryError::SessionExpired(_)
        ));
        assert_eq!(manager.status(&fresh).await.unwrap(), 0);
        assert!(!manager
            .store()
            .bucket()
            .exists(&staged_path(&idle))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn writes_touch_the_session_but_not_its_birth() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();
        let created = manager.session(&id).await.unwrap();
        assert_eq!(created.created_at, created.updated_at);
        assert_eq!(created.state, SessionState::Initiated);

        tokio::time::sleep(Duration::from_millis(2)).await;
        manager.append(&id, Bytes::from_static(b"abc")).await.unwrap();

        let written = manager.session(&id).await.unwrap();
        assert_eq!(written.created_at, created.created_at);
        assert!(written.updated_at > created.updated_at);
        assert_eq!(written.state, SessionState::Writing);
    }

    #[tokio::test]
    async fn reaper_runs_in_background() {
        let manager = manager();
        let id = manager.create_session(repo()).await.unwrap();

        let reaper = manager.spawn_reaper(Duration::from_millis(5), Duration::from_millis(20));
        for _ in 0..200 {
            if manager.active_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        reaper.abort();

        assert_eq!(manager.active_sessions(), 0);
        assert!(matches!(
            manager.status(&id).await.unwrap_err(),
            RegistryError::SessionExpired(_) | RegistryError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn orphaned_staging_is_reclaimed() {
        let manager = manager();
        let live = manager.create_session(repo()).await.unwrap();

        let orphan = Utf8PathBuf::from(format!("{UPLOADS}/{}", uuid::Uuid::new_v4()));
        manager
            .store()
            .bucket()
            .upload(&orphan, &mut &b"left behind"[..])
            .await
            .unwrap();

        assert_eq!(manager.reclaim_orphans().await.unwrap(), 1);
        assert!(!manager.store().bucket().exists(&orphan).await.unwrap());
        assert!(manager
            .store()
            .bucket()
            .exists(&staged_path(&live))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn interrupted_storage_writes_are_reclaimed() {
        let driver = storage::TempDriver::new().unwrap();
        let root = driver.root().to_owned();
        let storage: storage::Storage = driver.into();
        let manager = UploadManager::new(BlobStore::new(storage.bucket("test")));

        let blob = sha256(b"kept");
        manager
            .store()
            .put(&blob, &mut &b"kept"[..])
            .await
            .unwrap();

        let shard = root.join("test/b").join(BlobStore::blob_path(&blob).as_str());
        let shard = shard.parent().unwrap();
        let partial = shard.join(format!(".{}.{}.partial", blob.hex(), uuid::Uuid::new_v4()));
        tokio::fs::write(&partial, b"half a blob").await.unwrap();

        assert_eq!(manager.reclaim_orphans().await.unwrap(), 1);
        assert!(!partial.exists());
        assert!(manager.store().exists(&blob).await.unwrap());
    }

    #[test]
    fn session_ids_parse() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!(matches!(
            "not-a-session".parse::<SessionId>().unwrap_err(),
            RegistryError::SessionNotFound(_)
        ));
    }
}
