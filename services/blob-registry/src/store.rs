//! Content-addressable blob storage

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use tokio::io;

use crate::digest::{self, Algorithm, Digest};
use crate::error::{RegistryError, RegistryResult};

/// Prefix for all staged data: open upload sessions and in-flight puts.
pub(crate) const UPLOADS: &str = "uploads";

/// Prefix for committed blobs.
pub(crate) const BLOBS: &str = "blobs";

/// An immutable, committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Content digest, which is also the blob's identity
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
    /// Path of the blob within the storage bucket
    pub location: Utf8PathBuf,
}

/// Blob storage keyed by digest, on top of a storage bucket.
///
/// Blobs are only ever made visible by an atomic rename of fully written and
/// verified content, so a blob path is either absent or complete.
#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket: StorageBucket,
}

impl BlobStore {
    /// Create a blob store in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    pub(crate) fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    /// Get the path for a blob
    ///
    /// Blobs are stored as `blobs/<algorithm>/<first two hex chars>/<hex>`,
    /// e.g. `blobs/sha256/2c/2cf24d...`.
    pub fn blob_path(digest: &Digest) -> Utf8PathBuf {
        let hex = digest.hex();
        Utf8PathBuf::from(format!(
            "{BLOBS}/{}/{}/{}",
            digest.algorithm(),
            &hex[..2],
            hex
        ))
    }

    /// Check if a blob exists
    #[tracing::instrument(skip_all, fields(%digest))]
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&Self::blob_path(digest)).await?)
    }

    /// Look up a committed blob.
    #[tracing::instrument(skip_all, fields(%digest))]
    pub async fn stat(&self, digest: &Digest) -> RegistryResult<Blob> {
        self.lookup(digest)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
    }

    async fn lookup(&self, digest: &Digest) -> RegistryResult<Option<Blob>> {
        let location = Self::blob_path(digest);
        match self.bucket.metadata(&location).await {
            Ok(metadata) => Ok(Some(Blob {
                digest: digest.clone(),
                size: metadata.size,
                location,
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Get a blob
    #[tracing::instrument(skip_all, fields(%digest))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        let path = Self::blob_path(digest);
        let mut data = Vec::new();

        self.bucket.download(&path, &mut data).await.map_err(|e| {
            if e.is_not_found() {
                RegistryError::BlobNotFound(digest.clone())
            } else {
                e.into()
            }
        })?;

        Ok(data.into())
    }

    /// Store a blob, verifying that the content hashes to `digest`.
    ///
    /// The content is written to a private temporary path first and renamed
    /// into place once verified. If the blob already exists the source is not
    /// read and the existing blob is returned.
    #[tracing::instrument(skip_all, fields(%digest))]
    pub async fn put<R>(&self, digest: &Digest, reader: &mut R) -> RegistryResult<Blob>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync,
    {
        if let Some(blob) = self.lookup(digest).await? {
            tracing::debug!("blob already present");
            return Ok(blob);
        }

        let temporary = Utf8PathBuf::from(format!("{UPLOADS}/put-{}", uuid::Uuid::new_v4()));

        let result = async {
            self.bucket.upload(&temporary, reader).await?;

            let actual = self.hash(&temporary, digest.algorithm()).await?;
            if !digest::verify(digest, &actual) {
                return Err(RegistryError::DigestMismatch {
                    expected: digest.clone(),
                    actual,
                });
            }

            self.promote(digest, &temporary).await
        }
        .await;

        if result.is_err() {
            self.discard(&temporary).await;
        }

        result
    }

    /// Hash stored content at `path`.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn hash(
        &self,
        path: &Utf8Path,
        algorithm: Algorithm,
    ) -> RegistryResult<Digest> {
        let mut hasher = algorithm.hasher();
        self.bucket.download(path, &mut hasher).await?;
        tracing::trace!(bytes = hasher.len(), "hashed staged content");
        Ok(hasher.finish())
    }

    /// Publish already verified content at `staged` as the blob for `digest`.
    ///
    /// The staged file is consumed either way: moved into place, or removed
    /// when an identical blob is already present.
    pub(crate) async fn promote(
        &self,
        digest: &Digest,
        staged: &Utf8Path,
    ) -> RegistryResult<Blob> {
        if let Some(blob) = self.lookup(digest).await? {
            tracing::debug!(%digest, "blob already present, dropping staged copy");
            self.bucket.delete(staged).await?;
            return Ok(blob);
        }

        let location = Self::blob_path(digest);
        self.bucket.rename(staged, &location).await?;
        tracing::debug!(%digest, %location, "published blob");

        self.lookup(digest)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
    }

    /// Best-effort removal of a temporary file after a failed write.
    async fn discard(&self, path: &Utf8Path) {
        match self.bucket.delete(path).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(%path, %error, "unable to remove temporary blob data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    fn test_store() -> BlobStore {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        BlobStore::new(storage.bucket("test"))
    }

    fn sha256(data: &[u8]) -> Digest {
        Digest::of(Algorithm::Sha256, data)
    }

    #[tokio::test]
    async fn test_blob_storage() {
        let store = test_store();
        let data = b"test data";
        let digest = sha256(data);

        assert!(!store.exists(&digest).await.unwrap());

        let blob = store.put(&digest, &mut &data[..]).await.unwrap();
        assert_eq!(blob.size, data.len() as u64);
        assert_eq!(blob.digest, digest);

        assert!(store.exists(&digest).await.unwrap());

        let retrieved = store.get(&digest).await.unwrap();
        assert_eq!(&retrieved[..], data);
    }

    #[tokio::test]
    async fn test_blob_digest_verification() {
        let store = test_store();
        let data = b"test data";
        let wrong_digest: Digest =
            "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .parse()
                .unwrap();

        let err = store.put(&wrong_digest, &mut &data[..]).await.unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!store.exists(&wrong_digest).await.unwrap());

        // The rejected temporary file is cleaned up.
        let leftovers = store
            .bucket()
            .list(Some(Utf8Path::new(UPLOADS)))
            .await
            .unwrap();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_unknown_blob() {
        let store = test_store();
        let digest = sha256(b"never stored");

        assert!(!store.exists(&digest).await.unwrap());
        assert!(matches!(
            store.get(&digest).await.unwrap_err(),
            RegistryError::BlobNotFound(_)
        ));
        assert!(matches!(
            store.stat(&digest).await.unwrap_err(),
            RegistryError::BlobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_puts_converge() {
        let store = test_store();
        let data = b"layer".repeat(1024);
        let digest = sha256(&data);

        let (mut first, mut second) = (&data[..], &data[..]);
        let (a, b) = tokio::join!(
            store.put(&digest, &mut first),
            store.put(&digest, &mut second),
        );
        assert_eq!(a.unwrap(), b.unwrap());

        let blobs = store
            .bucket()
            .list(Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(store.get(&digest).await.unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_blob_paths() {
        let digest = sha256(b"hello");
        let path = BlobStore::blob_path(&digest);
        assert_eq!(
            path.as_str(),
            "blobs/sha256/2c/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
