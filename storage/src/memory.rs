use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that stores files in memory.
///
/// Every mutation happens under a single write lock, so uploads and renames are
/// atomic to readers.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    fn bucket_not_found(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }
}

/// Drain a reader into memory before any lock is taken.
async fn read_all(engine: &'static str, reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();

    tokio::io::copy_buf(reader, &mut buf)
        .await
        .map_err(|err| StorageError::io(engine, err))?;

    buf.shutdown()
        .await
        .map_err(|err| StorageError::io(engine, err))?;

    Ok(buf)
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = read_all(self.name(), local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Copy out under the lock, write without it: the writer may be slow.
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets
                .get(bucket)
                .ok_or_else(|| self.bucket_not_found(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
                .data
                .clone()
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let chunk = read_all(self.name(), local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();

        if offset == 0 && !bucket_map.contains_key(remote) {
            bucket_map.insert(remote.to_owned(), Vec::new().into());
        }

        let item = bucket_map
            .get_mut(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?;

        let len = item.data.len() as u64;
        if len < offset {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("write at {offset} past end of file ({len} bytes)"),
                ),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        item.data.truncate(offset as usize);
        item.data.extend_from_slice(&chunk);
        Ok(item.data.len() as u64)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;

        let item = bucket_map
            .remove(from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, from.as_str()))?;
        bucket_map.insert(to.to_owned(), item);

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;

        let mut paths = Vec::new();
        for path in bucket_map.keys() {
            if let Some(prefix) = prefix {
                if path.starts_with(prefix) {
                    paths.push(path.to_string());
                }
            } else {
                paths.push(path.to_string());
            }
        }

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read(storage: &MemoryStorage, remote: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        storage
            .download("test", Utf8Path::new(remote), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn write_at_truncates_past_offset() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let path = Utf8Path::new("uploads/a");

        let len = storage
            .write_at("test", path, 0, &mut &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(len, 5);

        let len = storage
            .write_at("test", path, 5, &mut &b" world"[..])
            .await
            .unwrap();
        assert_eq!(len, 11);

        let len = storage
            .write_at("test", path, 5, &mut &b"!"[..])
            .await
            .unwrap();
        assert_eq!(len, 6);
        assert_eq!(read(&storage, "uploads/a").await, b"hello!");
    }

    #[tokio::test]
    async fn write_at_past_end_is_rejected() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let path = Utf8Path::new("uploads/a");

        storage
            .write_at("test", path, 0, &mut &b"abc"[..])
            .await
            .unwrap();
        let err = storage
            .write_at("test", path, 10, &mut &b"def"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
        assert_eq!(read(&storage, "uploads/a").await, b"abc");
    }

    #[tokio::test]
    async fn rename_replaces_destination() {
        let storage = MemoryStorage::with_buckets(&["test"]);

        storage
            .upload("test", Utf8Path::new("a"), &mut &b"first"[..])
            .await
            .unwrap();
        storage
            .upload("test", Utf8Path::new("b"), &mut &b"second"[..])
            .await
            .unwrap();
        storage
            .rename("test", Utf8Path::new("b"), Utf8Path::new("a"))
            .await
            .unwrap();

        assert_eq!(read(&storage, "a").await, b"second");
        let err = storage
            .metadata("test", Utf8Path::new("b"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
