use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Storage driver backed by a directory on the local filesystem.
///
/// Each bucket lives in `<root>/<bucket>/b`. Uploads are written to a sibling
/// temporary file and renamed into place, so the destination is always either
/// absent or complete.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created on demand.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn error(
        &self,
        context: &'static str,
        path: &Utf8Path,
    ) -> impl FnOnce(std::io::Error) -> StorageError {
        let path = path.to_string();
        move |err| {
            StorageError::builder("local", StorageErrorKind::from(err.kind()), err)
                .path(path)
                .context(context)
                .build()
        }
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(self.error("create_dir_all", parent))?;
        }
        Ok(())
    }
}

fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.partial", uuid::Uuid::new_v4()))
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let remote = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&remote)
            .await
            .map_err(self.error("metadata", &remote))?;

        // Not every filesystem records creation time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(self.error("metadata timestamps", &remote))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        tokio::fs::remove_file(&remote)
            .await
            .map_err(self.error("remove_file", &remote))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        self.create_parent(&remote).await?;

        let partial = partial_path(&remote);
        let written = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(self.error("create partial file", &partial))?;

            tokio::io::copy_buf(local, &mut file)
                .await
                .map_err(self.error("copy", &partial))?;

            file.sync_all()
                .await
                .map_err(self.error("sync", &partial))?;

            tokio::fs::rename(&partial, &remote)
                .await
                .map_err(self.error("rename partial file", &remote))
        }
        .await;

        if written.is_err() {
            if let Err(error) = tokio::fs::remove_file(&partial).await {
                tracing::warn!(%partial, %error, "unable to remove partial upload");
            }
        }

        written
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&remote)
                .await
                .map_err(self.error("open remote file", &remote))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(self.error("copy", &remote))?;

        local
            .flush()
            .await
            .map_err(self.error("flush writer", &remote))?;

        Ok(())
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let remote = self.path(bucket, remote);
        if offset == 0 {
            self.create_parent(&remote).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(offset == 0)
            .truncate(false)
            .open(&remote)
            .await
            .map_err(self.error("open for write", &remote))?;

        let len = file
            .metadata()
            .await
            .map_err(self.error("metadata", &remote))?
            .len();
        if len < offset {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("write at {offset} past end of file ({len} bytes)"),
                ),
            )
            .path(remote.as_str())
            .build());
        }

        file.set_len(offset)
            .await
            .map_err(self.error("truncate", &remote))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(self.error("seek", &remote))?;

        let written = tokio::io::copy_buf(local, &mut file)
            .await
            .map_err(self.error("copy", &remote))?;

        file.sync_data()
            .await
            .map_err(self.error("sync", &remote))?;

        Ok(offset + written)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let from = self.path(bucket, from);
        let to = self.path(bucket, to);
        self.create_parent(&to).await?;

        tokio::fs::rename(&from, &to)
            .await
            .map_err(self.error("rename", &from))?;
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut base = self.root.join(bucket);
        base.push("b");
        let target = match prefix {
            Some(part) => base.join(part),
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &target))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| {
                StorageError::builder(self.name(), StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .context("list")
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());

        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }

    async fn sweep_partial(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<usize, StorageError> {
        let target = self.path(bucket, prefix.unwrap_or(Utf8Path::new("")));

        let partials = tokio::task::spawn_blocking(move || collect_partials(&target))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| {
                StorageError::builder(self.name(), StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .context("sweep partial uploads")
                    .build()
            })?;

        let mut removed = 0;
        for partial in partials {
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => removed += 1,
                // Finished or cleaned up by its writer in the meantime.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(self.error("remove partial file", &partial)(err)),
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Removed partial uploads");
        }
        Ok(removed)
    }
}

/// Collect the files under `target`, as paths relative to `base`.
#[tracing::instrument]
fn collect_list(base: &Utf8Path, target: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    if target.is_dir() {
        visit(target, &mut files).wrap_err_with(|| format!("walking {target}"))?;
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .filter(|p| !is_partial(p))
        .collect())
}

/// Collect the abandoned partial uploads under `target`.
fn collect_partials(target: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    if target.is_dir() {
        visit(target, &mut files).wrap_err_with(|| format!("walking {target}"))?;
    }

    Ok(files.into_iter().filter(|p| is_partial(p)).collect())
}

fn is_partial(path: &Utf8Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".partial"))
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    async fn read(driver: &LocalDriver, remote: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        driver
            .download("bucket", Utf8Path::new(remote), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn upload_and_list() {
        let (_dir, driver) = driver();

        driver
            .upload("bucket", Utf8Path::new("blobs/ab/abcd"), &mut &b"data"[..])
            .await
            .unwrap();

        assert_eq!(read(&driver, "blobs/ab/abcd").await, b"data");

        let listed = driver
            .list("bucket", Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["blobs/ab/abcd".to_string()]);

        let listed = driver
            .list("bucket", Some(Utf8Path::new("uploads")))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_abandoned_partials() {
        let (_dir, driver) = driver();

        driver
            .upload("bucket", Utf8Path::new("blobs/ab/abcd"), &mut &b"data"[..])
            .await
            .unwrap();

        // What a crash between create and rename leaves behind.
        let abandoned = partial_path(&driver.path("bucket", Utf8Path::new("blobs/ab/ef01")));
        tokio::fs::write(&abandoned, b"half").await.unwrap();

        let listed = driver.list("bucket", None).await.unwrap();
        assert_eq!(listed, vec!["blobs/ab/abcd".to_string()]);

        let removed = driver
            .sweep_partial("bucket", Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!abandoned.exists());
        assert_eq!(read(&driver, "blobs/ab/abcd").await, b"data");

        let removed = driver
            .sweep_partial("bucket", Some(Utf8Path::new("uploads")))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn write_at_resumes_and_truncates() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("uploads/session");

        assert_eq!(
            driver.write_at("bucket", path, 0, &mut &b"abc"[..]).await.unwrap(),
            3
        );
        assert_eq!(
            driver.write_at("bucket", path, 3, &mut &b"defg"[..]).await.unwrap(),
            7
        );
        assert_eq!(
            driver.write_at("bucket", path, 3, &mut &b"DE"[..]).await.unwrap(),
            5
        );
        assert_eq!(read(&driver, "uploads/session").await, b"abcDE");

        let err = driver
            .write_at("bucket", path, 9, &mut &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn rename_publishes_into_new_directory() {
        let (_dir, driver) = driver();

        driver
            .write_at("bucket", Utf8Path::new("uploads/s"), 0, &mut &b"blob"[..])
            .await
            .unwrap();
        driver
            .rename(
                "bucket",
                Utf8Path::new("uploads/s"),
                Utf8Path::new("blobs/sha256/ab/ab12"),
            )
            .await
            .unwrap();

        assert_eq!(read(&driver, "blobs/sha256/ab/ab12").await, b"blob");
        let err = driver
            .metadata("bucket", Utf8Path::new("uploads/s"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
