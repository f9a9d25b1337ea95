//! Local filesystem acting as a remote storage.
//! Multiple pageservers can use the same "storage" of this kind by using different storage roots.
//!
//! This storage used in pageserver tests, but can also be used in cases when a certain persistent
//! volume is mounted to the local FS.

use std::{future::Future, io::ErrorKind, pin::Pin, time::Duration};

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{DownloadError, RemotePath, RemoteStorage, TimeoutOrCancel};

const LOCAL_FS_TEMP_FILE_SUFFIX: &str = "___temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
    timeout: Duration,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    /// Storage root will be created (if does not exist) and transformed into an absolute path (if passed as relative).
    pub fn new(mut storage_root: Utf8PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given root path {storage_root:?}")
            })?;
        }
        if !storage_root.is_absolute() {
            storage_root = storage_root.canonicalize_utf8().with_context(|| {
                format!("Failed to represent path {storage_root:?} as an absolute path")
            })?;
        }

        Ok(Self {
            storage_root,
            timeout,
        })
    }

    fn resolve_in_storage(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.storage_root)
    }

    /// Races the operation against the timeout and the cancellation token.
    async fn with_timeout<T>(
        &self,
        cancel: &CancellationToken,
        op: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        tokio::select! {
            res = tokio::time::timeout(self.timeout, op) => match res {
                Ok(res) => res,
                Err(_elapsed) => Err(TimeoutOrCancel::Timeout.into()),
            },
            _ = cancel.cancelled() => Err(TimeoutOrCancel::Cancel.into()),
        }
    }

    async fn upload0(&self, from: Bytes, to: &RemotePath) -> anyhow::Result<()> {
        let target_file_path = self.resolve_in_storage(to);
        create_target_directory(&target_file_path).await?;
        // We need this dance with sort of durable rename (without fsyncs)
        // to prevent partial uploads. This was really hit when pageserver shutdown
        // cancelled the upload and partial file was left on the fs
        let temp_file_path = Utf8PathBuf::from(format!(
            "{target_file_path}{LOCAL_FS_TEMP_FILE_SUFFIX}"
        ));
        let mut destination = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_file_path)
            .await
            .with_context(|| {
                format!("Failed to open target fs destination at '{target_file_path}'")
            })?;

        destination.write_all(&from).await.with_context(|| {
            format!("Failed to upload file (write temp) to the local storage at '{temp_file_path}'")
        })?;
        destination.flush().await.with_context(|| {
            format!("Failed to upload (flush temp) file to the local storage at '{temp_file_path}'")
        })?;

        fs::rename(temp_file_path, &target_file_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to upload (rename) file to the local storage at '{target_file_path}'"
                )
            })?;

        Ok(())
    }

    async fn download0(&self, from: &RemotePath) -> Result<Bytes, DownloadError> {
        let file_path = self.resolve_in_storage(from);
        match fs::read(&file_path).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DownloadError::NotFound),
            Err(e) => Err(DownloadError::other(anyhow::Error::new(e).context(format!(
                "Failed to read file '{file_path}' from the local storage"
            )))),
        }
    }

    async fn copy0(&self, from: &RemotePath, to: &RemotePath) -> anyhow::Result<()> {
        let from_path = self.resolve_in_storage(from);
        let to_path = self.resolve_in_storage(to);
        create_target_directory(&to_path).await?;
        fs::copy(&from_path, &to_path).await.with_context(|| {
            format!("Failed to copy file from '{from_path}' to '{to_path}'")
        })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteStorage for LocalFs {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemotePath>, DownloadError> {
        let op = async {
            let root = match prefix {
                Some(prefix) => self.resolve_in_storage(prefix),
                None => self.storage_root.clone(),
            };
            let files = get_all_files(&root).await?;
            let mut keys = files
                .into_iter()
                .filter(|p| !p.as_str().ends_with(LOCAL_FS_TEMP_FILE_SUFFIX))
                .map(|p| {
                    let relative = p
                        .strip_prefix(&self.storage_root)
                        .context("listed file is outside of the storage root")?;
                    RemotePath::new(relative)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            keys.sort();
            Ok::<_, anyhow::Error>(keys)
        };
        self.with_timeout(cancel, op).await.map_err(|e| {
            match TimeoutOrCancel::caused(&e) {
                Some(TimeoutOrCancel::Timeout) => DownloadError::Timeout,
                Some(TimeoutOrCancel::Cancel) => DownloadError::Cancelled,
                None => DownloadError::other(e),
            }
        })
    }

    async fn upload(
        &self,
        from: Bytes,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.with_timeout(cancel, self.upload0(from, to)).await
    }

    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        tokio::select! {
            res = tokio::time::timeout(self.timeout, self.download0(from)) => match res {
                Ok(res) => res,
                Err(_elapsed) => Err(DownloadError::Timeout),
            },
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        }
    }

    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken) -> anyhow::Result<()> {
        let file_path = self.resolve_in_storage(path);
        let op = async {
            match fs::remove_file(&file_path).await {
                Ok(()) => Ok(()),
                // The file doesn't exist. This shouldn't yield an error to mirror S3's behaviour.
                // See https://docs.aws.amazon.com/AmazonS3/latest/API/API_DeleteObject.html
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("Failed to delete file '{file_path}'"))),
            }
        };
        self.with_timeout(cancel, op).await
    }

    async fn copy(
        &self,
        from: &RemotePath,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.with_timeout(cancel, self.copy0(from, to)).await
    }
}

fn get_all_files<'a>(
    directory_path: &'a Utf8Path,
) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Utf8PathBuf>>> + Send + 'a>> {
    Box::pin(async move {
        if directory_path.exists() {
            if directory_path.is_dir() {
                let mut paths = Vec::new();
                let mut dir_contents = fs::read_dir(directory_path).await?;
                while let Some(dir_entry) = dir_contents.next_entry().await? {
                    let file_type = dir_entry.file_type().await?;
                    let entry_path = Utf8PathBuf::try_from(dir_entry.path())
                        .context("non-utf8 path in the local storage")?;
                    if file_type.is_symlink() {
                        debug!("{entry_path:?} is a symlink, skipping")
                    } else if file_type.is_dir() {
                        paths.extend(get_all_files(&entry_path).await?.into_iter())
                    } else {
                        paths.push(entry_path);
                    }
                }
                Ok(paths)
            } else {
                bail!("Path {directory_path:?} is not a directory")
            }
        } else {
            Ok(Vec::new())
        }
    })
}

async fn create_target_directory(target_file_path: &Utf8Path) -> anyhow::Result<()> {
    let target_dir = match target_file_path.parent() {
        Some(parent_dir) => parent_dir,
        None => bail!("File path '{target_file_path}' has no parent directory"),
    };
    ensure!(
        !target_dir.as_str().is_empty(),
        "File path '{target_file_path}' has an empty parent directory"
    );
    if !target_dir.exists() {
        fs::create_dir_all(target_dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod fs_tests {
    use super::*;

    use camino_tempfile::Utf8TempDir;

    fn create_storage() -> anyhow::Result<(LocalFs, Utf8TempDir)> {
        let storage_root = camino_tempfile::tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_owned(), Duration::from_secs(10))?;
        Ok((storage, storage_root))
    }

    #[tokio::test]
    async fn upload_file() -> anyhow::Result<()> {
        let (storage, _root) = create_storage()?;
        let cancel = CancellationToken::new();

        let target = RemotePath::from_string("timelines/some_timeline/upload_1")?;
        storage
            .upload(Bytes::from_static(b"hello"), &target, &cancel)
            .await?;

        assert_eq!(storage.list(None, &cancel).await?, vec![target.clone()]);
        assert_eq!(
            storage.download(&target, &cancel).await?,
            Bytes::from_static(b"hello")
        );

        // overwrite
        storage
            .upload(Bytes::from_static(b"bye"), &target, &cancel)
            .await?;
        assert_eq!(
            storage.download(&target, &cancel).await?,
            Bytes::from_static(b"bye")
        );
        Ok(())
    }

    #[tokio::test]
    async fn download_missing_file_is_not_found() -> anyhow::Result<()> {
        let (storage, _root) = create_storage()?;
        let cancel = CancellationToken::new();

        let res = storage
            .download(&RemotePath::from_string("nope")?, &cancel)
            .await;
        assert!(matches!(res, Err(DownloadError::NotFound)), "{res:?}");
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let (storage, _root) = create_storage()?;
        let cancel = CancellationToken::new();

        let target = RemotePath::from_string("a/b")?;
        storage
            .upload(Bytes::from_static(b"x"), &target, &cancel)
            .await?;
        storage.delete(&target, &cancel).await?;
        storage.delete(&target, &cancel).await?;
        assert!(storage.list(None, &cancel).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_with_prefix_and_copy() -> anyhow::Result<()> {
        let (storage, _root) = create_storage()?;
        let cancel = CancellationToken::new();

        let a = RemotePath::from_string("tenants/t1/timelines/a/layer")?;
        let b = RemotePath::from_string("tenants/t1/timelines/b/layer")?;
        storage
            .upload(Bytes::from_static(b"content"), &a, &cancel)
            .await?;
        storage.copy(&a, &b, &cancel).await?;

        let prefix = RemotePath::from_string("tenants/t1/timelines/b")?;
        assert_eq!(storage.list(Some(&prefix), &cancel).await?, vec![b.clone()]);
        assert_eq!(
            storage.download(&b, &cancel).await?,
            Bytes::from_static(b"content")
        );

        let missing = RemotePath::from_string("tenants/t2")?;
        assert!(storage.list(Some(&missing), &cancel).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_download() -> anyhow::Result<()> {
        let (storage, _root) = create_storage()?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let target = RemotePath::from_string("whatever")?;
        let res = storage.download(&target, &cancel).await;
        // select! picks branches in random order, both outcomes are terminal
        assert!(
            matches!(res, Err(DownloadError::Cancelled | DownloadError::NotFound)),
            "{res:?}"
        );
        Ok(())
    }
}
