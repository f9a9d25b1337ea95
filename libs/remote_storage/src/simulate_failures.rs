//! This module provides a wrapper around a real RemoteStorage implementation that
//! causes the first N attempts at each upload or download operatio to fail. For
//! testing purposes.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{DownloadError, GenericRemoteStorage, RemotePath, RemoteStorage};

pub struct UnreliableWrapper {
    inner: GenericRemoteStorage,

    // This many attempts of each operation will fail, then we let it succeed.
    attempts_to_fail: u64,

    // Tracks how many failed attempts of each operation has been made.
    attempts: Mutex<HashMap<RemoteOp, u64>>,
}

/// Used to identify retries of different unique operation.
#[derive(Debug, Hash, Eq, PartialEq)]
enum RemoteOp {
    ListPrefixes(Option<RemotePath>),
    Upload(RemotePath),
    Download(RemotePath),
    Delete(RemotePath),
    Copy(RemotePath, RemotePath),
}

impl UnreliableWrapper {
    pub fn new(inner: GenericRemoteStorage, attempts_to_fail: u64) -> Self {
        assert!(attempts_to_fail > 0);
        UnreliableWrapper {
            inner,
            attempts_to_fail,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    ///
    /// Common functionality for all operations.
    ///
    /// On the first attempts of this operation, return an error. After 'attempts_to_fail'
    /// attempts, let the operation go ahead, and clear the counter.
    ///
    fn attempt(&self, op: RemoteOp) -> Result<u64, DownloadError> {
        let mut attempts = self.attempts.lock().unwrap();

        match attempts.entry(op) {
            Entry::Occupied(mut e) => {
                let attempts_before_this = {
                    let p = e.get_mut();
                    *p += 1;
                    *p
                };

                if attempts_before_this >= self.attempts_to_fail {
                    // let it succeed
                    e.remove();
                    Ok(attempts_before_this)
                } else {
                    let error =
                        anyhow::anyhow!("simulated failure of remote operation {:?}", e.key());
                    Err(DownloadError::other(error))
                }
            }
            Entry::Vacant(e) => {
                let error = anyhow::anyhow!("simulated failure of remote operation {:?}", e.key());
                e.insert(1);
                Err(DownloadError::other(error))
            }
        }
    }

    fn attempt_anyhow(&self, op: RemoteOp) -> anyhow::Result<u64> {
        self.attempt(op).map_err(anyhow::Error::new)
    }
}

#[async_trait::async_trait]
impl RemoteStorage for UnreliableWrapper {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemotePath>, DownloadError> {
        self.attempt(RemoteOp::ListPrefixes(prefix.cloned()))?;
        self.inner.list(prefix, cancel).await
    }

    async fn upload(
        &self,
        from: Bytes,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.attempt_anyhow(RemoteOp::Upload(to.clone()))?;
        self.inner.upload(from, to, cancel).await
    }

    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        self.attempt(RemoteOp::Download(from.clone()))?;
        self.inner.download(from, cancel).await
    }

    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.attempt_anyhow(RemoteOp::Delete(path.clone()))?;
        self.inner.delete(path, cancel).await
    }

    async fn copy(
        &self,
        from: &RemotePath,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.attempt_anyhow(RemoteOp::Copy(from.clone(), to.clone()))?;
        self.inner.copy(from, to, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::LocalFs;

    #[tokio::test]
    async fn fails_first_attempts_then_succeeds() -> anyhow::Result<()> {
        let root = camino_tempfile::tempdir()?;
        let local = LocalFs::new(root.path().to_owned(), Duration::from_secs(10))?;
        let storage =
            GenericRemoteStorage::unreliable_wrapper(GenericRemoteStorage::LocalFs(local), 2);
        let cancel = CancellationToken::new();

        let path = RemotePath::from_string("some/object")?;
        assert!(storage
            .upload(Bytes::from_static(b"data"), &path, &cancel)
            .await
            .is_err());
        storage
            .upload(Bytes::from_static(b"data"), &path, &cancel)
            .await?;

        let first = storage.download(&path, &cancel).await;
        assert!(matches!(first, Err(DownloadError::Other(_))), "{first:?}");
        assert!(!first.unwrap_err().is_permanent());
        assert_eq!(
            storage.download(&path, &cancel).await?,
            Bytes::from_static(b"data")
        );

        // the counter is reset after a success
        assert!(storage.download(&path, &cancel).await.is_err());
        Ok(())
    }
}
