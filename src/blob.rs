use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;
use tokio_util::io::ReaderStream;

use crate::errors;

/// Size of the chunks handed to the network layer when streaming a blob
/// back. Downloads never buffer more than one chunk at a time.
pub const CHUNK_SIZE: usize = 1024;

/// Suffix of staged upload files. The cleanup sweep relies on it to tell a
/// staged upload from a promoted blob.
pub const STAGING_SUFFIX: &str = ".part";

/// Blob storage rooted at a single directory. Blobs are addressed by an
/// opaque storage key chosen by the caller (a uuid in practice), never by a
/// user supplied filename.
///
/// Writes are two-phase: bytes go to `<key>.part` first, and [`promote`]
/// renames the staged file to its final name once the catalog row is
/// committed. A crash in between leaves a `.part` file for the cleanup
/// sweep, never a half-written blob visible to readers.
///
/// [`promote`]: BlobStore::promote
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        BlobStore { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", key, STAGING_SUFFIX))
    }

    /// Open the staged file for `key`, creating the root directory if
    /// needed. The caller streams the upload into the returned handle.
    pub async fn create_staged(&self, key: &str) -> errors::Result<fs::File> {
        fs::create_dir_all(&self.root).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.staging_path(key))
            .await?;
        Ok(file)
    }

    /// Atomically move the staged bytes to their final location.
    pub async fn promote(&self, key: &str) -> errors::Result<()> {
        fs::rename(self.staging_path(key), self.blob_path(key)).await?;
        Ok(())
    }

    /// Drop a staged upload, e.g. after an IO error mid-stream. A missing
    /// staged file is not an error.
    pub async fn discard(&self, key: &str) -> errors::Result<()> {
        match fs::remove_file(self.staging_path(key)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::metadata(self.blob_path(key)).await.is_ok()
    }

    /// Stream a blob back in [`CHUNK_SIZE`] chunks. Returns `None` when no
    /// blob exists under `key` (e.g. the catalog row was committed but the
    /// promote never happened). Dropping the stream stops chunk production,
    /// which is how a client disconnect mid-download is handled.
    pub async fn read_stream(&self, key: &str) -> errors::Result<Option<ReaderStream<fs::File>>> {
        match fs::File::open(self.blob_path(key)).await {
            Ok(file) => Ok(Some(ReaderStream::with_capacity(file, CHUNK_SIZE))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    async fn write_blob(store: &BlobStore, key: &str, content: &[u8]) {
        let mut staged = store.create_staged(key).await.unwrap();
        staged.write_all(content).await.unwrap();
        staged.shutdown().await.unwrap();
        store.promote(key).await.unwrap();
    }

    #[tokio::test]
    async fn staged_write_is_invisible_until_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let mut staged = store.create_staged("k1").await.unwrap();
        staged.write_all(b"hello").await.unwrap();
        staged.shutdown().await.unwrap();
        assert!(!store.exists("k1").await);

        store.promote("k1").await.unwrap();
        assert!(store.exists("k1").await);
    }

    #[tokio::test]
    async fn staged_files_carry_the_shared_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let mut staged = store.create_staged("k1").await.unwrap();
        staged.shutdown().await.unwrap();
        assert!(dir.path().join(format!("k1{}", STAGING_SUFFIX)).exists());
    }

    #[tokio::test]
    async fn discard_removes_staged_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let mut staged = store.create_staged("k1").await.unwrap();
        staged.write_all(b"partial").await.unwrap();
        staged.shutdown().await.unwrap();
        store.discard("k1").await.unwrap();
        assert!(!store.exists("k1").await);
        // second discard is a no-op
        store.discard("k1").await.unwrap();
    }

    #[tokio::test]
    async fn read_stream_yields_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        // more than 10 chunks, not a multiple of the chunk size
        let content: Vec<u8> = (0..10 * CHUNK_SIZE + 37).map(|i| (i % 251) as u8).collect();
        write_blob(&store, "big", &content).await;

        let mut stream = store.read_stream("big").await.unwrap().unwrap();
        let mut total = Vec::new();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= CHUNK_SIZE);
            total.extend_from_slice(&chunk);
            chunks += 1;
        }
        assert_eq!(total, content);
        assert!(chunks >= 10);
    }

    #[tokio::test]
    async fn read_stream_of_missing_blob_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(store.read_stream("nope").await.unwrap().is_none());
    }
}
