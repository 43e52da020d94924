use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// The output file shared by every chunk worker of one transfer.
///
/// Seek and write happen under the same lock: with a single cursor, two
/// separate critical sections would let another worker move it in between.
#[derive(Debug)]
pub struct SharedFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl SharedFile {
    /// Creates (or truncates) the file and sets its final length up front.
    pub async fn create(path: impl AsRef<Path>, len: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(len).await?;

        Ok(Self { path, file: Mutex::new(file) })
    }

    /// Re-opens a partially written file without touching its content.
    pub async fn open(path: impl AsRef<Path>, len: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await?;
        if file.metadata().await?.len() != len {
            file.set_len(len).await?;
        }

        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        // tokio 的 File 在后台线程写入，flush 之后错误才会返回
        file.flush().await
    }

    pub async fn sync(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;

    #[tokio::test]
    async fn should_size_file_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sized.bin");

        let file = SharedFile::create(&path, 4096).await.unwrap();
        assert_eq!(file.path(), path.as_path());
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 4096);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_not_interleave_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        let block = 512u64;
        let writers = 8u64;
        let blocks_per_writer = 32u64;
        let total = block * writers * blocks_per_writer;
        let file = Arc::new(SharedFile::create(&path, total).await.unwrap());

        let mut handles = Vec::new();
        for writer in 0..writers {
            let file = file.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..blocks_per_writer {
                    // 交错写入：writer 0 写第 0, 8, 16... 块
                    let index = n * writers + writer;
                    let bytes = vec![writer as u8 + 1; block as usize];
                    file.write_at(index * block, &bytes).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        file.sync().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content.len() as u64, total);
        for (index, block_bytes) in content.chunks(block as usize).enumerate() {
            let expected = (index as u64 % writers) as u8 + 1;
            assert!(block_bytes.iter().all(|b| *b == expected), "block {} corrupted", index);
        }
    }

    #[tokio::test]
    async fn should_keep_content_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.bin");

        let file = SharedFile::create(&path, 100).await.unwrap();
        file.write_at(10, b"hello").await.unwrap();
        drop(file);

        let file = SharedFile::open(&path, 100).await.unwrap();
        file.write_at(50, b"world").await.unwrap();
        drop(file);

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content.len(), 100);
        assert_eq!(&content[10..15], b"hello");
        assert_eq!(&content[50..55], b"world");
    }

    #[tokio::test]
    async fn should_fail_to_reopen_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SharedFile::open(dir.path().join("gone.bin"), 100).await.is_err());
    }
}
