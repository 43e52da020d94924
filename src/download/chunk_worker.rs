use std::sync::Arc;
use futures_util::StreamExt;
use log::{debug, error, warn};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use crate::download::chunk_range::{ChunkInfo, ChunkStatus};
use crate::download::error::{DownloadEndCause, DownloadError};
use crate::download::fetcher::{RangeFetcher, DEFAULT_BLOCK_SIZE};
use crate::download::shared_file::SharedFile;

/// Receives every state change of a chunk, with the error when it failed.
pub type ChunkUpdateFn = Arc<dyn Fn(&ChunkInfo, Option<&DownloadError>) + Send + Sync>;

/// Downloads the missing part of one chunk into the shared file.
pub struct ChunkWorker {
    chunk: ChunkInfo,
    client: Client,
    url: String,
    block_size: usize,
    file: Arc<SharedFile>,
    cancel_token: CancellationToken,
    on_update: ChunkUpdateFn,
}

impl ChunkWorker {
    pub fn new(
        chunk: ChunkInfo,
        client: Client,
        url: impl Into<String>,
        file: Arc<SharedFile>,
        cancel_token: CancellationToken,
        on_update: ChunkUpdateFn,
    ) -> Self {
        Self {
            chunk,
            client,
            url: url.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            file,
            cancel_token,
            on_update,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    fn emit(&self, error: Option<&DownloadError>) {
        (self.on_update)(&self.chunk, error);
    }

    /// 等待线程池许可后再下载，排队时被取消则直接退出
    pub async fn run_in_pool(self, pool: Arc<Semaphore>) -> Option<ChunkInfo> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return None,
            permit = pool.acquire_owned() => permit.ok()?,
        };

        let chunk = self.run().await;
        drop(permit);

        Some(chunk)
    }

    /// Drives the chunk to `Completed`, `Paused` or `Failed` and returns its final state.
    pub async fn run(mut self) -> ChunkInfo {
        if self.chunk.is_complete() {
            debug!("Chunk {} already complete", self.chunk.id);
            self.chunk.status = ChunkStatus::Completed;
            self.emit(None);
            return self.chunk;
        }

        self.chunk.status = ChunkStatus::Downloading;
        self.emit(None);

        let failure = match self.download().await {
            Ok(DownloadEndCause::Finished) => {
                debug!("Chunk {} finished", self.chunk.id);
                self.chunk.status = ChunkStatus::Completed;
                None
            }
            Ok(DownloadEndCause::Paused) => {
                debug!("Chunk {} paused at {} bytes", self.chunk.id, self.chunk.downloaded_bytes);
                self.chunk.status = ChunkStatus::Paused;
                None
            }
            // 暂停/取消时连接被中断，不算失败
            Err(err) if self.cancel_token.is_cancelled() => {
                debug!("Chunk {} interrupted: {}", self.chunk.id, err);
                self.chunk.status = ChunkStatus::Paused;
                None
            }
            Err(err) => {
                error!("Chunk {} failed: {}", self.chunk.id, err);
                self.chunk.status = ChunkStatus::Failed;
                Some(err)
            }
        };

        self.emit(failure.as_ref());
        self.chunk
    }

    async fn download(&mut self) -> Result<DownloadEndCause, DownloadError> {
        let Some(range) = self.chunk.remaining_range() else {
            return Ok(DownloadEndCause::Finished);
        };
        let fetcher = RangeFetcher::new(self.client.clone(), self.url.clone(), range)
            .with_block_size(self.block_size);

        let blocks = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Ok(DownloadEndCause::Paused),
            blocks = fetcher.open() => blocks?,
        };
        futures_util::pin_mut!(blocks);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Ok(DownloadEndCause::Paused),
                next = blocks.next() => next,
            };
            let Some(block) = next else {
                return Ok(DownloadEndCause::Finished);
            };
            let mut block = block?;

            if self.cancel_token.is_cancelled() {
                return Ok(DownloadEndCause::Paused);
            }

            let remaining = self.chunk.remaining_len();
            if block.len() as u64 > remaining {
                warn!("Chunk {} received more bytes than requested, dropping the excess", self.chunk.id);
                block.truncate(remaining as usize);
            }

            self.file.write_at(self.chunk.write_offset(), &block).await?;
            self.chunk.downloaded_bytes += block.len() as u64;
            self.emit(None);

            if self.chunk.is_complete() {
                return Ok(DownloadEndCause::Finished);
            }
        }
    }
}
