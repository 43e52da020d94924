//!
//! # 下载快照
//! 协调器持有的只读快照，每次更新都整体替换
//!

use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::download::chunk_range::{ChunkInfo, ChunkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub chunks: Vec<ChunkInfo>,
}

/// Download status as a function of its chunks:
/// all completed wins, then any failed, then the pause flag.
pub fn derive_status(chunks: &[ChunkInfo], pause_requested: bool) -> DownloadStatus {
    if chunks.iter().all(|c| c.status == ChunkStatus::Completed) {
        DownloadStatus::Completed
    } else if chunks.iter().any(|c| c.status == ChunkStatus::Failed) {
        DownloadStatus::Failed
    } else if pause_requested {
        DownloadStatus::Paused
    } else {
        DownloadStatus::Downloading
    }
}

fn downloaded_sum(chunks: &[ChunkInfo]) -> u64 {
    chunks.iter().map(|c| c.downloaded_bytes).sum()
}

/// In-flight chunks of a transfer that stopped are recorded as paused.
fn park_in_flight(chunks: &mut [ChunkInfo]) {
    for chunk in chunks {
        if matches!(chunk.status, ChunkStatus::Downloading | ChunkStatus::Pending) {
            chunk.status = ChunkStatus::Paused;
        }
    }
}

impl DownloadInfo {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            file_path: file_path.into(),
            total_size: 0,
            downloaded_size: 0,
            status: DownloadStatus::Pending,
            chunks: Vec::new(),
        }
    }

    pub fn target_path(&self) -> PathBuf {
        self.file_path.join(&self.file_name)
    }

    pub fn progress(&self) -> f64 {
        if self.total_size > 0 {
            self.downloaded_size as f64 / self.total_size as f64
        } else {
            0.0
        }
    }

    pub fn with_status(&self, status: DownloadStatus) -> Self {
        Self { status, ..self.clone() }
    }

    /// Replaces one chunk and recomputes the aggregate fields.
    pub fn with_chunk(&self, updated: ChunkInfo, pause_requested: bool) -> Self {
        let mut chunks: Vec<ChunkInfo> = self.chunks
            .iter()
            .map(|c| if c.id == updated.id { updated.clone() } else { c.clone() })
            .collect();

        let status = derive_status(&chunks, pause_requested);
        if status == DownloadStatus::Failed {
            park_in_flight(&mut chunks);
        }

        Self {
            downloaded_size: downloaded_sum(&chunks),
            status,
            chunks,
            ..self.clone()
        }
    }

    pub fn paused(&self) -> Self {
        let mut chunks = self.chunks.clone();
        park_in_flight(&mut chunks);

        Self { status: DownloadStatus::Paused, chunks, ..self.clone() }
    }

    /// Unfinished chunks go back to pending so a queued chunk that used to be
    /// failed does not fail the resumed transfer before its worker runs.
    pub fn resumed(&self) -> Self {
        let chunks = self.chunks
            .iter()
            .map(|c| match c.status {
                ChunkStatus::Paused | ChunkStatus::Failed => ChunkInfo { status: ChunkStatus::Pending, ..c.clone() },
                _ => c.clone(),
            })
            .collect();

        Self { status: DownloadStatus::Downloading, chunks, ..self.clone() }
    }

    /// Normalizes a snapshot loaded after a restart: nothing can still be in flight.
    pub fn restored(&self) -> Self {
        let mut chunks = self.chunks.clone();
        park_in_flight(&mut chunks);

        Self {
            downloaded_size: downloaded_sum(&chunks),
            status: derive_status(&chunks, true),
            chunks,
            ..self.clone()
        }
    }

    /// Chunk ids are `0..n` in order and the ranges tile `[0, total_size)`
    /// without gaps, with no chunk claiming more bytes than it holds.
    pub fn has_valid_layout(&self) -> bool {
        if self.chunks.is_empty() || self.total_size == 0 {
            return false;
        }

        let mut next_start = 0;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.id != index
                || chunk.range.start != next_start
                || chunk.range.end < chunk.range.start
                || chunk.downloaded_bytes > chunk.len()
            {
                return false;
            }
            next_start = chunk.range.end + 1;
        }

        next_start == self.total_size
    }

    pub fn cancelled(&self) -> Self {
        Self {
            downloaded_size: 0,
            status: DownloadStatus::Cancelled,
            chunks: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::chunk_range::plan_chunks;

    fn create_info(total_size: u64, chunk_size: u64) -> DownloadInfo {
        DownloadInfo {
            total_size,
            status: DownloadStatus::Downloading,
            chunks: plan_chunks(total_size, chunk_size).unwrap(),
            ..DownloadInfo::new("http://localhost/file.bin", "file.bin", "/tmp")
        }
    }

    fn chunk_with(info: &DownloadInfo, id: usize, downloaded_bytes: u64, status: ChunkStatus) -> ChunkInfo {
        ChunkInfo { downloaded_bytes, status, ..info.chunks[id].clone() }
    }

    #[test]
    fn should_derive_status() {
        let info = create_info(300, 100);
        let mut chunks = info.chunks.clone();

        assert_eq!(derive_status(&chunks, false), DownloadStatus::Downloading);
        assert_eq!(derive_status(&chunks, true), DownloadStatus::Paused);

        chunks[1].status = ChunkStatus::Failed;
        assert_eq!(derive_status(&chunks, true), DownloadStatus::Failed);

        for chunk in chunks.iter_mut() {
            chunk.status = ChunkStatus::Completed;
        }
        assert_eq!(derive_status(&chunks, true), DownloadStatus::Completed);
    }

    #[test]
    fn should_keep_downloaded_size_equal_to_chunk_sum() {
        let mut info = create_info(1000, 300);
        let updates = [
            (0, 100, ChunkStatus::Downloading),
            (2, 50, ChunkStatus::Downloading),
            (0, 300, ChunkStatus::Completed),
            (3, 100, ChunkStatus::Completed),
            (1, 120, ChunkStatus::Downloading),
            (2, 300, ChunkStatus::Completed),
            (1, 300, ChunkStatus::Completed),
        ];

        for (id, bytes, status) in updates {
            let chunk = chunk_with(&info, id, bytes, status);
            info = info.with_chunk(chunk, false);
            let sum: u64 = info.chunks.iter().map(|c| c.downloaded_bytes).sum();
            assert_eq!(info.downloaded_size, sum);
        }

        assert_eq!(info.downloaded_size, 1000);
        assert_eq!(info.status, DownloadStatus::Completed);
    }

    #[test]
    fn should_park_other_chunks_when_one_fails() {
        let info = create_info(300, 100);
        let info = info.with_chunk(chunk_with(&info, 0, 100, ChunkStatus::Completed), false);
        let info = info.with_chunk(chunk_with(&info, 1, 40, ChunkStatus::Downloading), false);
        let info = info.with_chunk(chunk_with(&info, 2, 10, ChunkStatus::Failed), false);

        assert_eq!(info.status, DownloadStatus::Failed);
        let statuses: Vec<ChunkStatus> = info.chunks.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ChunkStatus::Completed, ChunkStatus::Paused, ChunkStatus::Failed]);
        assert_eq!(info.downloaded_size, 150);
    }

    #[test]
    fn should_reset_unfinished_chunks_on_resume() {
        let info = create_info(300, 100);
        let info = info.with_chunk(chunk_with(&info, 0, 100, ChunkStatus::Completed), false);
        let info = info.with_chunk(chunk_with(&info, 2, 10, ChunkStatus::Failed), false);

        let resumed = info.resumed();
        assert_eq!(resumed.status, DownloadStatus::Downloading);
        let statuses: Vec<ChunkStatus> = resumed.chunks.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ChunkStatus::Completed, ChunkStatus::Pending, ChunkStatus::Pending]);
        assert_eq!(resumed.chunks[2].downloaded_bytes, 10);
    }

    #[test]
    fn should_restore_interrupted_snapshot_as_paused() {
        let info = create_info(300, 100);
        let info = info.with_chunk(chunk_with(&info, 0, 100, ChunkStatus::Completed), false);
        let info = info.with_chunk(chunk_with(&info, 1, 70, ChunkStatus::Downloading), false);

        let restored = info.restored();
        assert_eq!(restored.status, DownloadStatus::Paused);
        assert_eq!(restored.chunks[1].status, ChunkStatus::Paused);
        assert_eq!(restored.chunks[2].status, ChunkStatus::Paused);
        assert_eq!(restored.downloaded_size, 170);
    }

    #[test]
    fn should_validate_chunk_layout() {
        let info = create_info(1000, 300);
        assert!(info.has_valid_layout());

        let mut gap = info.clone();
        gap.chunks[1].range.start += 1;
        assert!(!gap.has_valid_layout());

        let mut inverted = info.clone();
        inverted.chunks[2].range.end = inverted.chunks[2].range.start - 1;
        assert!(!inverted.has_valid_layout());

        let mut short = info.clone();
        short.total_size = 1200;
        assert!(!short.has_valid_layout());

        let mut overfull = info.clone();
        overfull.chunks[0].downloaded_bytes = 301;
        assert!(!overfull.has_valid_layout());

        let mut reordered = info.clone();
        reordered.chunks.swap(0, 1);
        assert!(!reordered.has_valid_layout());

        assert!(!DownloadInfo::new("http://localhost/a.bin", "a.bin", "/tmp").has_valid_layout());
    }

    #[test]
    fn should_clear_chunks_on_cancel() {
        let info = create_info(300, 100);
        let info = info.with_chunk(chunk_with(&info, 0, 100, ChunkStatus::Completed), false);

        let cancelled = info.cancelled();
        assert_eq!(cancelled.status, DownloadStatus::Cancelled);
        assert_eq!(cancelled.downloaded_size, 0);
        assert!(cancelled.chunks.is_empty());
    }
}
