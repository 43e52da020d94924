use std::collections::Bound;
use std::fmt;
use std::ops::RangeBounds;
use serde::{Deserialize, Serialize};
use crate::download::error::DownloadError;

/// 闭区间 [start, end] 的字节范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// 0 for an inverted range read from a damaged record.
    pub fn len(&self) -> u64 {
        self.end.checked_sub(self.start).map_or(0, |span| span + 1)
    }

    pub fn from_len(start: u64, len: u64) -> Self {
        Self { start, end: start + len - 1 }
    }

    pub fn to_range_header(&self) -> Option<headers::Range> {
        headers::Range::bytes(self).ok()
    }
}

impl<'a> RangeBounds<u64> for &'a ChunkRange {
    fn start_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.end)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

/// One chunk of the target file and how much of it is already on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: usize,
    pub range: ChunkRange,
    pub downloaded_bytes: u64,
    pub status: ChunkStatus,
}

impl ChunkInfo {
    pub fn new(id: usize, range: ChunkRange) -> Self {
        Self {
            id,
            range,
            downloaded_bytes: 0,
            status: ChunkStatus::Pending,
        }
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn remaining_len(&self) -> u64 {
        self.len().saturating_sub(self.downloaded_bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_bytes >= self.len()
    }

    /// 下一次写入在文件中的绝对偏移
    pub fn write_offset(&self) -> u64 {
        self.range.start + self.downloaded_bytes
    }

    /// The part of the range that still has to be fetched, `None` once complete.
    pub fn remaining_range(&self) -> Option<ChunkRange> {
        if self.is_complete() {
            None
        } else {
            Some(ChunkRange::new(self.write_offset(), self.range.end))
        }
    }
}

/// Splits `[0, content_length)` into consecutive ranges of `chunk_size`,
/// the last one taking whatever is left.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    chunk_size: u64,
    content_length: u64,
    cursor: u64,
}

impl ChunkPlanner {
    pub fn new(chunk_size: u64, content_length: u64) -> Result<Self, DownloadError> {
        if content_length == 0 {
            return Err(DownloadError::InvalidPlan("content length is zero".to_string()));
        }
        if chunk_size == 0 {
            return Err(DownloadError::InvalidPlan("chunk size is zero".to_string()));
        }

        Ok(Self { chunk_size, content_length, cursor: 0 })
    }
}

impl Iterator for ChunkPlanner {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.cursor >= self.content_length {
            return None;
        }

        let len = self.chunk_size.min(self.content_length - self.cursor);
        let range = ChunkRange::from_len(self.cursor, len);
        self.cursor += len;

        Some(range)
    }
}

pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkInfo>, DownloadError> {
    let chunks = ChunkPlanner::new(chunk_size, total_size)?
        .enumerate()
        .map(|(id, range)| ChunkInfo::new(id, range))
        .collect();

    Ok(chunks)
}
