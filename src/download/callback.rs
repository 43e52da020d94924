use crate::download::download_info::DownloadInfo;

/// Receives progress and lifecycle events of a transfer.
///
/// Every method is called while the coordinator holds its update lock, so
/// implementations must return quickly and must not call back into the coordinator.
pub trait DownloadProgressCallback: Send + Sync {
    fn on_progress_update(&self, _info: &DownloadInfo) {}

    fn on_chunk_progress_update(&self, _chunk_id: usize, _downloaded_bytes: u64) {}

    fn on_download_completed(&self, _info: &DownloadInfo) {}

    fn on_download_failed(&self, _info: &DownloadInfo, _error: &str) {}
}

/// 不关心进度时使用
pub struct NoopCallback;

impl DownloadProgressCallback for NoopCallback {}
