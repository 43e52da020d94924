use thiserror::Error;
use tokio::io;

/// 下载中发生的错误
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("A download is already in progress")]
    AlreadyDownloading,

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Could not determine the size of {url}: {reason}")]
    SizeProbeFailed { url: String, reason: String },

    #[error("Invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("Range request bytes={range} failed: {reason}")]
    RangeRequestFailed { range: String, reason: String },

    #[error("File IO failed: {0}")]
    FileIOFailed(#[from] io::Error),

    #[error("Failed to resume: {0}")]
    ResumeIOFailed(#[source] io::Error),

    #[error("Http client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// 单个 chunk 下载结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEndCause {
    Finished,
    Paused,
}
