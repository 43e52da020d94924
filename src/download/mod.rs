use std::sync::Arc;
use anyhow::{Context, Result};
use crate::download::callback::DownloadProgressCallback;
use crate::download::config::Config;
use crate::download::coordinator::DownloadCoordinator;
use crate::download::persistence::JsonRepository;

pub mod callback;
pub mod chunk_range;
pub mod chunk_worker;
pub mod config;
pub mod coordinator;
pub mod download_info;
pub mod error;
pub mod fetcher;
pub mod logger;
pub mod persistence;
pub mod shared_file;
pub mod util;

/// 按配置打开记录文件并创建协调器，记录仓库同时返回给调用方用于查询历史
pub fn build_coordinator(
    config: Arc<Config>,
    callback: Arc<dyn DownloadProgressCallback>,
) -> Result<(DownloadCoordinator, Arc<JsonRepository>)> {
    let repository = Arc::new(JsonRepository::open(&config.database_file)?);
    let coordinator = DownloadCoordinator::new(config, repository.clone(), callback)
        .context("Create download coordinator failed")?;

    Ok((coordinator, repository))
}
