//!
//! 配置模块
//!

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_downloads: usize,
    pub chunk_size: u64,
    // 每次从响应体读取并写入文件的块大小
    pub block_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub download_dir: PathBuf,
    pub database_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    pub fn load_from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();
        let config_data = fs::read_to_string(file_path)
            .with_context(|| format!("Read config failed: {}", file_path.display()))?;
        let config: Config = serde_json::from_str(&config_data)
            .with_context(|| format!("Parse config failed: {}", file_path.display()))?;

        Ok(config)
    }

    /// A missing config file is not an error, the defaults are used instead.
    pub fn load_or_default(file_path: impl AsRef<Path>) -> Result<Self> {
        if file_path.as_ref().exists() {
            Self::load_from_file(file_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = dirs::download_dir().unwrap_or_else(|| PathBuf::from("."));
        let mut database_file = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        database_file.push("range-downloader");
        database_file.push("downloads.json");

        Self {
            max_concurrent_downloads: 4,
            chunk_size: 2 * 1024 * 1024,
            block_size: 8 * 1024,
            connect_timeout_secs: 15,
            read_timeout_secs: 15,
            download_dir,
            database_file,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}
