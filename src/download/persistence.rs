//!
//! # 持久化模块
//! 用于将下载信息持久化到硬盘，用于断点恢复
//!

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::download::chunk_range::ChunkInfo;
use crate::download::download_info::{DownloadInfo, DownloadStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub url: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub chunks: Vec<ChunkInfo>,
    // 毫秒时间戳，用于排序
    pub timestamp: i64,
}

impl DownloadRecord {
    pub fn target_path(&self) -> PathBuf {
        self.file_path.join(&self.file_name)
    }

    pub fn to_info(&self) -> DownloadInfo {
        DownloadInfo {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            total_size: self.total_size,
            downloaded_size: self.downloaded_size,
            status: self.status,
            chunks: self.chunks.clone(),
        }
    }
}

/// Durable store of download records, consulted on start to resume earlier transfers.
pub trait DownloadRepository: Send + Sync {
    /// The most recently created record for `url`.
    fn find_by_url(&self, url: &str) -> Result<Option<DownloadRecord>>;

    fn create(
        &self,
        url: &str,
        file_name: &str,
        file_path: &Path,
        total_size: u64,
        chunks: &[ChunkInfo],
    ) -> Result<i64>;

    fn update(&self, id: i64, info: &DownloadInfo) -> Result<()>;

    fn find_by_id(&self, id: i64) -> Result<Option<DownloadRecord>>;

    fn delete(&self, record: &DownloadRecord) -> Result<()>;

    /// Every record, newest first.
    fn list(&self) -> Result<Vec<DownloadRecord>>;
}

#[derive(Serialize, Deserialize, Default)]
pub struct PersistenceState {
    pub next_id: i64,
    pub records: Vec<DownloadRecord>,
}

impl PersistenceState {
    pub fn load_from_file(file_path: &Path) -> Result<Self> {
        if file_path.exists() {
            let data = fs::read_to_string(file_path)?;
            let state: PersistenceState = serde_json::from_str(&data)
                .with_context(|| format!("Parse download records failed: {}", file_path.display()))?;

            Ok(state)
        } else {
            Ok(PersistenceState::default())
        }
    }

    /// 先写临时文件再重命名，避免写到一半时崩溃留下损坏的记录
    pub fn save_to_file(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(self)?;
        let tmp_path = file_path.with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, file_path)
            .with_context(|| format!("Save download records failed: {}", file_path.display()))?;

        Ok(())
    }
}

/// Records kept in memory and, when a path is given, mirrored to a JSON file
/// after every change.
pub struct JsonRepository {
    path: Option<PathBuf>,
    state: Mutex<PersistenceState>,
}

impl JsonRepository {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = PersistenceState::load_from_file(&path)?;

        Ok(Self { path: Some(path), state: Mutex::new(state) })
    }

    pub fn in_memory() -> Self {
        Self { path: None, state: Mutex::new(PersistenceState::default()) }
    }

    fn save(&self, state: &PersistenceState) -> Result<()> {
        match &self.path {
            Some(path) => state.save_to_file(path),
            None => Ok(()),
        }
    }
}

impl DownloadRepository for JsonRepository {
    fn find_by_url(&self, url: &str) -> Result<Option<DownloadRecord>> {
        let state = self.state.lock();
        let record = state.records
            .iter()
            .filter(|r| r.url == url)
            .max_by_key(|r| (r.timestamp, r.id))
            .cloned();

        Ok(record)
    }

    fn create(
        &self,
        url: &str,
        file_name: &str,
        file_path: &Path,
        total_size: u64,
        chunks: &[ChunkInfo],
    ) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.records.push(DownloadRecord {
            id,
            url: url.to_string(),
            file_name: file_name.to_string(),
            file_path: file_path.to_path_buf(),
            total_size,
            downloaded_size: 0,
            status: DownloadStatus::Downloading,
            chunks: chunks.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        self.save(&state)?;

        Ok(id)
    }

    fn update(&self, id: i64, info: &DownloadInfo) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("Download record {} not found", id))?;

        record.url = info.url.clone();
        record.file_name = info.file_name.clone();
        record.file_path = info.file_path.clone();
        record.total_size = info.total_size;
        record.downloaded_size = info.downloaded_size;
        record.status = info.status;
        record.chunks = info.chunks.clone();
        self.save(&state)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<DownloadRecord>> {
        let state = self.state.lock();
        Ok(state.records.iter().find(|r| r.id == id).cloned())
    }

    fn delete(&self, record: &DownloadRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.records.retain(|r| r.id != record.id);
        self.save(&state)
    }

    fn list(&self) -> Result<Vec<DownloadRecord>> {
        let state = self.state.lock();
        let mut records = state.records.clone();
        records.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));

        Ok(records)
    }
}

/// Removes the local file of a record and then the record itself.
/// The record is removed even if the file is already gone.
pub fn delete_download(repository: &dyn DownloadRepository, record: &DownloadRecord) -> Result<()> {
    let path = record.target_path();
    let removed = match fs::remove_file(&path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    };
    repository.delete(record)?;

    removed.with_context(|| format!("Delete file failed: {}", path.display()))
}

/// A published snapshot of the coordinator, tagged with the record it belongs to.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub record_id: Option<i64>,
    pub revision: u64,
    pub info: Arc<DownloadInfo>,
}

/// Writes snapshots to the repository, skipping any older than the last one written.
pub struct SnapshotWriter {
    repository: Arc<dyn DownloadRepository>,
    last_revision: Mutex<u64>,
}

impl SnapshotWriter {
    pub fn new(repository: Arc<dyn DownloadRepository>) -> Self {
        Self { repository, last_revision: Mutex::new(0) }
    }

    pub fn write(&self, snapshot: &Snapshot) {
        let Some(record_id) = snapshot.record_id else { return };

        let mut last_revision = self.last_revision.lock();
        if snapshot.revision <= *last_revision {
            return;
        }

        match self.repository.update(record_id, &snapshot.info) {
            Ok(_) => *last_revision = snapshot.revision,
            Err(err) => warn!("Persist download {} failed: {:#}", record_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::chunk_range::{plan_chunks, ChunkStatus};

    fn create_record(repository: &dyn DownloadRepository, url: &str) -> i64 {
        let chunks = plan_chunks(300, 100).unwrap();
        repository.create(url, "file.bin", Path::new("/tmp/downloads"), 300, &chunks).unwrap()
    }

    #[test]
    fn should_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("downloads.json");

        let id = {
            let repository = JsonRepository::open(&path).unwrap();
            let id = create_record(&repository, "http://localhost/a.bin");

            let mut info = repository.find_by_id(id).unwrap().unwrap().to_info();
            info.chunks[0].downloaded_bytes = 100;
            info.chunks[0].status = ChunkStatus::Completed;
            info.downloaded_size = 100;
            info.status = DownloadStatus::Paused;
            repository.update(id, &info).unwrap();
            id
        };

        let repository = JsonRepository::open(&path).unwrap();
        let record = repository.find_by_url("http://localhost/a.bin").unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.status, DownloadStatus::Paused);
        assert_eq!(record.downloaded_size, 100);
        assert_eq!(record.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(record.target_path(), PathBuf::from("/tmp/downloads/file.bin"));

        // id 在重新加载后继续递增
        let next = create_record(&repository, "http://localhost/b.bin");
        assert!(next > id);
    }

    #[test]
    fn should_find_latest_record_for_url() {
        let repository = JsonRepository::in_memory();
        let first = create_record(&repository, "http://localhost/a.bin");
        let second = create_record(&repository, "http://localhost/a.bin");
        create_record(&repository, "http://localhost/b.bin");

        assert_eq!(repository.find_by_url("http://localhost/a.bin").unwrap().unwrap().id, second);
        assert!(repository.find_by_url("http://localhost/c.bin").unwrap().is_none());

        let record = repository.find_by_id(second).unwrap().unwrap();
        repository.delete(&record).unwrap();
        assert_eq!(repository.find_by_url("http://localhost/a.bin").unwrap().unwrap().id, first);
        assert_eq!(repository.list().unwrap().len(), 2);
    }

    #[test]
    fn should_fail_to_update_unknown_record() {
        let repository = JsonRepository::in_memory();
        let info = DownloadInfo::new("http://localhost/a.bin", "a.bin", "/tmp");
        assert!(repository.update(42, &info).is_err());
    }

    #[test]
    fn should_delete_file_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let repository = JsonRepository::in_memory();
        let chunks = plan_chunks(10, 10).unwrap();
        let id = repository.create("http://localhost/a.bin", "a.bin", dir.path(), 10, &chunks).unwrap();
        fs::write(dir.path().join("a.bin"), [0u8; 10]).unwrap();

        let record = repository.find_by_id(id).unwrap().unwrap();
        delete_download(&repository, &record).unwrap();
        assert!(!dir.path().join("a.bin").exists());
        assert!(repository.find_by_id(id).unwrap().is_none());

        // 文件已不存在时同样可以删除记录
        let id = repository.create("http://localhost/a.bin", "a.bin", dir.path(), 10, &chunks).unwrap();
        let record = repository.find_by_id(id).unwrap().unwrap();
        delete_download(&repository, &record).unwrap();
        assert!(repository.find_by_id(id).unwrap().is_none());
    }

    #[test]
    fn should_skip_stale_snapshots() {
        let repository = Arc::new(JsonRepository::in_memory());
        let id = create_record(repository.as_ref(), "http://localhost/a.bin");
        let writer = SnapshotWriter::new(repository.clone());
        let info = repository.find_by_id(id).unwrap().unwrap().to_info();

        let newer = Snapshot { record_id: Some(id), revision: 5, info: Arc::new(info.with_status(DownloadStatus::Paused)) };
        let older = Snapshot { record_id: Some(id), revision: 4, info: Arc::new(info.with_status(DownloadStatus::Downloading)) };
        writer.write(&newer);
        writer.write(&older);

        assert_eq!(repository.find_by_id(id).unwrap().unwrap().status, DownloadStatus::Paused);
    }
}
