//!
//! # 下载协调器
//! 持有线程池、共享文件与唯一的下载快照，汇总各 chunk 的进度
//!

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Weak};
use futures_util::Stream;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::download::callback::DownloadProgressCallback;
use crate::download::chunk_range::{plan_chunks, ChunkInfo, ChunkStatus};
use crate::download::chunk_worker::{ChunkUpdateFn, ChunkWorker};
use crate::download::config::Config;
use crate::download::download_info::{DownloadInfo, DownloadStatus};
use crate::download::error::DownloadError;
use crate::download::persistence::{DownloadRepository, Snapshot, SnapshotWriter};
use crate::download::shared_file::SharedFile;
use crate::download::util::{build_http_client, probe_content_length};

const CHUNK_FAILED_MESSAGE: &str = "One or more chunks failed to download";

struct CoordinatorState {
    info: Option<Arc<DownloadInfo>>,
    record_id: Option<i64>,
    file: Option<Arc<SharedFile>>,
    pool: Arc<Semaphore>,
    cancel_token: CancellationToken,
    workers: HashMap<usize, JoinHandle<()>>,
    pause_requested: bool,
    // 每次提交、暂停、取消都会递增，旧 worker 的回调据此丢弃
    generation: u64,
    revision: u64,
}

impl CoordinatorState {
    fn new(pool_size: usize) -> Self {
        Self {
            info: None,
            record_id: None,
            file: None,
            pool: Arc::new(Semaphore::new(pool_size)),
            cancel_token: CancellationToken::new(),
            workers: HashMap::new(),
            pause_requested: false,
            generation: 0,
            revision: 0,
        }
    }

    fn status(&self) -> Option<DownloadStatus> {
        self.info.as_ref().map(|info| info.status)
    }

    fn snapshot_of(&mut self, info: Arc<DownloadInfo>) -> Snapshot {
        self.revision += 1;
        Snapshot { record_id: self.record_id, revision: self.revision, info }
    }

    /// Replaces the canonical snapshot.
    fn publish(&mut self, info: DownloadInfo) -> Snapshot {
        let info = Arc::new(info);
        self.info = Some(info.clone());
        self.snapshot_of(info)
    }

    /// Stops every worker of the current generation and closes the file.
    fn release(&mut self) {
        self.cancel_token.cancel();
        self.workers.clear();
        self.file = None;
    }
}

struct Shared {
    config: Arc<Config>,
    runtime: Handle,
    client: Client,
    repository: Arc<dyn DownloadRepository>,
    callback: Arc<dyn DownloadProgressCallback>,
    writer: Arc<SnapshotWriter>,
    snapshots: watch::Sender<Option<Snapshot>>,
    state: Mutex<CoordinatorState>,
}

enum Prepared {
    Completed { info: DownloadInfo, record_id: i64 },
    Resume { info: DownloadInfo, record_id: i64 },
    Fresh { info: DownloadInfo, record_id: i64, file: Arc<SharedFile> },
}

impl Shared {
    fn pool_size(&self) -> usize {
        self.config.max_concurrent_downloads.max(1)
    }

    fn broadcast(&self, snapshot: &Snapshot) {
        self.snapshots.send_replace(Some(snapshot.clone()));
    }

    // 记录文件是同步读写，统一放到 blocking 线程池
    fn spawn_write(&self, snapshot: Snapshot) -> JoinHandle<()> {
        let writer = self.writer.clone();
        self.runtime.spawn_blocking(move || writer.write(&snapshot))
    }

    /// Persists in the background, callable from sync code.
    fn persist(&self, snapshot: Snapshot) {
        self.spawn_write(snapshot);
    }

    async fn persist_and_wait(&self, snapshot: Snapshot) {
        if let Err(err) = self.spawn_write(snapshot).await {
            warn!("Persist task failed: {}", err);
        }
    }

    async fn with_repository<T, F>(&self, f: F) -> Result<T, DownloadError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DownloadRepository) -> anyhow::Result<T> + Send + 'static,
    {
        let repository = self.repository.clone();
        let result = self.runtime
            .spawn_blocking(move || f(repository.as_ref()))
            .await
            .map_err(anyhow::Error::from)?;

        Ok(result?)
    }

    /// Single serialization point for every worker update.
    fn on_chunk_update(&self, generation: u64, chunk: &ChunkInfo, error: Option<&DownloadError>) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!("Dropping update of chunk {} from an old worker", chunk.id);
                return;
            }
            let Some(current) = state.info.clone() else { return };
            if !matches!(current.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                return;
            }

            let next = current.with_chunk(chunk.clone(), state.pause_requested);
            let snapshot = state.publish(next);
            self.broadcast(&snapshot);
            self.callback.on_progress_update(&snapshot.info);
            self.callback.on_chunk_progress_update(chunk.id, chunk.downloaded_bytes);

            match snapshot.info.status {
                DownloadStatus::Completed => {
                    info!("Download completed: {}", snapshot.info.target_path().display());
                    if let Some(file) = state.file.clone() {
                        tokio::spawn(async move {
                            if let Err(err) = file.sync().await {
                                warn!("Sync {} failed: {}", file.path().display(), err);
                            }
                        });
                    }
                    state.release();
                    self.callback.on_download_completed(&snapshot.info);
                }
                DownloadStatus::Failed => {
                    let message = match error {
                        Some(err) => format!("Chunk {} failed: {}", chunk.id, err),
                        None => CHUNK_FAILED_MESSAGE.to_string(),
                    };
                    error!("Download failed: {} ({})", snapshot.info.url, message);
                    state.release();
                    self.callback.on_download_failed(&snapshot.info, &message);
                }
                // 普通进度交给后台任务合并写入
                _ => return,
            }

            snapshot
        };

        self.persist(snapshot);
    }

    /// Spawns one worker per unfinished chunk. Must be called with the state lock held.
    fn submit_chunks(self: &Arc<Self>, state: &mut CoordinatorState) {
        let Some(info) = state.info.clone() else { return };
        let Some(file) = state.file.clone() else {
            error!("No open file for {}, cannot start chunk downloads", info.url);
            return;
        };

        state.cancel_token = CancellationToken::new();
        state.generation += 1;
        let generation = state.generation;

        let pending: Vec<&ChunkInfo> = info.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .collect();
        debug!("Submitting {} of {} chunks for {}", pending.len(), info.chunks.len(), info.url);

        for chunk in pending {
            let shared: Weak<Shared> = Arc::downgrade(self);
            let on_update: ChunkUpdateFn = Arc::new(move |chunk, error| {
                if let Some(shared) = shared.upgrade() {
                    shared.on_chunk_update(generation, chunk, error);
                }
            });

            let worker = ChunkWorker::new(
                chunk.clone(),
                self.client.clone(),
                info.url.clone(),
                file.clone(),
                state.cancel_token.clone(),
                on_update,
            ).with_block_size(self.config.block_size);

            let pool = state.pool.clone();
            let handle = tokio::spawn(async move {
                worker.run_in_pool(pool).await;
            });
            state.workers.insert(chunk.id, handle);
        }
    }

    /// Marks the transfer failed after a setup error, changing nothing but the status.
    /// Returns the snapshot to persist, `None` if the setup was superseded.
    fn fail(&self, generation: u64, fallback: DownloadInfo, message: &str) -> Option<Snapshot> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return None;
        }

        let current = state.info.as_deref().cloned().unwrap_or(fallback);
        let snapshot = state.publish(current.with_status(DownloadStatus::Failed));
        state.release();
        self.broadcast(&snapshot);
        self.callback.on_download_failed(&snapshot.info, message);

        Some(snapshot)
    }
}

/// 持久化由后台任务完成，每个 block 的进度只写最新的一份
fn spawn_persister(runtime: &Handle, writer: Arc<SnapshotWriter>, mut receiver: watch::Receiver<Option<Snapshot>>) {
    let blocking = runtime.clone();
    runtime.spawn(async move {
        while receiver.changed().await.is_ok() {
            let snapshot = receiver.borrow_and_update().clone();
            if let Some(snapshot) = snapshot {
                let writer = writer.clone();
                if let Err(err) = blocking.spawn_blocking(move || writer.write(&snapshot)).await {
                    warn!("Persist task failed: {}", err);
                }
            }
        }
    });
}

async fn remove_file_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            warn!("Delete partial file {} failed: {}", path.display(), err);
        }
        _ => {}
    }
}

/// Runs one transfer at a time: plans chunks, feeds them to a bounded worker
/// pool and folds their updates into a single [`DownloadInfo`] snapshot.
///
/// Must be created inside a tokio runtime.
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    pub fn new(
        config: Arc<Config>,
        repository: Arc<dyn DownloadRepository>,
        callback: Arc<dyn DownloadProgressCallback>,
    ) -> Result<Self, DownloadError> {
        let client = build_http_client(&config)?;
        Ok(Self::with_client(config, client, repository, callback))
    }

    pub fn with_client(
        config: Arc<Config>,
        client: Client,
        repository: Arc<dyn DownloadRepository>,
        callback: Arc<dyn DownloadProgressCallback>,
    ) -> Self {
        let runtime = Handle::current();
        let writer = Arc::new(SnapshotWriter::new(repository.clone()));
        let (snapshots, receiver) = watch::channel(None);
        spawn_persister(&runtime, writer.clone(), receiver);

        let pool_size = config.max_concurrent_downloads.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                client,
                repository,
                callback,
                writer,
                snapshots,
                state: Mutex::new(CoordinatorState::new(pool_size)),
            }),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<DownloadInfo>> {
        self.shared.state.lock().info.clone()
    }

    pub fn current_download_id(&self) -> Option<i64> {
        self.shared.state.lock().record_id
    }

    /// Every snapshot published from now on, starting with the current one.
    pub fn progress_stream(&self) -> impl Stream<Item = Arc<DownloadInfo>> + 'static {
        let mut receiver = self.shared.snapshots.subscribe();

        async_stream::stream! {
            let current = receiver.borrow_and_update().as_ref().map(|s| s.info.clone());
            if let Some(info) = current {
                yield info;
            }

            while receiver.changed().await.is_ok() {
                let next = receiver.borrow_and_update().as_ref().map(|s| s.info.clone());
                if let Some(info) = next {
                    yield info;
                }
            }
        }
    }

    /// Starts a transfer of `url` into `file_path/file_name`, resuming a
    /// persisted one when the local file still matches it.
    pub async fn start(&self, url: &str, file_path: impl AsRef<Path>, file_name: &str) -> Result<(), DownloadError> {
        let file_path = file_path.as_ref().to_path_buf();
        let placeholder = DownloadInfo::new(url, file_name, file_path.clone());

        let generation = {
            let mut state = self.shared.state.lock();
            if matches!(state.status(), Some(DownloadStatus::Pending | DownloadStatus::Downloading)) {
                warn!("Another download is already in progress");
                return Err(DownloadError::AlreadyDownloading);
            }

            // 清理上一次下载留下的状态
            state.release();
            state.pause_requested = false;
            state.record_id = None;
            state.generation += 1;
            let snapshot = state.publish(placeholder.clone());
            self.shared.broadcast(&snapshot);
            state.generation
        };

        match self.prepare(generation, url, &file_path, file_name).await {
            Ok(prepared) => self.install(generation, prepared).await,
            Err(err) => {
                error!("Start failed: {}", err);
                if let Some(snapshot) = self.shared.fail(generation, placeholder, &err.to_string()) {
                    self.shared.persist_and_wait(snapshot).await;
                }
                Err(err)
            }
        }
    }

    async fn prepare(&self, generation: u64, url: &str, file_path: &Path, file_name: &str) -> Result<Prepared, DownloadError> {
        Url::parse(url)?;
        let target = file_path.join(file_name);

        let lookup = url.to_string();
        let existing = self.shared
            .with_repository(move |repository| repository.find_by_url(&lookup))
            .await?
            .filter(|record| record.status != DownloadStatus::Cancelled);

        // 旧记录保留在历史里，新的下载会插入一条更新的记录
        if let Some(record) = existing {
            let info = record.to_info();
            let local_len = tokio::fs::metadata(&target).await.map(|m| m.len()).ok();
            if !info.has_valid_layout() {
                warn!("Record {} has a damaged chunk list, starting over", record.id);
            } else if local_len == Some(record.total_size) {
                let info = info.restored();
                if info.status == DownloadStatus::Completed {
                    return Ok(Prepared::Completed { info, record_id: record.id });
                }

                info!("Found existing record for {}, resuming", url);
                return Ok(Prepared::Resume { info, record_id: record.id });
            } else {
                debug!("Record {} no longer matches {}, starting over", record.id, target.display());
            }
        }

        info!("Starting new download for {}", url);
        let total_size = probe_content_length(&self.shared.client, url).await?;
        let chunks = plan_chunks(total_size, self.shared.config.chunk_size)?;

        let record_id = {
            let url = url.to_string();
            let file_name = file_name.to_string();
            let file_path = file_path.to_path_buf();
            let chunks = chunks.clone();
            self.shared
                .with_repository(move |repository| repository.create(&url, &file_name, &file_path, total_size, &chunks))
                .await?
        };

        let info = DownloadInfo {
            url: url.to_string(),
            file_name: file_name.to_string(),
            file_path: file_path.to_path_buf(),
            total_size,
            downloaded_size: 0,
            status: DownloadStatus::Pending,
            chunks,
        };
        {
            // 记录已经建立，之后的失败只改状态，不能把大小和分块写回空值
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.record_id = Some(record_id);
                state.info = Some(Arc::new(info.clone()));
            }
        }

        tokio::fs::create_dir_all(file_path).await?;
        let file = SharedFile::create(&target, total_size).await?;

        Ok(Prepared::Fresh {
            info: info.with_status(DownloadStatus::Downloading),
            record_id,
            file: Arc::new(file),
        })
    }

    async fn install(&self, generation: u64, prepared: Prepared) -> Result<(), DownloadError> {
        match prepared {
            Prepared::Completed { info, record_id } => {
                let snapshot = {
                    let mut state = self.shared.state.lock();
                    if state.generation != generation {
                        return Ok(());
                    }
                    state.record_id = Some(record_id);
                    let snapshot = state.publish(info);
                    self.shared.broadcast(&snapshot);
                    self.shared.callback.on_progress_update(&snapshot.info);
                    self.shared.callback.on_download_completed(&snapshot.info);
                    snapshot
                };
                info!("Download already completed: {}", snapshot.info.target_path().display());
                self.shared.persist_and_wait(snapshot).await;
                Ok(())
            }
            Prepared::Resume { info, record_id } => {
                {
                    let mut state = self.shared.state.lock();
                    if state.generation != generation {
                        return Ok(());
                    }
                    state.record_id = Some(record_id);
                    state.pause_requested = true;
                    let snapshot = state.publish(info);
                    self.shared.broadcast(&snapshot);
                }
                self.resume_transfer().await
            }
            Prepared::Fresh { info, record_id, file } => {
                let target = info.target_path();
                let snapshot = {
                    let mut state = self.shared.state.lock();
                    if state.generation == generation {
                        state.record_id = Some(record_id);
                        state.file = Some(file);
                        let snapshot = state.publish(info);
                        self.shared.broadcast(&snapshot);
                        self.shared.callback.on_progress_update(&snapshot.info);
                        self.shared.submit_chunks(&mut state);
                        Some(snapshot)
                    } else {
                        None
                    }
                };

                match snapshot {
                    Some(snapshot) => self.shared.persist_and_wait(snapshot).await,
                    None => {
                        // 准备期间被取消：丢弃刚创建的记录和文件
                        debug!("Setup of record {} was superseded, discarding it", record_id);
                        self.shared.with_repository(move |repository| {
                            if let Some(record) = repository.find_by_id(record_id)? {
                                repository.delete(&record)?;
                            }
                            Ok(())
                        }).await?;
                        remove_file_if_exists(&target).await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Stops every worker and keeps the progress made so far.
    pub fn pause(&self) {
        let snapshot = {
            let mut state = self.shared.state.lock();
            let Some(current) = state.info.clone() else { return };
            if current.status != DownloadStatus::Downloading {
                return;
            }

            state.release();
            state.generation += 1;
            state.pause_requested = true;
            let snapshot = state.publish(current.paused());
            self.shared.broadcast(&snapshot);
            self.shared.callback.on_progress_update(&snapshot.info);
            snapshot
        };

        info!("Download paused: {} ({} / {} bytes)", snapshot.info.url, snapshot.info.downloaded_size, snapshot.info.total_size);
        self.shared.persist(snapshot);
    }

    /// Continues a paused or failed transfer from the bytes already on disk.
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let current = {
            let state = self.shared.state.lock();
            match state.info.clone() {
                Some(info) if matches!(info.status, DownloadStatus::Paused | DownloadStatus::Failed) => info,
                _ => return Ok(()),
            }
        };

        // 准备阶段就失败了，没有可以续传的内容，重新开始
        let target_exists = tokio::fs::try_exists(current.target_path()).await.unwrap_or(false);
        if current.chunks.is_empty() || (current.downloaded_size == 0 && !target_exists) {
            return self.start(&current.url, &current.file_path, &current.file_name).await;
        }

        self.resume_transfer().await
    }

    async fn resume_transfer(&self) -> Result<(), DownloadError> {
        let (generation, current) = {
            let state = self.shared.state.lock();
            match state.info.clone() {
                Some(info) if matches!(info.status, DownloadStatus::Paused | DownloadStatus::Failed) => (state.generation, info),
                _ => return Ok(()),
            }
        };

        let opened = SharedFile::open(current.target_path(), current.total_size).await;

        let (snapshot, result) = {
            let mut state = self.shared.state.lock();
            if state.generation != generation {
                return Ok(());
            }

            match opened {
                Ok(file) => {
                    state.file = Some(Arc::new(file));
                    state.pause_requested = false;
                    let resumed = current.resumed();
                    let nothing_left = resumed.chunks.iter().all(|c| c.status == ChunkStatus::Completed);

                    if nothing_left {
                        let snapshot = state.publish(resumed.with_status(DownloadStatus::Completed));
                        state.release();
                        self.shared.broadcast(&snapshot);
                        self.shared.callback.on_progress_update(&snapshot.info);
                        self.shared.callback.on_download_completed(&snapshot.info);
                        (snapshot, Ok(()))
                    } else {
                        let snapshot = state.publish(resumed);
                        self.shared.broadcast(&snapshot);
                        self.shared.callback.on_progress_update(&snapshot.info);
                        self.shared.submit_chunks(&mut state);
                        info!("Download resumed: {}", snapshot.info.url);
                        (snapshot, Ok(()))
                    }
                }
                Err(err) => {
                    let err = DownloadError::ResumeIOFailed(err);
                    error!("Resume failed: {}", err);
                    let snapshot = state.publish(current.with_status(DownloadStatus::Failed));
                    state.release();
                    self.shared.broadcast(&snapshot);
                    self.shared.callback.on_download_failed(&snapshot.info, &err.to_string());
                    (snapshot, Err(err))
                }
            }
        };

        self.shared.persist_and_wait(snapshot).await;
        result
    }

    /// Stops the transfer, deletes the partial file and forgets it.
    pub async fn cancel(&self) {
        let (info, record_id, workers) = {
            let mut state = self.shared.state.lock();
            state.cancel_token.cancel();
            state.generation += 1;
            state.pause_requested = false;
            // 换一个新的线程池，旧池里排队的 worker 直接退出
            state.pool.close();
            state.pool = Arc::new(Semaphore::new(self.shared.pool_size()));
            state.file = None;

            let workers: Vec<JoinHandle<()>> = state.workers.drain().map(|(_, handle)| handle).collect();
            (state.info.take(), state.record_id.take(), workers)
        };

        for handle in workers {
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("Chunk worker ended abnormally: {}", err);
                }
            }
        }

        let Some(info) = info else { return };
        let cancelled = Arc::new(info.cancelled());
        let snapshot = {
            let mut state = self.shared.state.lock();
            let mut snapshot = state.snapshot_of(cancelled);
            snapshot.record_id = record_id;
            snapshot
        };
        self.shared.broadcast(&snapshot);
        self.shared.callback.on_progress_update(&snapshot.info);
        self.shared.persist_and_wait(snapshot).await;

        remove_file_if_exists(&info.target_path()).await;
        info!("Download cancelled: {}", info.url);
    }
}
