//!
//! # 终端交互
//! 进度条输出、Ctrl-C 暂停以及历史记录的展示
//!

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use log::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use range_downloader::download::callback::DownloadProgressCallback;
use range_downloader::download::coordinator::DownloadCoordinator;
use range_downloader::download::download_info::DownloadInfo;
use range_downloader::download::persistence::{delete_download, DownloadRecord, DownloadRepository};
use crate::progress_bar::{byte_unit, ProgressBar};

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

pub enum Outcome {
    Completed(PathBuf),
    Failed(String),
}

struct Redraw {
    bar: ProgressBar,
    last_instant: Instant,
    last_downloaded: u64,
}

/// Draws the progress bar and reports the end of the transfer over a channel.
pub struct ConsoleReporter {
    redraw: Mutex<Redraw>,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl ConsoleReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outcome>) {
        let (outcomes, receiver) = mpsc::unbounded_channel();
        let reporter = Self {
            redraw: Mutex::new(Redraw {
                bar: ProgressBar::new(100),
                last_instant: Instant::now(),
                last_downloaded: 0,
            }),
            outcomes,
        };

        (reporter, receiver)
    }

    fn draw(&self, info: &DownloadInfo, force: bool) {
        let mut redraw = self.redraw.lock();
        let elapsed = redraw.last_instant.elapsed();
        if !force && elapsed < REDRAW_INTERVAL {
            return;
        }

        let delta = info.downloaded_size.saturating_sub(redraw.last_downloaded);
        let speed = (delta as f64 / elapsed.as_secs_f64().max(0.001)) as u64;
        redraw.last_instant = Instant::now();
        redraw.last_downloaded = info.downloaded_size;

        if let Err(err) = redraw.bar.print(info.downloaded_size, info.total_size, speed) {
            warn!("Draw progress failed: {}", err);
        }
    }
}

impl DownloadProgressCallback for ConsoleReporter {
    fn on_progress_update(&self, info: &DownloadInfo) {
        if info.total_size > 0 {
            self.draw(info, false);
        }
    }

    fn on_download_completed(&self, info: &DownloadInfo) {
        self.draw(info, true);
        let _ = self.outcomes.send(Outcome::Completed(info.target_path()));
    }

    fn on_download_failed(&self, _info: &DownloadInfo, error: &str) {
        let _ = self.outcomes.send(Outcome::Failed(error.to_string()));
    }
}

/// Runs one transfer until it completes, fails, or Ctrl-C pauses it.
pub async fn run_get(
    coordinator: &DownloadCoordinator,
    mut outcomes: mpsc::UnboundedReceiver<Outcome>,
    url: &str,
    dir: &Path,
    name: &str,
) -> Result<()> {
    // 进度条会回退一行
    println!("Downloading {} -> {}\n", url, dir.join(name).display());
    coordinator.start(url, dir, name).await?;

    tokio::select! {
        outcome = outcomes.recv() => match outcome {
            Some(Outcome::Completed(path)) => {
                println!("\nSaved to {}", path.display());
                Ok(())
            }
            Some(Outcome::Failed(error)) => {
                bail!("Download failed: {}, run the same command again to resume", error)
            }
            None => Err(anyhow!("Download ended without a result")),
        },
        signal = tokio::signal::ctrl_c() => {
            signal.context("Listen for Ctrl-C failed")?;
            coordinator.pause();
            if let Some(info) = coordinator.snapshot() {
                let (done, done_unit) = byte_unit(info.downloaded_size);
                println!("\nPaused at {:.2} {}, run the same command again to resume", done, done_unit);
            }
            Ok(())
        }
    }
}

fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp_millis(timestamp)
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_record(record: &DownloadRecord) -> String {
    let progress = if record.total_size > 0 {
        record.downloaded_size as f64 * 100.0 / record.total_size as f64
    } else {
        0.0
    };
    let (total, total_unit) = byte_unit(record.total_size);

    format!(
        "{:>4}  {}  {:<11}  {:>6.2}%  {:>8.2} {:<2}  {}",
        record.id,
        format_timestamp(record.timestamp),
        format!("{:?}", record.status),
        progress,
        total,
        total_unit,
        record.target_path().display(),
    )
}

pub fn print_history(repository: &dyn DownloadRepository) -> Result<()> {
    let records = repository.list()?;
    if records.is_empty() {
        println!("No downloads recorded");
        return Ok(());
    }

    for record in &records {
        println!("{}", format_record(record));
    }

    Ok(())
}

pub fn remove(repository: &dyn DownloadRepository, id: i64) -> Result<()> {
    let record = repository
        .find_by_id(id)?
        .with_context(|| format!("Download {} not found", id))?;
    delete_download(repository, &record)?;
    println!("Removed {}", record.target_path().display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use range_downloader::download::chunk_range::plan_chunks;
    use range_downloader::download::download_info::DownloadStatus;
    use range_downloader::download::persistence::JsonRepository;
    use super::*;

    #[test]
    fn should_format_record_line() {
        let repository = JsonRepository::in_memory();
        let chunks = plan_chunks(2048, 1024).unwrap();
        let id = repository.create("http://localhost/a.bin", "a.bin", Path::new("/tmp"), 2048, &chunks).unwrap();
        let mut info = repository.find_by_id(id).unwrap().unwrap().to_info();
        info.downloaded_size = 1024;
        info.status = DownloadStatus::Paused;
        repository.update(id, &info).unwrap();

        let line = format_record(&repository.find_by_id(id).unwrap().unwrap());
        assert!(line.contains("Paused"));
        assert!(line.contains("50.00%"));
        assert!(line.contains("2.00 KB"));
        assert!(line.ends_with("a.bin"));
    }

    #[test]
    fn should_fail_to_remove_unknown_download() {
        let repository = JsonRepository::in_memory();
        assert!(remove(&repository, 7).is_err());
    }

    #[test]
    fn should_report_outcome_once_finished() {
        let (reporter, mut receiver) = ConsoleReporter::new();
        let info = DownloadInfo::new("http://localhost/a.bin", "a.bin", "/tmp");

        reporter.on_download_failed(&info, "Chunk 0 failed: boom");
        match receiver.try_recv().unwrap() {
            Outcome::Failed(error) => assert_eq!(error, "Chunk 0 failed: boom"),
            Outcome::Completed(_) => panic!("unexpected completion"),
        }
        assert!(receiver.try_recv().is_err());
    }
}
