use std::fmt::Write;
use std::io::{self, stdout};
use std::time::Instant;
use crossterm::cursor::{MoveToColumn, MoveToPreviousLine};
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};

const FALLBACK_WIDTH: usize = 80;

/// Two-line progress bar that redraws itself in place.
pub struct ProgressBar {
    bar_buf: String,
    buf: String,
    start_instant: Instant,
    bar_width: usize,
}

impl ProgressBar {
    pub fn new(max_width: usize) -> Self {
        Self {
            buf: String::new(),
            bar_buf: String::new(),
            start_instant: Instant::now(),
            bar_width: crossterm::terminal::size().ok()
                .map(|(cols, _rows)| usize::from(cols))
                .filter(|cols| *cols > 0)
                .unwrap_or(FALLBACK_WIDTH)
                .min(max_width),
        }
    }

    fn update(&mut self, downloaded_len: u64, total_len: u64, speed: u64) -> Result<&str, std::fmt::Error> {
        let progress = if total_len > 0 {
            (downloaded_len.min(total_len) * 100 / total_len) as usize
        } else {
            0
        };

        let (downloaded_len_size, downloaded_len_unit) = byte_unit(downloaded_len);
        let (total_len_size, total_len_unit) = byte_unit(total_len);
        let (speed_size, speed_unit) = byte_unit(speed);

        self.bar_buf.clear();
        self.buf.clear();
        let duration = self.start_instant.elapsed();
        write!(self.bar_buf, "{speed_size:.2} {speed_unit}/s - {progress} % - elapsed: {duration:.2?} ")?;
        write!(self.buf, "{downloaded_len_size:.2} {downloaded_len_unit} / {total_len_size:.2} {total_len_unit}")?;
        let padding = self.bar_width.saturating_sub(self.bar_buf.len() + self.buf.len());
        self.bar_buf.extend(std::iter::repeat(' ').take(padding));
        writeln!(self.bar_buf, "{}", self.buf)?;

        let bar_p_width = self.bar_width.saturating_sub(2);
        let progress_width = progress * bar_p_width / 100;
        self.bar_buf.push('[');
        self.bar_buf.extend(std::iter::repeat('█').take(progress_width));
        self.bar_buf.extend(std::iter::repeat(' ').take(bar_p_width - progress_width));
        self.bar_buf.push(']');

        Ok(&self.bar_buf)
    }

    /// 覆盖上一次输出的两行，调用前终端上至少要有两行可以回退
    pub fn print(&mut self, downloaded_len: u64, total_len: u64, speed: u64) -> io::Result<()> {
        let update_value = self.update(downloaded_len, total_len, speed)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        execute!(
            stdout(),
            Clear(ClearType::CurrentLine),
            MoveToPreviousLine(1),
            Clear(ClearType::CurrentLine),
            MoveToColumn(0),
            crossterm::style::Print(update_value),
        )
    }
}

pub fn byte_unit(bytes_count: u64) -> (f32, &'static str) {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut i = 0;
    let mut bytes_count = bytes_count as f32;
    while bytes_count >= 1024.0 && i < UNITS.len() - 1 {
        i += 1;
        bytes_count /= 1024.0;
    }
    (bytes_count, UNITS[i])
}
