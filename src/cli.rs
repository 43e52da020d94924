use std::path::PathBuf;
use clap::{Parser, Subcommand};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a file, continuing an earlier transfer of the same URL. Ctrl-C pauses.
    Get {
        url: String,

        /// File name, defaults to the last segment of the URL path
        #[arg(short, long)]
        name: Option<String>,

        /// Target directory, defaults to `download_dir` of the config
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// List recorded downloads, newest first
    History,
    /// Delete a recorded download and its local file
    Remove {
        id: i64,
    },
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let name = url.path_segments()?.last()?;

    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
