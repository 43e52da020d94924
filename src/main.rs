use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use range_downloader::download::build_coordinator;
use range_downloader::download::config::Config;
use range_downloader::download::logger::setup_logger;
use range_downloader::download::persistence::JsonRepository;
use crate::cli::{file_name_from_url, CliArgs, Command};
use crate::console::ConsoleReporter;

mod cli;
mod console;
mod progress_bar;

const DEFAULT_FILE_NAME: &str = "download";

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = Config::load_or_default(&args.config)?;
    setup_logger(config.log_level(), config.log_file.as_deref())?;

    match args.command {
        Command::Get { url, name, dir } => {
            let name = name
                .or_else(|| file_name_from_url(&url))
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
            let dir = dir.unwrap_or_else(|| config.download_dir.clone());

            let (reporter, outcomes) = ConsoleReporter::new();
            let (coordinator, _) = build_coordinator(Arc::new(config), Arc::new(reporter))?;
            console::run_get(&coordinator, outcomes, &url, &dir, &name).await
        }
        Command::History => {
            let repository = JsonRepository::open(&config.database_file)?;
            console::print_history(&repository)
        }
        Command::Remove { id } => {
            let repository = JsonRepository::open(&config.database_file)?;
            console::remove(&repository, id)
        }
    }
}
