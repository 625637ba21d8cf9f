// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use blockfetch::download::{suggest_name, ProgressTracker};
use blockfetch::{
    DownloadConfig, DownloadManager, DownloadProgress, ErrorCode, Mission, MissionListener,
    MissionStatus, SqliteCatalog,
};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockfetch-cli")]
#[command(about = "BlockFetch CLI - resumable parallel downloads", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file
    Get {
        url: String,
        /// Destination directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// File name (defaults to the last url segment)
        #[arg(short, long)]
        name: Option<String>,
        /// Worker threads (defaults to the configured value)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
    /// List known downloads
    List,
    /// Continue a paused download
    Resume { index: usize },
    /// Delete a download and its file
    Delete { index: usize },
}

/// Prints a throttled progress line for one mission
struct ProgressPrinter {
    tracker: Mutex<ProgressTracker>,
}

impl MissionListener for ProgressPrinter {
    fn on_progress(&self, _mission: &Arc<Mission>, done: u64, total: u64) {
        let mut tracker = self.tracker.lock();
        if tracker.update(done, total) {
            eprint!("\r{:<100}", tracker.progress().display_string());
            let _ = std::io::stderr().flush();
        }
    }

    fn on_finish(&self, mission: &Arc<Mission>) {
        eprintln!("\r{:<100}", DownloadProgress::of(mission).display_string());
    }

    fn on_error(&self, mission: &Arc<Mission>, code: ErrorCode) {
        self.tracker.lock().set_error(code.to_string());
        eprintln!("\r{:<100}", DownloadProgress::of(mission).display_string());
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DownloadConfig> {
    match path {
        Some(path) => DownloadConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(DownloadConfig::default()),
    }
}

fn open_manager(mut config: DownloadConfig, extra_location: Option<PathBuf>) -> anyhow::Result<DownloadManager> {
    if let Some(location) = extra_location {
        if !config.search_locations.contains(&location) {
            config.search_locations.push(location);
        }
    }
    if config.search_locations.is_empty() {
        config.search_locations.push(PathBuf::from("."));
    }

    let catalog_path = config
        .catalog_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("blockfetch.db"));
    let catalog = SqliteCatalog::open(&catalog_path)
        .with_context(|| format!("opening catalog {}", catalog_path.display()))?;

    Ok(DownloadManager::new(config, Arc::new(catalog))?)
}

/// Block until the mission finishes or fails
fn wait_for(manager: &DownloadManager, index: usize, denied: &AtomicBool) -> anyhow::Result<()> {
    let mission = manager.get_mission(index);
    let printer: Arc<dyn MissionListener> = Arc::new(ProgressPrinter {
        tracker: Mutex::new(ProgressTracker::new(mission.name().to_string(), mission.length())),
    });
    manager.add_listener(index, &printer);

    loop {
        match mission.status() {
            MissionStatus::Finished => return Ok(()),
            MissionStatus::Errored => {
                bail!("{}: {}", mission.name(), DownloadProgress::of(&mission).display_string())
            }
            _ if denied.load(Ordering::SeqCst) => {
                bail!("cannot write to {}", mission.location().display())
            }
            _ => thread::sleep(Duration::from_millis(250)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Get { url, output, name, threads } => {
            let name = match name.or_else(|| suggest_name(&url)) {
                Some(name) => name,
                None => bail!("cannot derive a file name from {}, pass --name", url),
            };

            let manager = open_manager(config, Some(output.clone()))?;
            let denied = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&denied);
            manager.set_permission_denied_handler(move |_, e| {
                eprintln!("{}", e.user_message());
                flag.store(true, Ordering::SeqCst);
            });

            let index = manager.start_mission(&url, &output, &name, false, threads)?;
            wait_for(&manager, index, &denied)?;
            println!("{}", manager.get_mission(index).file_path().display());
        }
        Commands::List => {
            let manager = open_manager(config, None)?;
            for (index, mission) in manager.missions().iter().enumerate() {
                println!(
                    "{:>3}  {}  ({})",
                    index,
                    DownloadProgress::of(mission).display_string(),
                    mission.location().display()
                );
            }
        }
        Commands::Resume { index } => {
            let manager = open_manager(config, None)?;
            if index >= manager.count() {
                bail!("no download at index {}", index);
            }
            let denied = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&denied);
            manager.set_permission_denied_handler(move |_, e| {
                eprintln!("{}", e.user_message());
                flag.store(true, Ordering::SeqCst);
            });

            manager.resume_mission(index);
            wait_for(&manager, index, &denied)?;
        }
        Commands::Delete { index } => {
            let manager = open_manager(config, None)?;
            if index >= manager.count() {
                bail!("no download at index {}", index);
            }
            let name = manager.get_mission(index).name().to_string();
            manager.delete_mission(index)?;
            println!("deleted {}", name);
        }
    }

    Ok(())
}
