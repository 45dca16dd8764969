//! Dirwatch CLI - dw command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use watcher::{FilterConfig, WatchEvent, Watcher, WatcherConfig, DEFAULT_BUFFER_CAPACITY};

/// Dirwatch - Watch a directory tree and print every change
#[derive(Parser)]
#[command(name = "dw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to watch
    path: PathBuf,

    /// Watch only the directory itself, not its subtree
    #[arg(long)]
    flat: bool,

    /// Only report entries whose name matches this glob (* and ?)
    #[arg(long, default_value = "*")]
    pattern: String,

    /// Kernel event buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_size: usize,

    /// Also report metadata changes (permissions, ownership, timestamps)
    #[arg(long)]
    attributes: bool,

    /// Also report read accesses (noisy)
    #[arg(long)]
    access: bool,

    /// Do not report content writes
    #[arg(long)]
    no_writes: bool,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = WatcherConfig {
        root: cli.path.clone(),
        recursive: !cli.flat,
        filter: FilterConfig {
            file_names: true,
            dir_names: true,
            last_write: !cli.no_writes,
            attributes: cli.attributes,
            access: cli.access,
            pattern: cli.pattern,
        },
        buffer_capacity: cli.buffer_size,
    };

    let watcher = Watcher::start(config)
        .with_context(|| format!("failed to watch {}", cli.path.display()))?;
    info!(
        "watching {} ({} directories)",
        cli.path.display(),
        watcher.watched_paths().len()
    );

    for event in watcher.events().iter() {
        match event {
            WatchEvent::Created(path) => println!("created  {}", path.display()),
            WatchEvent::Deleted(path) => println!("deleted  {}", path.display()),
            WatchEvent::Changed(path) => println!("changed  {}", path.display()),
            WatchEvent::Renamed { from, to } => {
                println!("renamed  {} -> {}", from.display(), to.display())
            }
            WatchEvent::Overflow => eprintln!("overflow: events were dropped, tree rescanned"),
            WatchEvent::Error(msg) => eprintln!("error: {}", msg),
        }
    }

    // Channel closed: the session ended on its own (for example the watched
    // root was deleted)
    anyhow::bail!("watch session ended")
}
