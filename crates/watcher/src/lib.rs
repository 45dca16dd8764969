//! Recursive inotify-backed directory watching
//!
//! Maintains a live mirror of a directory subtree as kernel watch
//! descriptors and translates the raw event stream into semantic
//! create/delete/change/rename notifications:
//! - Dynamic tree growth and pruning as directories appear and vanish
//! - Rename correlation via kernel cookies
//! - Kernel queue-overflow detection and full-tree rebuild
//! - Filtering (change kinds and name glob) before events reach the caller
//!
//! The engine runs on one dedicated background thread; events are delivered
//! through a channel returned by [`Watcher::start`].

pub mod error;
pub mod filter;
pub mod inotify;
pub mod translate;
pub mod tree;

mod engine;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use error::WatchError;
pub use filter::{FilterConfig, NamePattern, NotifyFilters};
pub use inotify::{EventMask, RawEvent, Session, DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
pub use translate::{EventSink, Translator};
pub use tree::{WatchNode, WatchTree};

use inotify::Canceller;

/// Watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory to watch
    pub root: PathBuf,

    /// Watch the whole subtree, growing and shrinking the watch set as
    /// directories are created, renamed and deleted (default: true)
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Change-kind and name filtering
    #[serde(default)]
    pub filter: FilterConfig,

    /// Kernel event buffer size in bytes; clamped to a 4 KiB floor
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl WatcherConfig {
    /// Configuration with defaults for the given root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
            filter: FilterConfig::default(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

/// Semantic file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Entry created (or moved in from outside the watched tree)
    Created(PathBuf),
    /// Entry deleted (or moved out of the watched tree)
    Deleted(PathBuf),
    /// Entry content or metadata changed
    Changed(PathBuf),
    /// Entry renamed within the watched tree
    Renamed { from: PathBuf, to: PathBuf },
    /// Kernel dropped events; under recursive watching the tree has been
    /// rebuilt and callers should rescan anything they mirror
    Overflow,
    /// Engine-level error; session-fatal errors are followed by loop exit
    Error(String),
}

/// Handle to a running watch session
///
/// Dropping the handle stops the session: the background thread is woken,
/// all watches are deregistered, and the kernel handle is closed.
pub struct Watcher {
    cancel: Arc<Canceller>,
    thread: Option<JoinHandle<()>>,
    events: Receiver<WatchEvent>,
    tree: Arc<Mutex<WatchTree>>,
}

impl Watcher {
    /// Open a session, register the tree, and start the processing loop
    ///
    /// Root registration failure is fatal. A watch-limit failure while
    /// growing the initial subtree is not: it is delivered as a
    /// [`WatchEvent::Error`] and the unreachable subtree stays unwatched.
    pub fn start(config: WatcherConfig) -> Result<Self, WatchError> {
        let filters = config.filter.filters();
        let pattern = NamePattern::new(&config.filter.pattern);
        let mask = filters.event_mask();

        let session = Session::open(config.buffer_capacity)?;
        let mut tree = WatchTree::init(&session, &config.root, mask, config.recursive)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        if config.recursive {
            if let Err(err) = tree.register_subtree(&session) {
                // Best-effort degradation: report and keep watching what
                // was registered
                warn!("initial subtree registration incomplete: {}", err);
                let _ = tx.send(WatchEvent::Error(err.to_string()));
            }
        }
        debug!(
            "watching {} ({} directories)",
            config.root.display(),
            tree.len()
        );

        let translator = Translator::new(filters, pattern, config.recursive, channel_sink(&tx));
        let cancel = session.canceller();
        let tree = Arc::new(Mutex::new(tree));

        let thread = {
            let tree = Arc::clone(&tree);
            let cancel = Arc::clone(&cancel);
            let recursive = config.recursive;
            std::thread::Builder::new()
                .name("watcher-events".to_string())
                .spawn(move || engine::run(session, tree, translator, cancel, recursive))
                .map_err(WatchError::SessionCreateFailed)?
        };

        Ok(Self {
            cancel,
            thread: Some(thread),
            events: rx,
            tree,
        })
    }

    /// Channel of semantic events
    ///
    /// The channel closes when the session ends, whether through [`stop`]
    /// or a session-fatal error.
    ///
    /// [`stop`]: Watcher::stop
    pub fn events(&self) -> &Receiver<WatchEvent> {
        &self.events
    }

    /// Full paths of all currently watched directories, sorted
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.tree.lock().watched_paths()
    }

    /// Stop the session and wait for the processing loop to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watch loop panicked during shutdown");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the loop's callback set from a channel sender
///
/// The loop ends up owning only these closures, never the `Watcher` handle
/// itself.
fn channel_sink(tx: &Sender<WatchEvent>) -> EventSink {
    EventSink {
        on_created: {
            let tx = tx.clone();
            Box::new(move |path| {
                let _ = tx.send(WatchEvent::Created(path));
            })
        },
        on_deleted: {
            let tx = tx.clone();
            Box::new(move |path| {
                let _ = tx.send(WatchEvent::Deleted(path));
            })
        },
        on_changed: {
            let tx = tx.clone();
            Box::new(move |path| {
                let _ = tx.send(WatchEvent::Changed(path));
            })
        },
        on_renamed: {
            let tx = tx.clone();
            Box::new(move |to, from| {
                let _ = tx.send(WatchEvent::Renamed { from, to });
            })
        },
        on_error: {
            let tx = tx.clone();
            Box::new(move |err| {
                let _ = tx.send(WatchEvent::Error(err.to_string()));
            })
        },
        on_overflow: {
            let tx = tx.clone();
            Box::new(move || {
                let _ = tx.send(WatchEvent::Overflow);
            })
        },
    }
}

/// Convenience: start watching with default configuration
pub fn watch(root: impl AsRef<Path>) -> Result<Watcher, WatchError> {
    Watcher::start(WatcherConfig::new(root.as_ref()))
}
