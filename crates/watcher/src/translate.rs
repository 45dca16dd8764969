//! Event translation and rename correlation
//!
//! Consumes decoded kernel records, resolves them to paths through the watch
//! tree, and emits semantic events through the facade-supplied sink. The
//! rename correlator pairs IN_MOVED_FROM/IN_MOVED_TO records by cookie; an
//! unpaired moved-from degrades to a delete, an unpaired moved-to to a
//! create, because a move across the tree boundary is observably identical
//! to those operations from inside the watched subtree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::WatchError;
use crate::filter::{NamePattern, NotifyFilters};
use crate::inotify::{EventMask, RawEvent, Session};
use crate::tree::WatchTree;

/// How long to wait for the paired moved-to after a moved-from before
/// assuming the entry left the watched tree. Best-effort: under heavy load
/// the paired record can arrive later than this, in which case the rename is
/// reported as a delete followed by a create.
pub(crate) const RENAME_POLL_TIMEOUT: Duration = Duration::from_millis(4);

/// Callback set supplied by the facade
///
/// The processing loop owns this and nothing else of the facade, so stopping
/// the watcher never races a half-dropped owner.
pub struct EventSink {
    pub on_created: Box<dyn Fn(PathBuf) + Send>,
    pub on_deleted: Box<dyn Fn(PathBuf) + Send>,
    pub on_changed: Box<dyn Fn(PathBuf) + Send>,
    /// Arguments are (new path, old path)
    pub on_renamed: Box<dyn Fn(PathBuf, PathBuf) + Send>,
    pub on_error: Box<dyn Fn(WatchError) + Send>,
    pub on_overflow: Box<dyn Fn() + Send>,
}

/// An observed moved-from waiting for its moved-to
///
/// At most one is in flight at a time; kernel ordering guarantees the paired
/// moved-to (if any) is the next record with that cookie.
#[derive(Debug)]
struct PendingRename {
    source: PathBuf,
    /// Set when the moved entry is itself a watched directory
    source_wd: Option<i32>,
    cookie: u32,
}

/// What the processing loop should do after one record
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Kernel queue overflowed; the tree can no longer be trusted
    Overflow,
    /// The watched root itself is gone; the session is over
    RootGone,
}

/// Translates raw records into semantic events
pub struct Translator {
    filters: NotifyFilters,
    pattern: NamePattern,
    recursive: bool,
    pending: Option<PendingRename>,
    sink: EventSink,
}

impl Translator {
    pub fn new(
        filters: NotifyFilters,
        pattern: NamePattern,
        recursive: bool,
        sink: EventSink,
    ) -> Self {
        Self {
            filters,
            pattern,
            recursive,
            pending: None,
            sink,
        }
    }

    /// Process one decoded record
    pub fn process(
        &mut self,
        session: &mut Session,
        tree: &Mutex<WatchTree>,
        event: &RawEvent,
    ) -> Flow {
        // Queue overflow carries wd -1 and must be handled before resolution
        if event.mask.contains(EventMask::IN_Q_OVERFLOW) {
            debug!("kernel event queue overflowed");
            self.flush_pending(session, tree);
            (self.sink.on_overflow)();
            return Flow::Overflow;
        }

        // Resolve the owning node; records for descriptors already removed
        // from the index are an expected race and dropped silently
        let (path, is_root) = {
            let tree = tree.lock();
            if !tree.contains(event.wd) {
                trace!("dropping record for unknown wd {}", event.wd);
                return Flow::Continue;
            }
            match tree.resolve_path(event.wd, event.name.as_deref()) {
                Some(path) => (path, event.wd == tree.root_wd()),
                None => return Flow::Continue,
            }
        };

        // A pending rename can only be completed by a moved-to with the same
        // cookie; anything else proves the source left the watched tree
        let pending_broken = self.pending.as_ref().is_some_and(|pending| {
            pending.cookie != event.cookie || !event.mask.contains(EventMask::IN_MOVED_TO)
        });
        if pending_broken {
            self.flush_pending(session, tree);
        }

        if event.mask.contains(EventMask::IN_CREATE) {
            self.handle_created(session, tree, event, &path);
        } else if event.mask.contains(EventMask::IN_IGNORED) {
            if is_root {
                (self.sink.on_error)(WatchError::RootGone(path));
                return Flow::RootGone;
            }
            // Kernel already invalidated the descriptor; no deregistration
            tree.lock().remove_watch(session, event.wd, false);
        } else if event
            .mask
            .intersects(EventMask::IN_DELETE_SELF | EventMask::IN_MOVE_SELF | EventMask::IN_UNMOUNT)
        {
            if is_root {
                (self.sink.on_error)(WatchError::RootGone(path));
                return Flow::RootGone;
            }
            // Non-root: the parent's delete/move record and the trailing
            // IN_IGNORED cover everything
        } else if event.mask.contains(EventMask::IN_DELETE) {
            self.emit_deleted(&path);
        } else if event.mask.intersects(
            EventMask::IN_MODIFY
                | EventMask::IN_CLOSE_WRITE
                | EventMask::IN_ATTRIB
                | EventMask::IN_ACCESS,
        ) {
            if self.filters.wants_change_for(event.is_dir()) {
                self.emit_changed(&path);
            }
        } else if event.mask.contains(EventMask::IN_MOVED_FROM) {
            self.handle_moved_from(session, tree, event, path);
        } else if event.mask.contains(EventMask::IN_MOVED_TO) {
            self.handle_moved_to(session, tree, event, &path);
        } else {
            trace!("unhandled mask {:?} for {}", event.mask, path.display());
        }

        Flow::Continue
    }

    /// Close a dangling pending rename as a delete
    ///
    /// Called when a non-matching record arrives and by the loop whenever
    /// the read side goes idle, so the state machine never dangles.
    pub fn flush_pending(&mut self, session: &Session, tree: &Mutex<WatchTree>) {
        if let Some(pending) = self.pending.take() {
            debug!(
                "moved-from {} never paired; reporting as delete",
                pending.source.display()
            );
            self.emit_deleted(&pending.source);
            if let Some(wd) = pending.source_wd {
                tree.lock().remove_watch(session, wd, true);
            }
        }
    }

    /// Forward an engine-level error to the facade
    pub fn emit_error(&self, err: WatchError) {
        (self.sink.on_error)(err);
    }

    fn handle_created(
        &mut self,
        session: &mut Session,
        tree: &Mutex<WatchTree>,
        event: &RawEvent,
        path: &Path,
    ) {
        self.emit_created(path);
        if event.is_dir() && self.recursive {
            if let Some(name) = &event.name {
                if let Err(err) = tree.lock().add_watch(session, event.wd, name) {
                    // Best-effort: the subtree stays unwatched
                    self.emit_error(err);
                }
            }
        }
    }

    fn handle_moved_from(
        &mut self,
        session: &mut Session,
        tree: &Mutex<WatchTree>,
        event: &RawEvent,
        path: PathBuf,
    ) {
        let source_wd = if event.is_dir() {
            event
                .name
                .as_deref()
                .and_then(|name| tree.lock().child_by_name(event.wd, name))
        } else {
            None
        };

        // Peek for the paired moved-to before committing to a pending
        // rename; a quiet stream means the entry moved out of the tree
        let more = session.has_buffered_data()
            || match session.poll_for_data(RENAME_POLL_TIMEOUT) {
                Ok(more) => more,
                Err(err) => {
                    self.emit_error(err);
                    false
                }
            };

        if more {
            self.pending = Some(PendingRename {
                source: path,
                source_wd,
                cookie: event.cookie,
            });
        } else {
            self.emit_deleted(&path);
            if let Some(wd) = source_wd {
                tree.lock().remove_watch(session, wd, true);
            }
        }
    }

    fn handle_moved_to(
        &mut self,
        session: &mut Session,
        tree: &Mutex<WatchTree>,
        event: &RawEvent,
        path: &Path,
    ) {
        match self.pending.take() {
            // The flush above guarantees any surviving pending matches
            Some(pending) => {
                self.emit_renamed(path, &pending.source);
                if let Some(source_wd) = pending.source_wd {
                    if let Some(name) = &event.name {
                        // Re-home the node: child watches and their
                        // descriptors survive the rename
                        tree.lock().rehome(source_wd, event.wd, name);
                    }
                }
            }
            // A move in from outside the tree looks like a creation
            None => self.handle_created(session, tree, event, path),
        }
    }

    fn emit_created(&self, path: &Path) {
        if self.pattern.matches_path(path) {
            (self.sink.on_created)(path.to_path_buf());
        }
    }

    fn emit_deleted(&self, path: &Path) {
        if self.pattern.matches_path(path) {
            (self.sink.on_deleted)(path.to_path_buf());
        }
    }

    fn emit_changed(&self, path: &Path) {
        if self.pattern.matches_path(path) {
            (self.sink.on_changed)(path.to_path_buf());
        }
    }

    fn emit_renamed(&self, new_path: &Path, old_path: &Path) {
        if self.pattern.matches_path(new_path) || self.pattern.matches_path(old_path) {
            (self.sink.on_renamed)(new_path.to_path_buf(), old_path.to_path_buf());
        }
    }
}
