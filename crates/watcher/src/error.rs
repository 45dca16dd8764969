//! Error taxonomy for the watch engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the watch engine
///
/// Fatal-to-session errors (`InstanceLimitExceeded`, `SessionCreateFailed`,
/// `Read`, `RootGone`) stop the watcher and require a caller-initiated
/// restart. `WatchLimitExceeded` and `WatchFailed` during subtree growth are
/// best-effort: they are reported and the triggering subtree is simply left
/// unwatched.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Process- or user-wide cap on live inotify instances reached (EMFILE/ENFILE)
    #[error("inotify instance limit reached; raise fs.inotify.max_user_instances")]
    InstanceLimitExceeded,

    /// inotify session could not be created for a reason other than the instance cap
    #[error("failed to create inotify session: {0}")]
    SessionCreateFailed(#[source] std::io::Error),

    /// Cap on watch descriptors reached while growing the tree (ENOSPC)
    #[error("inotify watch limit reached; raise fs.inotify.max_user_watches")]
    WatchLimitExceeded,

    /// Watch target disappeared before it could be registered
    #[error("watch target not found: {0}")]
    NotFound(PathBuf),

    /// Watch registration failed for a reason other than the limits above
    #[error("failed to register watch on {path}: {source}")]
    WatchFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Deregistration of a live watch descriptor failed; callers log and
    /// continue since the kernel reclaims descriptors with the session
    #[error("failed to deregister watch {wd}: {source}")]
    RemoveFailed { wd: i32, source: std::io::Error },

    /// Unrecoverable error reading the kernel event stream
    #[error("event stream read failed: {0}")]
    Read(#[source] std::io::Error),

    /// The watched root itself was deleted or moved away
    #[error("watched root no longer available: {0}")]
    RootGone(PathBuf),
}
