//! Notify filters and name-pattern matching
//!
//! Two layers of filtering are applied before an event crosses into the
//! facade:
//! 1. [`NotifyFilters`] selects which change kinds the caller wants; it also
//!    determines the kernel mask requested at watch registration.
//! 2. [`NamePattern`] is a `*`/`?` glob over the final path component.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::inotify::EventMask;

bitflags! {
    /// Which notifications the caller wants
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyFilters: u32 {
        /// Changes to files
        const FILE_NAME = 1 << 0;
        /// Changes to directories
        const DIR_NAME = 1 << 1;
        /// Content writes
        const LAST_WRITE = 1 << 2;
        /// Metadata changes (permissions, ownership, timestamps)
        const ATTRIBUTES = 1 << 3;
        /// Read accesses
        const ACCESS = 1 << 4;
    }
}

impl Default for NotifyFilters {
    fn default() -> Self {
        Self::FILE_NAME | Self::DIR_NAME | Self::LAST_WRITE
    }
}

impl NotifyFilters {
    /// Kernel mask to request at watch registration
    ///
    /// The structural bits (create/delete/move) are always requested: the
    /// mirrored tree depends on them regardless of what the caller asked to
    /// be notified about.
    pub fn event_mask(&self) -> EventMask {
        let mut mask = EventMask::IN_CREATE
            | EventMask::IN_DELETE
            | EventMask::IN_MOVED_FROM
            | EventMask::IN_MOVED_TO
            | EventMask::IN_DELETE_SELF
            | EventMask::IN_MOVE_SELF
            | EventMask::IN_EXCL_UNLINK;
        if self.contains(Self::LAST_WRITE) {
            mask |= EventMask::IN_MODIFY | EventMask::IN_CLOSE_WRITE;
        }
        if self.contains(Self::ATTRIBUTES) {
            mask |= EventMask::IN_ATTRIB;
        }
        if self.contains(Self::ACCESS) {
            mask |= EventMask::IN_ACCESS;
        }
        mask
    }

    /// Whether a Changed notification for this entry kind should be emitted
    pub fn wants_change_for(&self, is_dir: bool) -> bool {
        if is_dir {
            self.contains(Self::DIR_NAME)
        } else {
            self.contains(Self::FILE_NAME)
        }
    }
}

/// Filter configuration as it appears in config files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Notify about file changes (default: true)
    #[serde(default = "default_true")]
    pub file_names: bool,

    /// Notify about directory changes (default: true)
    #[serde(default = "default_true")]
    pub dir_names: bool,

    /// Notify about content writes (default: true)
    #[serde(default = "default_true")]
    pub last_write: bool,

    /// Notify about metadata changes (default: false)
    #[serde(default)]
    pub attributes: bool,

    /// Notify about read accesses (default: false)
    #[serde(default)]
    pub access: bool,

    /// Glob over the final path component (default: "*")
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            file_names: true,
            dir_names: true,
            last_write: true,
            attributes: false,
            access: false,
            pattern: default_pattern(),
        }
    }
}

impl FilterConfig {
    /// Collapse the boolean switches into a filter mask
    pub fn filters(&self) -> NotifyFilters {
        let mut filters = NotifyFilters::empty();
        if self.file_names {
            filters |= NotifyFilters::FILE_NAME;
        }
        if self.dir_names {
            filters |= NotifyFilters::DIR_NAME;
        }
        if self.last_write {
            filters |= NotifyFilters::LAST_WRITE;
        }
        if self.attributes {
            filters |= NotifyFilters::ATTRIBUTES;
        }
        if self.access {
            filters |= NotifyFilters::ACCESS;
        }
        filters
    }
}

fn default_true() -> bool {
    true
}

fn default_pattern() -> String {
    "*".to_string()
}

/// Glob pattern applied to the final component of event paths
///
/// Supports `*` (any run of characters) and `?` (any single character).
/// `"*"` and the empty pattern match everything.
#[derive(Debug, Clone)]
pub struct NamePattern {
    pattern: String,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
        }
    }

    /// Pattern matching every name
    pub fn match_all() -> Self {
        Self::new("*")
    }

    /// Match the final component of `path`
    pub fn matches_path(&self, path: &Path) -> bool {
        match path.file_name() {
            Some(name) => self.matches(name),
            None => true,
        }
    }

    /// Match a single name
    pub fn matches(&self, name: &OsStr) -> bool {
        if self.pattern.is_empty() || self.pattern == "*" {
            return true;
        }
        glob_match(self.pattern.as_bytes(), name.as_bytes())
    }
}

impl Default for NamePattern {
    fn default() -> Self {
        Self::match_all()
    }
}

/// Iterative glob match with single-star backtracking
fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            // Let the last star absorb one more character
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
