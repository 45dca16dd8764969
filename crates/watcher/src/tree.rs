//! Watch tree: the live mirror of the watched directory subtree
//!
//! Every watched directory is one node, keyed by its kernel watch descriptor
//! in an arena map. Parent and child links are descriptor keys, never
//! pointers, so removing a subtree is a plain key sweep. No node stores a
//! full path: paths are always reconstructed by walking parent links, which
//! keeps them correct when ancestors are renamed in place.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::WatchError;
use crate::inotify::{EventMask, Session};

/// A single watched directory
#[derive(Debug)]
pub struct WatchNode {
    /// Kernel watch descriptor
    pub wd: i32,
    /// Name relative to the parent (empty for the root)
    pub name: OsString,
    /// Descriptor of the owning node; None for the root
    pub parent: Option<i32>,
    /// Descriptors of watched child directories
    pub children: Vec<i32>,
}

/// Outcome of a single registration attempt
enum Registered {
    /// A new node was inserted
    New(i32),
    /// The directory was already watched under this descriptor
    Existing(i32),
    /// Symlink, non-directory, or vanished entry: skipped without error
    Skipped,
}

/// Arena of watch nodes plus the descriptor index
///
/// The index and the parent/child graph are mutated together; callers share
/// the tree behind a single mutex so both stay consistent.
pub struct WatchTree {
    root_path: PathBuf,
    root_wd: i32,
    nodes: AHashMap<i32, WatchNode>,
    mask: EventMask,
    recursive: bool,
}

impl WatchTree {
    /// Register the root directory and build an otherwise empty tree
    ///
    /// Root registration failure is fatal; use [`register_subtree`] to grow
    /// the tree afterwards so watch-limit errors can degrade instead.
    ///
    /// [`register_subtree`]: WatchTree::register_subtree
    pub fn init(
        session: &Session,
        root: &Path,
        mask: EventMask,
        recursive: bool,
    ) -> Result<Self, WatchError> {
        let root_wd = session.add_watch(root, mask)?;
        let mut nodes = AHashMap::new();
        nodes.insert(
            root_wd,
            WatchNode {
                wd: root_wd,
                name: OsString::new(),
                parent: None,
                children: Vec::new(),
            },
        );
        debug!("watching root {} (wd {})", root.display(), root_wd);
        Ok(Self {
            root_path: root.to_path_buf(),
            root_wd,
            nodes,
            mask,
            recursive,
        })
    }

    /// Descriptor of the root node
    pub fn root_wd(&self) -> i32 {
        self.root_wd
    }

    /// Whether a descriptor is present in the index
    pub fn contains(&self, wd: i32) -> bool {
        self.nodes.contains_key(&wd)
    }

    /// Look up a node by descriptor
    pub fn node(&self, wd: i32) -> Option<&WatchNode> {
        self.nodes.get(&wd)
    }

    /// Number of watched directories
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing is watched (only after teardown)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All descriptors currently in the index
    pub fn descriptors(&self) -> Vec<i32> {
        self.nodes.keys().copied().collect()
    }

    /// Register a watch for `parent/name`
    ///
    /// Symlinks are skipped to avoid watch loops, as are entries that
    /// disappear between enumeration and registration; both return
    /// `Ok(None)`. When recursive watching is enabled the new directory's
    /// existing subdirectories are registered as well, skipping any
    /// directory already present in the index.
    pub fn add_watch(
        &mut self,
        session: &Session,
        parent_wd: i32,
        name: &OsStr,
    ) -> Result<Option<i32>, WatchError> {
        match self.register_one(session, parent_wd, name)? {
            Registered::New(wd) => {
                if self.recursive {
                    self.register_children(session, wd)?;
                }
                Ok(Some(wd))
            }
            Registered::Existing(wd) => Ok(Some(wd)),
            Registered::Skipped => Ok(None),
        }
    }

    /// Register all existing subdirectories beneath `wd`
    ///
    /// Used for the initial recursive registration of the root and for
    /// overflow rebuilds. Idempotent: directories already in the index are
    /// not re-entered.
    pub fn register_subtree(&mut self, session: &Session) -> Result<(), WatchError> {
        self.register_children(session, self.root_wd)
    }

    fn register_children(&mut self, session: &Session, wd: i32) -> Result<(), WatchError> {
        let Some(dir) = self.resolve_path(wd, None) else {
            return Ok(());
        };

        // Depth-first walk guarantees a parent is mapped before its children
        let mut by_path: AHashMap<PathBuf, i32> = AHashMap::new();
        by_path.insert(dir.clone(), wd);

        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(parent_wd) = entry.path().parent().and_then(|p| by_path.get(p)).copied()
            else {
                continue;
            };
            match self.register_one(session, parent_wd, entry.file_name())? {
                Registered::New(child_wd) | Registered::Existing(child_wd) => {
                    by_path.insert(entry.path().to_path_buf(), child_wd);
                }
                Registered::Skipped => {}
            }
        }
        Ok(())
    }

    /// Register exactly one directory under `parent_wd`, without descending
    fn register_one(
        &mut self,
        session: &Session,
        parent_wd: i32,
        name: &OsStr,
    ) -> Result<Registered, WatchError> {
        let Some(path) = self.resolve_path(parent_wd, Some(name)) else {
            // Parent removed concurrently
            return Ok(Registered::Skipped);
        };

        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            // Vanished between enumeration and registration
            Err(_) => return Ok(Registered::Skipped),
        };
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Ok(Registered::Skipped);
        }

        let wd = match session.add_watch(&path, self.mask) {
            Ok(wd) => wd,
            Err(WatchError::NotFound(_)) => return Ok(Registered::Skipped),
            Err(err) => return Err(err),
        };

        if self.nodes.contains_key(&wd) {
            trace!("directory already watched: {} (wd {})", path.display(), wd);
            return Ok(Registered::Existing(wd));
        }

        self.nodes.insert(
            wd,
            WatchNode {
                wd,
                name: name.to_os_string(),
                parent: Some(parent_wd),
                children: Vec::new(),
            },
        );
        if let Some(parent) = self.nodes.get_mut(&parent_wd) {
            parent.children.push(wd);
        }
        trace!("added watch {} on {}", wd, path.display());
        Ok(Registered::New(wd))
    }

    /// Remove a node and its entire subtree from the index
    ///
    /// `also_from_kernel` is false when the kernel has already invalidated
    /// the descriptor (IN_IGNORED); otherwise each removed descriptor is
    /// explicitly deregistered.
    pub fn remove_watch(&mut self, session: &Session, wd: i32, also_from_kernel: bool) {
        let Some(node) = self.nodes.get(&wd) else {
            return;
        };
        if let Some(parent_wd) = node.parent {
            if let Some(parent) = self.nodes.get_mut(&parent_wd) {
                parent.children.retain(|child| *child != wd);
            }
        }

        let mut stack = vec![wd];
        while let Some(current) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&current) {
                stack.extend(removed.children);
                if also_from_kernel {
                    if let Err(err) = session.remove_watch(current) {
                        trace!("deregistering wd {} failed: {}", current, err);
                    }
                }
            }
        }
    }

    /// Reconstruct the full path of a node, optionally with one extra leaf
    ///
    /// This is the only way paths are derived from the tree.
    pub fn resolve_path(&self, wd: i32, extra_leaf: Option<&OsStr>) -> Option<PathBuf> {
        let mut names: Vec<&OsString> = Vec::new();
        let mut current = self.nodes.get(&wd)?;
        while let Some(parent_wd) = current.parent {
            names.push(&current.name);
            current = self.nodes.get(&parent_wd)?;
        }

        let mut path = self.root_path.clone();
        for name in names.iter().rev() {
            path.push(name);
        }
        if let Some(leaf) = extra_leaf {
            path.push(leaf);
        }
        Some(path)
    }

    /// Find a watched child of `parent_wd` by name
    pub fn child_by_name(&self, parent_wd: i32, name: &OsStr) -> Option<i32> {
        let parent = self.nodes.get(&parent_wd)?;
        parent
            .children
            .iter()
            .copied()
            .find(|child| self.nodes.get(child).map(|n| n.name.as_os_str()) == Some(name))
    }

    /// Move a node (and implicitly its subtree) under a new parent and name
    ///
    /// Used when a watched directory is renamed within the tree: the
    /// descriptor and all child watches survive the rename.
    pub fn rehome(&mut self, wd: i32, new_parent_wd: i32, new_name: &OsStr) {
        if wd == self.root_wd || !self.nodes.contains_key(&new_parent_wd) {
            return;
        }
        let Some(node) = self.nodes.get_mut(&wd) else {
            return;
        };
        let old_parent = node.parent;
        node.name = new_name.to_os_string();
        node.parent = Some(new_parent_wd);

        if let Some(parent_wd) = old_parent {
            if let Some(parent) = self.nodes.get_mut(&parent_wd) {
                parent.children.retain(|child| *child != wd);
            }
        }
        if let Some(parent) = self.nodes.get_mut(&new_parent_wd) {
            parent.children.push(wd);
        }
    }

    /// Tear down everything below the root and re-register from a fresh scan
    ///
    /// Called after a kernel queue overflow: an unknown number of events was
    /// lost, so the mirrored tree can no longer be trusted.
    pub fn rebuild(&mut self, session: &Session) -> Result<(), WatchError> {
        let stale: Vec<i32> = self
            .nodes
            .keys()
            .copied()
            .filter(|wd| *wd != self.root_wd)
            .collect();
        for wd in stale {
            self.nodes.remove(&wd);
            if let Err(err) = session.remove_watch(wd) {
                trace!("deregistering wd {} failed: {}", wd, err);
            }
        }
        if let Some(root) = self.nodes.get_mut(&self.root_wd) {
            root.children.clear();
        }

        if self.recursive {
            warn!("rebuilding watch tree under {}", self.root_path.display());
            self.register_subtree(session)?;
        }
        Ok(())
    }

    /// Deregister every watch; used on shutdown
    pub fn teardown(&mut self, session: &Session) {
        for wd in self.descriptors() {
            if let Err(err) = session.remove_watch(wd) {
                trace!("deregistering wd {} failed: {}", wd, err);
            }
        }
        self.nodes.clear();
    }

    /// Full paths of all watched directories, sorted
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .nodes
            .keys()
            .filter_map(|wd| self.resolve_path(*wd, None))
            .collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inotify::DEFAULT_BUFFER_CAPACITY;
    use std::collections::HashSet;
    use tempfile::TempDir;

    const MASK: EventMask = EventMask::IN_CREATE
        .union(EventMask::IN_DELETE)
        .union(EventMask::IN_MOVED_FROM)
        .union(EventMask::IN_MOVED_TO);

    fn make_dirs(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
    }

    fn recursive_tree(root: &Path) -> (Session, WatchTree) {
        let session = Session::open(DEFAULT_BUFFER_CAPACITY).unwrap();
        let mut tree = WatchTree::init(&session, root, MASK, true).unwrap();
        tree.register_subtree(&session).unwrap();
        (session, tree)
    }

    /// Every descriptor is reachable from the root and vice versa
    fn assert_consistent(tree: &WatchTree) {
        let mut reachable = HashSet::new();
        let mut stack = vec![tree.root_wd()];
        while let Some(wd) = stack.pop() {
            let node = tree.node(wd).expect("reachable node missing from index");
            assert!(reachable.insert(wd), "node reachable via two parents");
            stack.extend(&node.children);
        }
        let indexed: HashSet<i32> = tree.descriptors().into_iter().collect();
        assert_eq!(reachable, indexed);
    }

    #[test]
    fn test_recursive_registration_covers_subtree() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b/c", "a/d", "e"]);

        let (_session, tree) = recursive_tree(temp.path());

        let mut expected = vec![temp.path().to_path_buf()];
        expected.extend(
            ["a", "a/b", "a/b/c", "a/d", "e"]
                .iter()
                .map(|p| temp.path().join(p)),
        );
        assert_eq!(tree.watched_paths(), expected);
        assert_consistent(&tree);
    }

    #[test]
    fn test_registration_skips_symlinks() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["real"]);
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link")).unwrap();

        let (_session, tree) = recursive_tree(temp.path());

        assert_eq!(
            tree.watched_paths(),
            vec![temp.path().to_path_buf(), temp.path().join("real")]
        );
    }

    #[test]
    fn test_repeated_registration_is_idempotent() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b", "c"]);

        let (session, mut tree) = recursive_tree(temp.path());
        let count = tree.len();

        tree.register_subtree(&session).unwrap();
        assert_eq!(tree.len(), count);

        // Re-adding an already watched directory descends without duplicating
        tree.add_watch(&session, tree.root_wd(), OsStr::new("a"))
            .unwrap();
        assert_eq!(tree.len(), count);
        assert_consistent(&tree);
    }

    #[test]
    fn test_remove_watch_drops_whole_subtree() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b/c", "a/d", "keep"]);

        let (session, mut tree) = recursive_tree(temp.path());
        let a = tree.child_by_name(tree.root_wd(), OsStr::new("a")).unwrap();

        tree.remove_watch(&session, a, true);

        assert_eq!(
            tree.watched_paths(),
            vec![temp.path().to_path_buf(), temp.path().join("keep")]
        );
        assert_consistent(&tree);
    }

    #[test]
    fn test_resolve_path_follows_parent_links() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b/c"]);

        let (_session, tree) = recursive_tree(temp.path());
        let a = tree.child_by_name(tree.root_wd(), OsStr::new("a")).unwrap();
        let b = tree.child_by_name(a, OsStr::new("b")).unwrap();
        let c = tree.child_by_name(b, OsStr::new("c")).unwrap();

        assert_eq!(
            tree.resolve_path(c, Some(OsStr::new("f.txt"))).unwrap(),
            temp.path().join("a/b/c/f.txt")
        );
    }

    #[test]
    fn test_resolve_path_after_ancestor_rename() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b/c"]);

        let (_session, mut tree) = recursive_tree(temp.path());
        let a = tree.child_by_name(tree.root_wd(), OsStr::new("a")).unwrap();
        let b = tree.child_by_name(a, OsStr::new("b")).unwrap();
        let c = tree.child_by_name(b, OsStr::new("c")).unwrap();

        // Rename "a" to "z" in place: descendants resolve under the new name
        tree.rehome(a, tree.root_wd(), OsStr::new("z"));

        assert_eq!(tree.resolve_path(c, None).unwrap(), temp.path().join("z/b/c"));
        assert_consistent(&tree);
    }

    #[test]
    fn test_rehome_across_parents() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/sub", "dest"]);

        let (_session, mut tree) = recursive_tree(temp.path());
        let a = tree.child_by_name(tree.root_wd(), OsStr::new("a")).unwrap();
        let sub = tree.child_by_name(a, OsStr::new("sub")).unwrap();
        let dest = tree
            .child_by_name(tree.root_wd(), OsStr::new("dest"))
            .unwrap();

        tree.rehome(sub, dest, OsStr::new("moved"));

        assert_eq!(
            tree.resolve_path(sub, None).unwrap(),
            temp.path().join("dest/moved")
        );
        assert!(tree.child_by_name(a, OsStr::new("sub")).is_none());
        assert_consistent(&tree);
    }

    #[test]
    fn test_rebuild_matches_fresh_scan() {
        let temp = TempDir::new().unwrap();
        make_dirs(temp.path(), &["a/b", "c"]);

        let (session, mut tree) = recursive_tree(temp.path());

        // Directory layout changes while events are lost to an overflow
        fs::remove_dir_all(temp.path().join("a")).unwrap();
        make_dirs(temp.path(), &["x/y"]);

        tree.rebuild(&session).unwrap();

        let mut fresh: Vec<PathBuf> = WalkDir::new(temp.path())
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.path().to_path_buf())
            .collect();
        fresh.sort();

        assert_eq!(tree.watched_paths(), fresh);
        assert_consistent(&tree);
    }

    #[test]
    fn test_add_watch_vanished_entry_is_skipped() {
        let temp = TempDir::new().unwrap();
        let (session, mut tree) = recursive_tree(temp.path());

        let added = tree
            .add_watch(&session, tree.root_wd(), OsStr::new("ghost"))
            .unwrap();
        assert!(added.is_none());
        assert_eq!(tree.len(), 1);
    }
}
