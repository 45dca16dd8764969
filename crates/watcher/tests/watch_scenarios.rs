//! End-to-end scenarios against the real kernel
//!
//! These drive a full `Watcher` with filesystem operations and assert on the
//! semantic event stream, including the cases where correctness depends on
//! the watch tree keeping up with structural changes.

use std::fs;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use watcher::{watch, FilterConfig, WatchEvent, Watcher, WatcherConfig};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive events until `want` returns true for one of them, returning
/// everything seen up to and including the match
fn collect_until(
    watcher: &Watcher,
    want: impl Fn(&WatchEvent) -> bool,
) -> Vec<WatchEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_default();
        match watcher.events().recv_timeout(remaining) {
            Ok(event) => {
                let done = want(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(err) => panic!("timed out waiting for event; saw {:?}: {}", seen, err),
        }
    }
}

#[test]
fn test_events_inside_new_directory_are_observed() {
    let temp = TempDir::new().unwrap();
    let watcher = watch(temp.path()).unwrap();

    let dir = temp.path().join("logs");
    fs::create_dir(&dir).unwrap();

    // Wait for the directory creation so the new watch is installed before
    // the file appears inside it
    let expected_dir = WatchEvent::Created(dir.clone());
    let seen = collect_until(&watcher, |e| *e == expected_dir);
    assert_eq!(seen.last(), Some(&expected_dir));

    let file = dir.join("today.log");
    fs::write(&file, b"entry").unwrap();

    let expected_file = WatchEvent::Created(file.clone());
    collect_until(&watcher, |e| *e == expected_file);

    watcher.stop();
}

#[test]
fn test_renamed_directory_keeps_watching_contents() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("a")).unwrap();
    let watcher = watch(temp.path()).unwrap();

    fs::rename(temp.path().join("a"), temp.path().join("b")).unwrap();

    let expected_rename = WatchEvent::Renamed {
        from: temp.path().join("a"),
        to: temp.path().join("b"),
    };
    let seen = collect_until(&watcher, |e| *e == expected_rename);
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, WatchEvent::Created(_) | WatchEvent::Deleted(_))),
        "rename leaked a create or delete: {:?}",
        seen
    );

    // The original descriptor survived the rename, so activity inside the
    // renamed directory still resolves to the new path
    let file = temp.path().join("b/file.txt");
    fs::write(&file, b"x").unwrap();

    let expected_create = WatchEvent::Created(file.clone());
    collect_until(&watcher, |e| *e == expected_create);

    watcher.stop();
}

#[test]
fn test_directory_moved_in_is_watched() {
    let outside = TempDir::new().unwrap();
    let watched = TempDir::new().unwrap();
    fs::create_dir(outside.path().join("incoming")).unwrap();
    let watcher = watch(watched.path()).unwrap();

    let dest = watched.path().join("incoming");
    fs::rename(outside.path().join("incoming"), &dest).unwrap();

    let expected_dir = WatchEvent::Created(dest.clone());
    collect_until(&watcher, |e| *e == expected_dir);

    let file = dest.join("payload.txt");
    fs::write(&file, b"x").unwrap();

    let expected_file = WatchEvent::Created(file.clone());
    collect_until(&watcher, |e| *e == expected_file);

    watcher.stop();
}

#[test]
fn test_delete_reported_with_full_path() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("sub/victim.txt"), b"x").unwrap();
    let watcher = watch(temp.path()).unwrap();

    fs::remove_file(temp.path().join("sub/victim.txt")).unwrap();

    let expected = WatchEvent::Deleted(temp.path().join("sub/victim.txt"));
    collect_until(&watcher, |e| *e == expected);

    watcher.stop();
}

#[test]
fn test_nonrecursive_ignores_subdirectory_activity() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();

    let mut config = WatcherConfig::new(temp.path());
    config.recursive = false;
    let watcher = Watcher::start(config).unwrap();
    assert_eq!(watcher.watched_paths(), vec![temp.path().to_path_buf()]);

    fs::write(temp.path().join("sub/hidden.txt"), b"x").unwrap();
    fs::write(temp.path().join("visible.txt"), b"x").unwrap();

    let expected = WatchEvent::Created(temp.path().join("visible.txt"));
    let seen = collect_until(&watcher, |e| *e == expected);
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, WatchEvent::Created(p) if p.ends_with("hidden.txt"))),
        "subdirectory event leaked: {:?}",
        seen
    );

    watcher.stop();
}

#[test]
fn test_pattern_filters_event_stream() {
    let temp = TempDir::new().unwrap();
    let config = WatcherConfig {
        filter: FilterConfig {
            pattern: "*.txt".to_string(),
            ..FilterConfig::default()
        },
        ..WatcherConfig::new(temp.path())
    };
    let watcher = Watcher::start(config).unwrap();

    fs::write(temp.path().join("skipped.log"), b"x").unwrap();
    fs::write(temp.path().join("kept.txt"), b"x").unwrap();

    let expected = WatchEvent::Created(temp.path().join("kept.txt"));
    let seen = collect_until(&watcher, |e| *e == expected);
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, WatchEvent::Created(p) if p.ends_with("skipped.log"))),
        "filtered name leaked: {:?}",
        seen
    );

    watcher.stop();
}

#[test]
fn test_root_removal_ends_session() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("doomed");
    fs::create_dir(&root).unwrap();
    let watcher = watch(&root).unwrap();

    fs::remove_dir(&root).unwrap();

    let seen = collect_until(&watcher, |e| {
        matches!(e, WatchEvent::Error(msg) if msg.contains("no longer available"))
    });
    assert!(!seen.is_empty());

    // The loop exits on its own and the channel closes behind it
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match watcher.events().recv_timeout(Duration::from_millis(100)) {
            Ok(_) => {
                assert!(Instant::now() < deadline, "channel never closed");
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                assert!(Instant::now() < deadline, "channel never closed");
            }
        }
    }
}

#[test]
fn test_initial_subtree_is_fully_registered() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
    fs::create_dir(temp.path().join("d")).unwrap();

    let watcher = watch(temp.path()).unwrap();

    assert_eq!(
        watcher.watched_paths(),
        vec![
            temp.path().to_path_buf(),
            temp.path().join("a"),
            temp.path().join("a/b"),
            temp.path().join("a/b/c"),
            temp.path().join("d"),
        ]
    );

    watcher.stop();
}
