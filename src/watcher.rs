//! File system watching and event handling

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::trigger::Trigger;

/// Operation kind carried by a filesystem notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    Create,
    Write,
    Rename,
    Remove,
    Chmod,
}

/// Flatten a notify event into per-path operations.
///
/// An entry moved into the watched directory counts as a creation: that is
/// how an orchestrator swaps a new `..data` link in. A rename pair is dropped
/// because its halves also arrive as separate `From` and `To` events.
pub fn event_ops(event: notify::Event) -> Vec<(PathBuf, FsOp)> {
    let op = match event.kind {
        EventKind::Create(_) => FsOp::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsOp::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => FsOp::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => FsOp::Chmod,
        EventKind::Modify(_) => FsOp::Write,
        EventKind::Remove(_) => FsOp::Remove,
        // access and unclassified events
        _ => return Vec::new(),
    };
    event.paths.into_iter().map(|p| (p, op)).collect()
}

/// Watch `source` (not recursively) and feed every event to `trigger` until
/// a shutdown signal arrives or the watcher goes away.
pub fn watch_and_copy(trigger: &Trigger, source: &Path, running: Arc<AtomicBool>) -> Result<()> {
    let (tx, rx) = channel::<notify::Result<notify::Event>>();

    let mut watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;

    watcher
        .watch(source, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", source.display()))?;

    info!(path = %source.display(), "watching for changes");

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(event)) => {
                for (path, op) in event_ops(event) {
                    trigger.handle(&path, op);
                }
            }
            Ok(Err(err)) => {
                error!(error = %err, "watch error");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("watch channel disconnected");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use notify::Event;

    fn ops(kind: EventKind, paths: &[&str]) -> Vec<(PathBuf, FsOp)> {
        let event = paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)));
        event_ops(event)
    }

    #[test]
    fn test_create_and_remove() {
        assert_eq!(
            ops(EventKind::Create(CreateKind::File), &["/src/a"]),
            vec![(PathBuf::from("/src/a"), FsOp::Create)]
        );
        assert_eq!(
            ops(EventKind::Remove(RemoveKind::Any), &["/src/a"]),
            vec![(PathBuf::from("/src/a"), FsOp::Remove)]
        );
    }

    #[test]
    fn test_moved_in_counts_as_create() {
        assert_eq!(
            ops(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/src/..data"]
            ),
            vec![(PathBuf::from("/src/..data"), FsOp::Create)]
        );
    }

    #[test]
    fn test_rename_pair_is_dropped() {
        assert!(ops(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/src/..data_tmp", "/src/..data"]
        )
        .is_empty());
    }

    #[test]
    fn test_marker_swap_creates_marker_once() {
        // the sequence inotify reports for rename(..data_tmp, ..data)
        let events = [
            (EventKind::Create(CreateKind::File), vec!["/src/..data_tmp"]),
            (EventKind::Modify(ModifyKind::Name(RenameMode::From)), vec!["/src/..data_tmp"]),
            (EventKind::Modify(ModifyKind::Name(RenameMode::To)), vec!["/src/..data"]),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                vec!["/src/..data_tmp", "/src/..data"],
            ),
        ];
        let creates = events
            .into_iter()
            .flat_map(|(kind, paths)| ops(kind, &paths))
            .filter(|(path, op)| path == Path::new("/src/..data") && *op == FsOp::Create)
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_moved_out_is_rename() {
        assert_eq!(
            ops(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/src/..data"]
            ),
            vec![(PathBuf::from("/src/..data"), FsOp::Rename)]
        );
    }

    #[test]
    fn test_modify_kinds() {
        assert_eq!(
            ops(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/src/a"]
            ),
            vec![(PathBuf::from("/src/a"), FsOp::Write)]
        );
        assert_eq!(
            ops(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                &["/src/a"]
            ),
            vec![(PathBuf::from("/src/a"), FsOp::Chmod)]
        );
    }

    #[test]
    fn test_access_is_dropped() {
        assert!(ops(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/src/a"]
        )
        .is_empty());
    }
}
