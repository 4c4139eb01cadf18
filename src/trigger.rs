//! Decides which copy tasks a filesystem event should produce

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Span};

use crate::config::{Config, WatchFilter};
use crate::queue::DelayingQueue;
use crate::task::CopyTask;
use crate::watcher::FsOp;

/// Entry recreated by the orchestrator every time a configmap volume changes
pub const CONFIGMAP_MARKER: &str = "..data";

/// Delay applied to direct-mode events so write/rename/chmod bursts collapse
pub const DEBOUNCE: Duration = Duration::from_secs(1);

pub struct Trigger {
    source: PathBuf,
    destination: PathBuf,
    files: Vec<String>,
    filter: WatchFilter,
    is_configmap: bool,
    debounce: Duration,
    queue: Arc<DelayingQueue<CopyTask>>,
    span: Span,
}

impl Trigger {
    pub fn new(config: &Config, queue: Arc<DelayingQueue<CopyTask>>, span: Span) -> Self {
        Self {
            source: config.source.clone(),
            destination: config.destination.clone(),
            files: config.files.clone(),
            filter: config.watch_filter(),
            is_configmap: config.is_configmap,
            debounce: DEBOUNCE,
            queue,
            span,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Classify one event and enqueue whatever it calls for.
    pub fn handle(&self, path: &Path, op: FsOp) {
        let _enter = self.span.enter();

        if op == FsOp::Remove {
            info!(path = %path.display(), "remove event triggered, skipped");
            return;
        }
        info!(path = %path.display(), op = ?op, "event triggered");

        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            debug!(path = %path.display(), "event without a file name, skipped");
            return;
        };

        if self.is_configmap {
            self.handle_configmap(&filename, op);
        } else {
            self.handle_direct(filename);
        }
    }

    fn handle_direct(&self, filename: String) {
        if !self.filter.matches(&filename) {
            debug!(filename = %filename, "not in watched files, skipped");
            return;
        }
        self.queue.add_after(self.task(filename), self.debounce);
    }

    fn handle_configmap(&self, filename: &str, op: FsOp) {
        if !is_configmap_update(filename, op) {
            return;
        }

        info!("configmap update detected");
        if self.filter.all_files() {
            self.queue.add(self.task(String::new()));
            return;
        }
        for file in &self.files {
            self.queue.add(self.task(file.clone()));
        }
    }

    fn task(&self, filename: String) -> CopyTask {
        CopyTask::new(self.source.clone(), self.destination.clone(), filename)
    }
}

/// The orchestrator swaps a configmap in by recreating the marker, so only
/// its creation means new content is in place.
pub fn is_configmap_update(filename: &str, op: FsOp) -> bool {
    filename == CONFIGMAP_MARKER && op == FsOp::Create
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(files: &[&str], is_configmap: bool) -> Config {
        Config {
            source: PathBuf::from("/src"),
            destination: PathBuf::from("/dst"),
            files: files.iter().map(|f| f.to_string()).collect(),
            is_configmap,
            copy_hidden: false,
            log_dir: None,
            verbose: false,
        }
    }

    fn trigger(files: &[&str], is_configmap: bool) -> (Trigger, Arc<DelayingQueue<CopyTask>>) {
        let queue = Arc::new(DelayingQueue::new());
        let trigger = Trigger::new(&config(files, is_configmap), Arc::clone(&queue), Span::none())
            .with_debounce(Duration::from_millis(100));
        (trigger, queue)
    }

    fn drain(queue: &DelayingQueue<CopyTask>) -> Vec<String> {
        let mut names = Vec::new();
        while !queue.is_empty() {
            if let Some(task) = queue.get() {
                queue.done(&task);
                names.push(task.filename);
            }
        }
        names
    }

    #[test]
    fn test_remove_is_ignored() {
        let (trigger, queue) = trigger(&[], false);
        trigger.handle(Path::new("/src/a.yaml"), FsOp::Remove);
        assert_eq!(queue.waiting_len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_direct_mode_is_debounced() {
        let (trigger, queue) = trigger(&[], false);
        trigger.handle(Path::new("/src/a.yaml"), FsOp::Write);

        assert!(queue.is_empty());
        assert_eq!(queue.waiting_len(), 1);

        let task = queue.get().unwrap();
        assert_eq!(task, CopyTask::new("/src".into(), "/dst".into(), "a.yaml"));
    }

    #[test]
    fn test_direct_mode_filter() {
        let (trigger, queue) = trigger(&["a.yaml", "b.yaml"], false);
        trigger.handle(Path::new("/src/c.yaml"), FsOp::Create);
        assert_eq!(queue.waiting_len(), 0);

        trigger.handle(Path::new("/src/a.yaml"), FsOp::Create);
        assert_eq!(queue.waiting_len(), 1);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(drain(&queue), vec!["a.yaml"]);
    }

    #[test]
    fn test_direct_mode_burst_collapses() {
        let (trigger, queue) = trigger(&[], false);
        for op in [FsOp::Create, FsOp::Write, FsOp::Rename, FsOp::Chmod, FsOp::Write] {
            trigger.handle(Path::new("/src/a.yaml"), op);
        }
        assert_eq!(queue.waiting_len(), 1);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(drain(&queue), vec!["a.yaml"]);
    }

    #[test]
    fn test_configmap_marker_rename_is_ignored() {
        let (trigger, queue) = trigger(&["a.yaml"], true);
        trigger.handle(Path::new("/src/..data"), FsOp::Rename);
        trigger.handle(Path::new("/src/..data"), FsOp::Write);
        trigger.handle(Path::new("/src/a.yaml"), FsOp::Create);
        assert!(queue.is_empty());
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn test_configmap_marker_create_queues_configured_files() {
        let (trigger, queue) = trigger(&["a.yaml", "b.yaml"], true);
        trigger.handle(Path::new("/src/..data"), FsOp::Create);

        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(drain(&queue), vec!["a.yaml", "b.yaml"]);
    }

    #[test]
    fn test_configmap_marker_create_without_filter_copies_everything() {
        let (trigger, queue) = trigger(&[], true);
        trigger.handle(Path::new("/src/..data"), FsOp::Create);
        // a second update before the worker runs collapses into the first
        trigger.handle(Path::new("/src/..data"), FsOp::Create);

        assert_eq!(drain(&queue), vec![""]);
    }
}
