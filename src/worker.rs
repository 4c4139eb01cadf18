//! Copy worker draining the task queue

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, Span};

use crate::copy::Copier;
use crate::queue::DelayingQueue;
use crate::task::CopyTask;

/// Delay before a failed task is attempted again
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Worker {
    queue: Arc<DelayingQueue<CopyTask>>,
    copier: Copier,
    retry_delay: Duration,
    span: Span,
}

impl Worker {
    pub fn new(queue: Arc<DelayingQueue<CopyTask>>, copier: Copier, span: Span) -> Self {
        Self {
            queue,
            copier,
            retry_delay: RETRY_DELAY,
            span,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Run on a dedicated thread until the queue shuts down.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("copy-worker".into())
            .spawn(move || self.run())
    }

    pub fn run(&self) {
        while let Some(task) = self.queue.get() {
            self.process(&task);
            // after the retry is queued, so it is not swallowed by its own in-flight marker
            self.queue.done(&task);
        }
        let _enter = self.span.enter();
        info!("task queue shut down, copy worker exiting");
    }

    fn process(&self, task: &CopyTask) {
        let _enter = self.span.enter();
        match self.copier.copy(task) {
            Ok(()) => info!(task = %task, "copy task completed"),
            Err(e) => {
                error!(
                    task = %task,
                    error = %e,
                    retry_in = ?self.retry_delay,
                    "copy task failed, retrying"
                );
                self.queue.add_after(task.clone(), self.retry_delay);
            }
        }
    }
}
