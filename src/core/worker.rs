//! Worker pool that runs call transitions off the dispatch loops.

use std::future::Future;

use tokio_util::task::TaskTracker;

/// Unbounded pool of tokio tasks. Every transition runs here so a slow call
/// never holds up a drain loop.
#[derive(Clone, Default)]
pub struct WorkerPool {
    tasks: TaskTracker,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            tasks: TaskTracker::new(),
        }
    }

    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(work);
    }

    /// Number of transitions currently running.
    pub fn busy(&self) -> usize {
        self.tasks.len()
    }

    /// Close the pool and wait until every spawned transition has returned.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
