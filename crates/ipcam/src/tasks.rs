//! Supervised background work (merges, retention sweeps).
//!
//! Tasks report a typed result back to the group instead of tearing the
//! process down. Finished tasks are reaped opportunistically; shutdown closes
//! the group and waits for everything still in flight.

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

use crate::error::{CaptureError, Result};

type Outcome = (&'static str, Result<()>);

pub struct TaskGroup {
    tasks: Mutex<Option<JoinSet<Outcome>>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn a named task. Returns `false` once the group has been closed.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        match tasks.as_mut() {
            Some(set) => {
                set.spawn(async move { (name, task.await) });
                true
            }
            None => {
                debug!(task = name, "task group closed, not spawning");
                false
            }
        }
    }

    /// Number of tasks that have not been reaped yet.
    pub fn len(&self) -> usize {
        self.tasks.lock().as_ref().map_or(0, JoinSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log and drop the results of tasks that already finished.
    ///
    /// Returns the failures seen.
    pub fn reap(&self) -> Vec<CaptureError> {
        let mut failures = Vec::new();
        let mut tasks = self.tasks.lock();
        if let Some(set) = tasks.as_mut() {
            while let Some(joined) = set.try_join_next() {
                if let Some(err) = settle(joined) {
                    failures.push(err);
                }
            }
        }
        failures
    }

    /// Close the group and wait for every outstanding task.
    ///
    /// Returns the failures seen while draining.
    pub async fn drain(&self) -> Vec<CaptureError> {
        let Some(mut set) = self.tasks.lock().take() else {
            return Vec::new();
        };

        debug!(pending = set.len(), "draining background tasks");
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Some(err) = settle(joined) {
                failures.push(err);
            }
        }
        failures
    }
}

fn settle(joined: std::result::Result<Outcome, JoinError>) -> Option<CaptureError> {
    match joined {
        Ok((name, Ok(()))) => {
            debug!(task = name, "background task finished");
            None
        }
        Ok((name, Err(e))) => {
            error!(task = name, error = %e, "background task failed");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "background task panicked or was aborted");
            Some(CaptureError::Task {
                name: "unknown",
                reason: e.to_string(),
            })
        }
    }
}
