//! Supervised background tasks.
//!
//! A [`TaskGroup`] is owned by the component that starts background work.
//! Shutting the group down (or dropping it) aborts every task it spawned.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

/// Background tasks owned by one component
pub struct TaskGroup {
    owner: String,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskGroup {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task tied to this group's lifetime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        debug!("{}: spawning {}", self.owner, label);

        let handle = tokio::spawn(task);
        let mut handles = self.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((label, handle));
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        let mut handles = self.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.len()
    }

    /// Abort the tasks spawned under `label`
    pub fn abort(&self, label: &str) {
        let mut handles = self.lock();
        handles.retain(|(l, h)| {
            if l == label {
                h.abort();
                false
            } else {
                true
            }
        });
    }

    /// Abort every task in the group
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.lock().drain(..).collect();
        for (label, handle) in handles {
            if !handle.is_finished() {
                debug!("{}: aborting {}", self.owner, label);
                handle.abort();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in handles.drain(..) {
            handle.abort();
        }
    }
}
