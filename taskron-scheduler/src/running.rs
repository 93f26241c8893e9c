use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;

/// In-flight registry. A task id is present exactly while one run of that
/// task is between acquisition and the drop of its [`RunGuard`].
#[derive(Clone, Default)]
pub struct RunningTasks {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the task as running, or returns `None` when it already is.
    pub fn try_acquire(&self, task_id: i64) -> Option<RunGuard> {
        let mut running = self.inner.lock();
        if !running.insert(task_id) {
            return None;
        }
        Some(RunGuard {
            task_id,
            registry: self.inner.clone(),
        })
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.inner.lock().contains(&task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Releases the task's slot when dropped, including when the owning worker
/// panics or is aborted.
#[must_use = "the task is released as soon as the guard is dropped"]
pub struct RunGuard {
    task_id: i64,
    registry: Arc<Mutex<HashSet<i64>>>,
}

impl RunGuard {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.task_id);
    }
}
