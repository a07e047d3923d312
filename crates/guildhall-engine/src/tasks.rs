use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handles given to a scheduled task.
#[derive(Clone)]
pub(crate) struct TaskCtx {
    pub cancel: CancellationToken,
    pub wake: Arc<Notify>,
}

struct TaskEntry {
    ctx: TaskCtx,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// At most one running task per key. A task removes its own entry on exit,
/// guarded by a generation number so it never evicts a successor.
pub(crate) struct TaskRegistry<K> {
    entries: Arc<Mutex<HashMap<K, TaskEntry>>>,
    next_generation: Arc<AtomicU64>,
}

impl<K> Clone for TaskRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_generation: self.next_generation.clone(),
        }
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Copy + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, TaskEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `make(ctx)` for `key` unless a task for it is already running.
    /// Returns whether a task was spawned.
    pub fn spawn<F, Fut>(&self, key: K, parent: &CancellationToken, make: F) -> bool
    where
        F: FnOnce(TaskCtx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let ctx = TaskCtx {
            cancel: parent.child_token(),
            wake: Arc::new(Notify::new()),
        };
        let fut = make(ctx.clone());
        let registry = self.clone();
        // The entry is inserted before the lock is released, so the task's
        // own removal always finds it.
        let handle = tokio::spawn(async move {
            fut.await;
            registry.finish(key, generation);
        });
        entries.insert(
            key,
            TaskEntry {
                ctx,
                generation,
                handle: Some(handle),
            },
        );
        true
    }

    fn finish(&self, key: K, generation: u64) {
        let mut entries = self.lock();
        if entries.get(&key).is_some_and(|e| e.generation == generation) {
            entries.remove(&key);
        }
    }

    pub fn contains(&self, key: K) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn wake(&self, key: K) {
        if let Some(entry) = self.lock().get(&key) {
            entry.ctx.wake.notify_one();
        }
    }

    /// Cancel the task for `key` without waiting for it.
    pub fn cancel(&self, key: K) {
        if let Some(entry) = self.lock().remove(&key) {
            entry.ctx.cancel.cancel();
        }
    }

    /// Cancel the task for `key` and wait until it has stopped.
    pub async fn cancel_and_wait(&self, key: K) {
        let handle = self.lock().remove(&key).and_then(|mut entry| {
            entry.ctx.cancel.cancel();
            entry.handle.take()
        });
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Cancel every task and wait for all of them.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .lock()
            .drain()
            .filter_map(|(_, mut entry)| {
                entry.ctx.cancel.cancel();
                entry.handle.take()
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
