//! Tasks spawned on behalf of a session
//!
//! Every flow is registered under an id and unregisters itself when it
//! finishes, so shutdown can wait for the stragglers and abort the rest.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    tasks: Mutex<HashMap<u64, (String, JoinHandle<()>)>>,
    next_id: AtomicU64,
    changed: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct FlowTracker {
    inner: Arc<Inner>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `flow` and track it until it completes
    pub fn spawn<F>(&self, name: impl Into<String>, flow: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();

        // Hold the lock across spawn so a flow that finishes instantly
        // cannot unregister before it is registered
        let mut tasks = match self.inner.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };

        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            flow.await;
            tracker.unregister(id);
        });
        tasks.insert(id, (name, handle));

        id
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            if let Some((name, _)) = tasks.remove(&id) {
                debug!("Flow {} ({}) finished", id, name);
            }
        }
        self.inner.changed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no flow is running; `false` if `timeout` expired first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.is_empty() {
                return true;
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Abort every running flow, returning how many were aborted
    pub fn abort_all(&self) -> usize {
        let drained: Vec<(u64, (String, JoinHandle<()>))> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(_) => Vec::new(),
        };

        for (id, (name, handle)) in &drained {
            debug!("Aborting flow {} ({})", id, name);
            handle.abort();
        }
        self.inner.changed.notify_waiters();

        drained.len()
    }
}
