//! One-shot and periodic deferred tasks
//!
//! Every task is registered in a shared table so [`Scheduler::dispose_all`]
//! can cancel whatever is still outstanding at shutdown. A failing or
//! panicking action is logged and never affects sibling tasks.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Identifier of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct SchedulerInner {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

/// Registry of deferred tasks, cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Run `action` once after `delay`
    ///
    /// Returns `None` if the scheduler has already been disposed.
    pub fn schedule<F, Fut>(&self, name: &'static str, delay: Duration, action: F) -> Option<TaskId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_tracked(name, async move {
            tokio::time::sleep(delay).await;
            run_guarded(name, action()).await;
        })
    }

    /// Run `action` every `period`, first run after one period
    pub fn schedule_periodic<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        mut action: F,
    ) -> Option<TaskId>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_tracked(name, async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_guarded(name, action()).await;
            }
        })
    }

    fn spawn_tracked<Fut>(&self, name: &'static str, work: Fut) -> Option<TaskId>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            debug!(task = name, "Scheduler disposed, not scheduling");
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.inner);

        // Hold the table lock across spawn + insert so a task that finishes
        // immediately cannot try to unregister before it is registered.
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(async move {
            work.await;
            if let Some(inner) = registry.upgrade() {
                inner.tasks.lock().remove(&id);
            }
        });
        tasks.insert(id, handle);
        trace!(task = name, id, "Task scheduled");
        Some(TaskId(id))
    }

    /// Cancel one task; returns `false` if it already finished
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.inner.tasks.lock().remove(&id.0) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of tasks that have not finished yet
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Cancel every outstanding task and wait until they have stopped
    ///
    /// Further `schedule` calls are refused. Calling this twice is a no-op.
    pub async fn dispose_all(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain().map(|(_, h)| h).collect();
        debug!(count = handles.len(), "Cancelling scheduled tasks");
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_guarded<Fut>(name: &'static str, action: Fut)
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(action).catch_unwind().await {
        Ok(Ok(())) => trace!(task = name, "Scheduled task completed"),
        Ok(Err(e)) => warn!(task = name, "Scheduled task failed: {:#}", e),
        Err(_) => warn!(task = name, "Scheduled task panicked"),
    }
}
