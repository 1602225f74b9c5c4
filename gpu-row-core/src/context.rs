//! Per-task execution context.
//!
//! The task runner owns a [`TaskContext`] for every task instance. Components
//! that hold resources register completion listeners on it; the runner calls
//! [`TaskContext::complete`] once the task body returns, however it ended, and
//! every listener runs exactly once. Cancellation is a flag that components
//! poll at their suspension points.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure,
    Cancelled,
}

pub type CompletionListener = Box<dyn FnOnce(TaskOutcome) + Send>;

#[derive(Default)]
struct Listeners {
    pending: Vec<CompletionListener>,
    outcome: Option<TaskOutcome>,
}

pub struct TaskContext {
    task_id: u64,
    partition_id: usize,
    cancelled: AtomicBool,
    listeners: Mutex<Listeners>,
}

impl TaskContext {
    pub fn new(task_id: u64, partition_id: usize) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            partition_id,
            cancelled: AtomicBool::new(false),
            listeners: Mutex::new(Listeners::default()),
        })
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    /// Register a listener. If the task already completed it runs right away.
    pub fn add_completion_listener(&self, listener: CompletionListener) {
        let mut listeners = self.listeners.lock();
        if let Some(outcome) = listeners.outcome {
            drop(listeners);
            listener(outcome);
            return;
        }
        listeners.pending.push(listener);
    }

    /// Request cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("task {} cancellation requested", self.task_id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.listeners.lock().outcome.is_some()
    }

    /// Mark the task finished and run all listeners, most recent first.
    ///
    /// Returns `false` if the task had already completed; listeners never
    /// run twice.
    pub fn complete(&self, outcome: TaskOutcome) -> bool {
        let pending = {
            let mut listeners = self.listeners.lock();
            if listeners.outcome.is_some() {
                return false;
            }
            listeners.outcome = Some(outcome);
            std::mem::take(&mut listeners.pending)
        };
        debug!(
            "task {} completed with {:?}; running {} listeners",
            self.task_id,
            outcome,
            pending.len()
        );
        for listener in pending.into_iter().rev() {
            listener(outcome);
        }
        true
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("partition_id", &self.partition_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
