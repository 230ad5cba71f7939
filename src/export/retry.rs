//! Failed export tasks awaiting the next sweep.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::Message;

use super::{Exporter, ReleaseSwitch};

/// One delivery of one message to one schema on behalf of one topic.
#[derive(Clone)]
pub struct ExportTask {
    pub schema: Arc<dyn Exporter>,
    pub message: Arc<Message>,
    pub switch: Arc<ReleaseSwitch>,
    pub source_topic: String,
    /// Failed sweep retries so far.
    pub attempts: u32,
}

impl ExportTask {
    pub fn schema_name(&self) -> &str {
        self.schema.name()
    }
}

/// Process-wide queue of failed tasks, independent of their switches.
#[derive(Default)]
pub struct RetryQueue {
    tasks: Mutex<VecDeque<ExportTask>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task and run `on_queued` before the queue lock is released.
    pub fn push_then(&self, task: ExportTask, on_queued: impl FnOnce(&ExportTask)) {
        let mut queue = self.tasks.lock();
        on_queued(&task);
        queue.push_back(task);
    }

    /// Run `on_idle` under the queue lock if no task for `schema` is queued.
    /// Returns whether it ran.
    pub fn when_idle(&self, schema: &str, on_idle: impl FnOnce()) -> bool {
        let queue = self.tasks.lock();
        if queue.iter().any(|t| t.schema_name() == schema) {
            return false;
        }
        on_idle();
        true
    }

    /// Take every queued task, leaving the queue empty.
    pub fn take_all(&self) -> Vec<ExportTask> {
        self.tasks.lock().drain(..).collect()
    }

    /// Put tasks back at the front, keeping their order.
    pub fn requeue(&self, tasks: Vec<ExportTask>) {
        let mut queue = self.tasks.lock();
        for task in tasks.into_iter().rev() {
            queue.push_front(task);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
