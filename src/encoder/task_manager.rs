//! Task pool and stage queues.
//!
//! Tasks are allocated once and move by value through the queues:
//!
//! ```text
//! free -> prepared -> reorder window -> encode -> submitted -> done -> free
//! ```
//!
//! The reorder window holds tagged frames in display order; everything after
//! it is in encode order.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::encoder::dpb::Dpb;
use crate::encoder::reorder::{buffered_display_info, ReorderStrategy};
use crate::encoder::task::Task;
use crate::encoder::EncodeConfig;

/// Queues of one encode session.
#[derive(Debug)]
pub struct TaskManager {
    num_task: usize,
    max_in_flight: usize,
    free: VecDeque<Task>,
    prepared: VecDeque<Task>,
    reorder: Vec<Task>,
    encode: VecDeque<Task>,
    submitted: VecDeque<Task>,
    done: VecDeque<Task>,
}

/// Pool size for a resolved configuration.
///
/// Async depth, the reorder buffer, one extra task when more than one frame
/// is in flight and the look-ahead delay.
pub fn num_task(config: &EncodeConfig, la_delay: u32) -> usize {
    let async_depth = config.async_depth.max(1);
    let reorder = config.gop_ref_dist.max(1) - 1;
    let extra = u32::from(async_depth > 1);
    (async_depth + reorder + extra + la_delay) as usize
}

impl TaskManager {
    /// `max_in_flight` caps the tasks handed to the device at once.
    pub fn new(num_task: usize, max_in_flight: usize) -> Self {
        let num_task = num_task.max(1);
        Self {
            num_task,
            max_in_flight: max_in_flight.max(1),
            free: (0..num_task).map(Task::new).collect(),
            prepared: VecDeque::new(),
            reorder: Vec::new(),
            encode: VecDeque::new(),
            submitted: VecDeque::new(),
            done: VecDeque::new(),
        }
    }

    pub fn num_task(&self) -> usize {
        self.num_task
    }

    /// Takes a task from the pool, or `None` when every task is busy.
    pub fn alloc_task(&mut self) -> Option<Task> {
        self.free.pop_front()
    }

    /// Returns a task to the pool, cleared.
    pub fn release_task(&mut self, mut task: Task) {
        task.reset();
        self.free.push_back(task);
    }

    pub fn push_prepared(&mut self, task: Task) {
        self.prepared.push_back(task);
    }

    pub fn pop_prepared(&mut self) -> Option<Task> {
        self.prepared.pop_front()
    }

    pub fn unpop_prepared(&mut self, task: Task) {
        self.prepared.push_front(task);
    }

    /// Adds a tagged task to the reorder window, keeping display order.
    pub fn push_reorder(&mut self, task: Task) {
        let pos = self
            .reorder
            .partition_point(|t| t.display_order < task.display_order);
        self.reorder.insert(pos, task);
    }

    /// Takes the next task to encode out of the reorder window.
    ///
    /// `flush` only takes effect once no untagged input is left, so the
    /// window sees every remaining frame before trailing B-frames are
    /// promoted. The chosen task gets its hidden-frame bookkeeping: it is
    /// hidden when an earlier frame is still buffered, and
    /// `next_buffered_display_order` names the first frame after it that
    /// is still waiting.
    pub fn get_next_task_to_encode(
        &mut self,
        reorderer: &dyn ReorderStrategy,
        dpb: &Dpb,
        flush: bool,
    ) -> Option<Task> {
        let flush = flush && self.prepared.is_empty();
        let idx = reorderer.select(&mut self.reorder, dpb, flush)?;
        let (hidden, next) = buffered_display_info(&self.reorder, idx);
        let next = next.or_else(|| self.prepared.front().map(|t| t.display_order));

        let mut task = self.reorder.remove(idx);
        task.is_hidden = hidden;
        task.next_buffered_display_order = next;
        debug!(
            "Reorder: picked display {} type={:?} hidden={} next_buffered={:?}",
            task.display_order, task.frame_type, hidden, next
        );
        Some(task)
    }

    pub fn push_encode(&mut self, task: Task) {
        self.encode.push_back(task);
    }

    /// Next configured task, if the device may take another one.
    pub fn pop_encode(&mut self) -> Option<Task> {
        if self.submitted.len() >= self.max_in_flight {
            trace!(in_flight = self.submitted.len(), "submit window full");
            return None;
        }
        self.encode.pop_front()
    }

    /// Puts a task back at the head of the encode queue.
    pub fn unpop_encode(&mut self, task: Task) {
        self.encode.push_front(task);
    }

    pub fn push_submitted(&mut self, task: Task) {
        self.submitted.push_back(task);
    }

    /// Oldest task on the device.
    pub fn pop_submitted(&mut self) -> Option<Task> {
        self.submitted.pop_front()
    }

    pub fn unpop_submitted(&mut self, task: Task) {
        self.submitted.push_front(task);
    }

    pub fn push_done(&mut self, task: Task) {
        self.done.push_back(task);
    }

    pub fn pop_done(&mut self) -> Option<Task> {
        self.done.pop_front()
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_submitted(&self) -> usize {
        self.submitted.len()
    }

    /// Some task is configured but not yet back from the device.
    pub fn has_configured(&self) -> bool {
        !self.encode.is_empty() || !self.submitted.is_empty()
    }

    /// Tasks not yet handed to the device, in any queue.
    pub fn num_buffered(&self) -> usize {
        self.prepared.len() + self.reorder.len() + self.encode.len()
    }

    /// True when every task is back in the pool.
    pub fn is_idle(&self) -> bool {
        self.free.len() == self.num_task
    }

    /// Removes every task the device has not seen yet.
    ///
    /// Tasks come back untagged first, then the reorder window, then the
    /// configured ones in encode order.
    pub fn cancel_tasks(&mut self) -> Vec<Task> {
        let mut cancelled: Vec<Task> = self.prepared.drain(..).collect();
        cancelled.append(&mut self.reorder);
        cancelled.extend(self.encode.drain(..));
        for task in &mut cancelled {
            task.cancelled = true;
        }
        if !cancelled.is_empty() {
            debug!("Cancelled {} buffered tasks", cancelled.len());
        }
        cancelled
    }
}
