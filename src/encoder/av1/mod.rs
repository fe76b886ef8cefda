//! AV1 encode session.
//!
//! [`Av1Encoder`] is the application-facing shell around the task pipeline:
//! it owns the task pool, the block lists and the shared encoder core, and
//! turns the scheduler by hand. Every call is non-blocking except
//! [`Av1Encoder::flush`] and the convenience [`Av1Encoder::encode`].

mod api;
mod init;

use tracing::{debug, warn};

use crate::encoder::pipeline::{Pipeline, Stage, TurnContext};
use crate::encoder::session::{EncoderCore, FrameOutput};
use crate::encoder::task::{Task, TaskState};
use crate::encoder::task_manager::TaskManager;
use crate::error::Status;

/// Scheduler turns without progress before a drain gives up.
const MAX_STALLED_TURNS: u32 = 1024;

/// AV1 encoder session.
pub struct Av1Encoder {
    core: EncoderCore,
    pipeline: Pipeline,
    tasks: TaskManager,
    /// Status reported by the last init or reset.
    init_status: Status,
    flushing: bool,
    closed: bool,
}

impl Av1Encoder {
    fn turn_context(&self) -> TurnContext {
        TurnContext {
            flush: self.flushing,
        }
    }

    /// Releases a task that will not produce output and returns it to the pool.
    ///
    /// A task that already holds an encode order leaves a placeholder so the
    /// output cache does not wait for it.
    fn abort_task(&mut self, mut task: Task) {
        if task.rec.is_some() && task.state != TaskState::Queried {
            if let Err(e) = self.core.output.push(FrameOutput::cancelled(task.encoded_order)) {
                warn!("Dropping output of task {} failed: {}", task.id, e);
            }
        }
        let ctx = self.turn_context();
        task.checkpoint = 0;
        if let Err(e) = self
            .pipeline
            .run_stage(Stage::Free, &mut self.core, &mut task, &ctx)
        {
            warn!("Freeing task {} failed: {}", task.id, e);
        }
        debug!("Aborted task {} (display {})", task.id, task.display_order);
        self.tasks.release_task(task);
    }
}
