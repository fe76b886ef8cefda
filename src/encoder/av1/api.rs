use std::sync::Arc;

use super::{Av1Encoder, MAX_STALLED_TURNS};

use crate::encoder::pipeline::Stage;
use crate::encoder::task::TaskState;
use crate::encoder::{EncodeConfig, EncodedPacket, FrameCtrl, RawSurface};
use crate::error::{EncodeError, Result, Status};
use tracing::{debug, trace};

impl Av1Encoder {
    /// Queues one input frame.
    ///
    /// Returns `Status::DeviceBusy` when every task is in use (drain output
    /// and call again), `Status::MoreData` while frames are buffered without
    /// output, and `Status::Ok` once packets are ready in
    /// [`Av1Encoder::take_output`].
    pub fn encode_frame_check(
        &mut self,
        surface: Arc<RawSurface>,
        ctrl: Option<FrameCtrl>,
    ) -> Result<Status> {
        self.ensure_open()?;
        let Some(mut task) = self.tasks.alloc_task() else {
            trace!("no free task");
            self.run_scheduler_turn()?;
            return Ok(Status::DeviceBusy);
        };
        task.surface = Some(surface);
        task.ctrl = ctrl.unwrap_or_default();

        let ctx = self.turn_context();
        match self
            .pipeline
            .run_stage(Stage::Prepare, &mut self.core, &mut task, &ctx)
        {
            Ok(status) if status.is_not_ready() => {
                self.tasks.release_task(task);
                return Err(EncodeError::EncTools(
                    "look-ahead did not accept the frame".into(),
                ));
            }
            Ok(_) => {
                debug!("AV1 encode: frame {} queued as task {}", task.display_order, task.id);
                self.tasks.push_prepared(task);
            }
            Err(e) => {
                self.tasks.release_task(task);
                return Err(e);
            }
        }

        self.run_scheduler_turn()?;
        Ok(if self.core.output.has_packets() {
            Status::Ok
        } else {
            Status::MoreData
        })
    }

    /// Moves every task as far through the pipeline as it can go.
    ///
    /// Returns `Status::MoreData` when nothing moved.
    pub fn run_scheduler_turn(&mut self) -> Result<Status> {
        self.ensure_open()?;
        let ctx = self.turn_context();
        let mut progress = false;

        while let Some(mut task) = self.tasks.pop_prepared() {
            match self
                .pipeline
                .run_stage(Stage::PreReorder, &mut self.core, &mut task, &ctx)
            {
                Ok(status) if status.is_not_ready() => {
                    self.tasks.unpop_prepared(task);
                    break;
                }
                Ok(_) => {
                    self.tasks.push_reorder(task);
                    progress = true;
                }
                Err(e) => {
                    self.abort_task(task);
                    return Err(e);
                }
            }
        }

        // Rate control may drop a frame once the device is done with it, which
        // rewinds the session state; nothing may be configured on top of it.
        let serial = self.core.brc_active();
        while !(serial && self.tasks.has_configured()) {
            let Some(mut task) = self.tasks.get_next_task_to_encode(
                self.core.reorderer.as_ref(),
                &self.core.state.dpb,
                self.flushing,
            ) else {
                break;
            };
            if let Err(e) = self
                .pipeline
                .run_stage(Stage::PostReorder, &mut self.core, &mut task, &ctx)
            {
                self.abort_task(task);
                return Err(e);
            }
            self.tasks.push_encode(task);
            progress = true;
        }

        while let Some(mut task) = self.tasks.pop_encode() {
            match self
                .pipeline
                .run_stage(Stage::Submit, &mut self.core, &mut task, &ctx)
            {
                Ok(status) if status.is_not_ready() => {
                    self.tasks.unpop_encode(task);
                    break;
                }
                Ok(_) => {
                    self.tasks.push_submitted(task);
                    progress = true;
                }
                Err(e) => {
                    self.abort_task(task);
                    return Err(e);
                }
            }
        }

        while let Some(mut task) = self.tasks.pop_submitted() {
            match self
                .pipeline
                .run_stage(Stage::Query, &mut self.core, &mut task, &ctx)
            {
                Ok(status) if status.is_not_ready() => {
                    self.tasks.unpop_submitted(task);
                    break;
                }
                Ok(_) if task.rewind => {
                    task.state = TaskState::PostReorder;
                    self.tasks.unpop_encode(task);
                    progress = true;
                    break;
                }
                Ok(_) => {
                    self.tasks.push_done(task);
                    progress = true;
                }
                Err(e) => {
                    self.abort_task(task);
                    return Err(e);
                }
            }
        }

        while let Some(mut task) = self.tasks.pop_done() {
            self.pipeline
                .run_stage(Stage::Free, &mut self.core, &mut task, &ctx)?;
            self.tasks.release_task(task);
            progress = true;
        }

        Ok(if progress { Status::Ok } else { Status::MoreData })
    }

    /// Packets finished so far, in bitstream order.
    pub fn take_output(&mut self) -> Vec<EncodedPacket> {
        self.core.output.take_packets()
    }

    /// Encodes one frame and returns whatever output became ready.
    ///
    /// Turns the scheduler until a task is free, so this call may wait for
    /// the device.
    pub fn encode(
        &mut self,
        surface: RawSurface,
        ctrl: Option<FrameCtrl>,
    ) -> Result<Vec<EncodedPacket>> {
        let surface = Arc::new(surface);
        let mut stalled = 0;
        while self.encode_frame_check(Arc::clone(&surface), ctrl.clone())? == Status::DeviceBusy {
            stalled += 1;
            if stalled > MAX_STALLED_TURNS {
                return Err(EncodeError::Aborted("no task became free".into()));
            }
        }
        Ok(self.take_output())
    }

    /// Encodes every buffered frame and returns the remaining output.
    pub fn flush(&mut self) -> Result<Vec<EncodedPacket>> {
        self.ensure_open()?;
        debug!("AV1 flush: {} tasks buffered", self.tasks.num_buffered());
        self.flushing = true;
        let result = self.run_until_idle();
        self.flushing = false;
        result?;
        Ok(self.take_output())
    }

    /// Turns the scheduler until every task is back in the pool.
    pub(super) fn run_until_idle(&mut self) -> Result<()> {
        let mut stalled = 0;
        while !self.tasks.is_idle() {
            if self.run_scheduler_turn()? == Status::Ok {
                stalled = 0;
                continue;
            }
            stalled += 1;
            if stalled > MAX_STALLED_TURNS {
                return Err(EncodeError::Aborted(format!(
                    "pipeline stalled with {} buffered and {} submitted tasks",
                    self.tasks.num_buffered(),
                    self.tasks.num_submitted()
                )));
            }
        }
        Ok(())
    }

    /// Configuration in effect, with every default resolved.
    pub fn video_param(&self) -> &EncodeConfig {
        &self.core.general.config
    }

    /// Forces the next tagged frame to be an IDR frame.
    pub fn request_idr(&mut self) {
        self.core.gop.request_idr();
    }

    /// Tasks in the pool.
    pub fn num_task(&self) -> usize {
        self.tasks.num_task()
    }

    /// AV1 sequence header OBU of the current configuration.
    pub fn sequence_header(&self) -> Result<Vec<u8>> {
        crate::encoder::packer::Packer::pack_sps(&self.core.general.sh)
    }
}
