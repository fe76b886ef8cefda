//! Per-stage block lists.
//!
//! Each lifecycle stage of a task runs an ordered list of small blocks over
//! the shared [`EncoderCore`]. The full order is fixed in
//! [`assemble_pipeline`]. A block returning a not-ready status parks the task
//! and the stage resumes from that block on a later turn; an error aborts the
//! stage; warnings accumulate.

use tracing::{debug, trace, warn};

use crate::encoder::device::DeviceFrame;
use crate::encoder::dpb::IDX_INVALID;
use crate::encoder::enctools::BrcStatus;
use crate::encoder::general::get_current_frame_header;
use crate::encoder::packer::{pack_padding, patch_obu_frame_size, patch_qindex};
use crate::encoder::session::{EncoderCore, FrameOutput};
use crate::encoder::task::{InsertHeaders, RepeatedFrame, Task, TaskState};
use crate::encoder::REFS_PER_FRAME;
use crate::error::{EncodeError, Result, Status};

/// Lifecycle stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    PreReorder,
    PostReorder,
    Submit,
    Query,
    Free,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Prepare,
        Stage::PreReorder,
        Stage::PostReorder,
        Stage::Submit,
        Stage::Query,
        Stage::Free,
    ];
}

/// Per-turn inputs visible to every block.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnContext {
    /// No more input frames will arrive.
    pub flush: bool,
}

type BlockFn = fn(&mut EncoderCore, &mut Task, &TurnContext) -> Result<Status>;

/// One named step of a stage.
#[derive(Clone, Copy)]
pub struct Block {
    pub name: &'static str,
    run: BlockFn,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

const fn block(name: &'static str, run: BlockFn) -> Block {
    Block { name, run }
}

/// Ordered blocks of every stage.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: [Vec<Block>; 6],
}

impl Pipeline {
    pub fn blocks(&self, stage: Stage) -> &[Block] {
        &self.stages[stage as usize]
    }

    /// Runs `stage` for `task`, starting at the task's checkpoint.
    pub fn run_stage(
        &self,
        stage: Stage,
        core: &mut EncoderCore,
        task: &mut Task,
        ctx: &TurnContext,
    ) -> Result<Status> {
        let mut status = Status::Ok;
        for (idx, block) in self.blocks(stage).iter().enumerate().skip(task.checkpoint) {
            let sts = match (block.run)(core, task, ctx) {
                Ok(sts) => sts,
                Err(e) => {
                    debug!(
                        "Stage {:?} aborted in {} for task {}: {}",
                        stage, block.name, task.id, e
                    );
                    task.checkpoint = 0;
                    return Err(e);
                }
            };
            if sts.is_not_ready() {
                trace!(?stage, block = block.name, task = task.id, ?sts, "parked");
                task.checkpoint = idx;
                return Ok(sts);
            }
            status = status.worst(sts);
        }
        task.checkpoint = 0;
        Ok(status)
    }
}

/// Builds the block lists. This is the only place the order is decided.
pub fn assemble_pipeline() -> Pipeline {
    Pipeline {
        stages: [
            vec![
                block("check_surface", check_surface),
                block("submit_pre_enc", submit_pre_enc),
            ],
            vec![
                block("query_pre_enc", query_pre_enc),
                block("tag_frame", tag_frame),
            ],
            vec![
                block("configure", configure),
                block("brc_get_ctrl", brc_get_ctrl),
                block("pack_headers", pack_headers),
                block("add_repeated_frames", add_repeated_frames),
            ],
            vec![block("submit", submit)],
            vec![
                block("query_device", query_device),
                block("brc_update", brc_update),
                block("assemble_output", assemble_output),
            ],
            vec![
                block("release_resources", release_resources),
                block("discard_enc_tools", discard_enc_tools),
            ],
        ],
    }
}

// Prepare

fn check_surface(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    let surface = task
        .surface
        .as_ref()
        .ok_or_else(|| EncodeError::InvalidVideoParam("task without input surface".into()))?;
    if surface.data.len() < core.frame_size {
        return Err(EncodeError::InvalidVideoParam(format!(
            "surface holds {} bytes, frame needs {}",
            surface.data.len(),
            core.frame_size
        )));
    }
    task.timestamp = surface.timestamp;
    task.display_order = core.next_display_order;
    core.next_display_order += 1;
    Ok(Status::Ok)
}

fn submit_pre_enc(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    match core.enc_tools.as_mut() {
        Some(et) => et.submit_pre_enc_task(task),
        None => Ok(Status::Ok),
    }
}

// PreReorder

fn query_pre_enc(core: &mut EncoderCore, task: &mut Task, ctx: &TurnContext) -> Result<Status> {
    match core.enc_tools.as_mut() {
        Some(et) => et.query_pre_enc_task(task, ctx.flush),
        None => Ok(Status::Ok),
    }
}

fn tag_frame(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    let forced = task.ctrl.frame_type.or(task.hints.frame_type);
    let pos = core.gop.next_frame(forced);
    if pos.display_order != task.display_order {
        return Err(EncodeError::InvalidDpbState(format!(
            "GOP tagged display order {} for task at {}",
            pos.display_order, task.display_order
        )));
    }
    task.display_order_in_gop = pos.display_order_in_gop;
    task.frame_type = pos.frame_type;
    task.pyramid_level = pos.pyramid_level;
    task.temporal_id = pos.temporal_id;
    task.state = TaskState::PreReorder;
    trace!(
        display_order = task.display_order,
        frame_type = ?task.frame_type,
        "tagged"
    );
    Ok(Status::Ok)
}

// PostReorder

fn configure(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    core.general
        .configure_task(task, &mut core.state, &mut core.pool)?;
    Ok(Status::Ok)
}

fn brc_get_ctrl(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    if task.ctrl.qp.is_some() || !core.brc_active() {
        return Ok(Status::Ok);
    }
    if let Some(et) = core.enc_tools.as_mut() {
        et.brc_get_ctrl(task)?;
    }
    let general = &core.general;
    task.frame_header =
        get_current_frame_header(&general.sh, &general.fh_template, task, &general.config);
    Ok(Status::Ok)
}

fn pack_headers(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    task.headers = core.packer.pack_headers(
        &core.general.sh,
        &task.frame_header,
        task.insert_headers,
        task.temporal_id,
    )?;
    debug!(
        "Packed headers for display {}: {} bytes, insert={:?}",
        task.display_order,
        task.headers.data.len(),
        task.insert_headers
    );
    Ok(Status::Ok)
}

fn add_repeated_frames(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    task.repeated.clear();
    for &show in &task.frames_to_show {
        let packed =
            core.packer
                .pack_show_existing(&core.general.sh, show.slot, 0, core.general.config.ivf)?;
        task.repeated.push(RepeatedFrame {
            show,
            data: packed.data,
            ivf_frame_header: packed.ivf_frame_header,
        });
    }
    task.state = TaskState::PostReorder;
    Ok(Status::Ok)
}

// Submit

fn submit(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    let rec = task.rec.ok_or_else(|| {
        EncodeError::InvalidDpbState(format!(
            "display order {} has no reconstruction target",
            task.display_order
        ))
    })?;
    let mut refs = [None; REFS_PER_FRAME];
    for (dst, &idx) in refs.iter_mut().zip(&task.ref_list) {
        if idx != IDX_INVALID {
            *dst = task.dpb.active.get(idx as usize).map(|f| f.rec);
        }
    }
    let frame = DeviceFrame {
        task_id: task.id,
        display_order: task.display_order,
        encoded_order: task.encoded_order,
        frame_type: task.frame_type,
        qp: task.qp_y,
        surface: task.surface.clone(),
        rec,
        refs,
    };
    let status = core.device.submit(&frame)?;
    if status == Status::Ok {
        task.state = TaskState::Submitted;
    }
    Ok(status)
}

// Query

fn query_device(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    match core.device.query(task.id)? {
        Some(out) => {
            task.bitstream = out.tile_data;
            Ok(Status::Ok)
        }
        None => Ok(Status::MoreData),
    }
}

/// Coded bytes of the frame itself, without the temporal unit prefix.
fn frame_bytes(task: &Task) -> usize {
    task.headers.data.len() - task.headers.tu_prefix_len + task.bitstream.len()
}

fn brc_update(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    task.rewind = false;
    if task.ctrl.qp.is_some() || !core.brc_active() {
        return Ok(Status::Ok);
    }
    let max_recode = core.general.config.max_recode;
    let Some(et) = core.enc_tools.as_mut() else {
        return Ok(Status::Ok);
    };
    let coded = frame_bytes(task) as u32;
    let decision = et.brc_update(task, coded)?;
    match decision.status {
        BrcStatus::Ok => {}
        BrcStatus::BigFrame | BrcStatus::SmallFrame if task.num_recode < max_recode => {
            task.num_recode += 1;
            et.brc_get_ctrl(task)?;
            task.frame_header.quantization.base_q_idx = task.qp_y;
            patch_qindex(&mut task.headers.data, &task.headers.offsets, task.qp_y)?;
            task.bitstream.clear();
            task.rewind = true;
            debug!(
                "Recode {} of display {} at qp {}",
                task.num_recode, task.display_order, task.qp_y
            );
        }
        BrcStatus::BigFrame | BrcStatus::SmallFrame => {
            warn!(
                "Recode limit reached for display {}, keeping {} bytes",
                task.display_order, coded
            );
        }
        BrcStatus::PanicBigFrame if task.frame_type.is_i() => {
            warn!(
                "BRC dropped key frame {}; keeping {} bytes",
                task.display_order, coded
            );
        }
        BrcStatus::PanicBigFrame => {
            task.skip = true;
            core.general
                .unconfigure_task(task, &mut core.state, &mut core.pool)?;
        }
        BrcStatus::PanicSmallFrame => {
            task.min_frame_size = decision.min_frame_size;
            let padded = coded as usize + padding(task.min_frame_size, coded as usize)?.len();
            let retry = et.brc_update(task, padded as u32)?;
            if retry.status != BrcStatus::Ok {
                warn!(
                    "BRC still reports {:?} for display {} after padding to {} bytes",
                    retry.status, task.display_order, padded
                );
            }
        }
    }
    Ok(Status::Ok)
}

/// Padding OBU that lifts a frame of `coded` bytes to `min` bytes.
fn padding(min: u32, coded: usize) -> Result<Vec<u8>> {
    let min = min as usize;
    if min <= coded {
        return Ok(Vec::new());
    }
    pack_padding(min - coded)
}

fn assemble_output(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    if task.rewind {
        return Ok(Status::Ok);
    }
    if task.skip {
        core.output.drop_frame(FrameOutput::from_task(task, Vec::new()))?;
        task.state = TaskState::Queried;
        return Ok(Status::Ok);
    }
    let mut data = std::mem::take(&mut task.headers.data);
    if task.insert_headers.contains(InsertHeaders::OBU_FRAME) {
        patch_obu_frame_size(&mut data, &task.headers.offsets, task.bitstream.len())?;
        data.extend_from_slice(&task.bitstream);
    } else {
        data.extend(core.packer.pack_tile_group(&task.bitstream, task.temporal_id)?);
    }
    let coded = data.len() - task.headers.tu_prefix_len;
    data.extend(padding(task.min_frame_size, coded)?);
    let out = FrameOutput::from_task(task, data);
    core.output.push(out)?;
    task.state = TaskState::Queried;
    Ok(Status::Ok)
}

// Free

fn release_resources(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    // The post-refresh DPB belongs to the session state by now.
    core.pool.release_dpb(&task.dpb.active);
    if let Some(rec) = task.rec.take() {
        core.pool.release(rec);
    }
    task.dpb = Default::default();
    task.surface = None;
    task.state = TaskState::Freed;
    Ok(Status::Ok)
}

fn discard_enc_tools(core: &mut EncoderCore, task: &mut Task, _: &TurnContext) -> Result<Status> {
    if let Some(et) = core.enc_tools.as_mut() {
        et.discard(task.display_order)?;
    }
    Ok(Status::Ok)
}
