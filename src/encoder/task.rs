//! Per-frame encode task.
//!
//! A task owns everything one input frame needs on its way through the
//! pipeline. Tasks are pre-allocated and move by value between the task
//! manager's queues, so a task is only ever touched by the stage that holds it.

use std::sync::Arc;

use bitflags::bitflags;

use crate::encoder::dpb::{Dpb, RecHandle, IDX_INVALID};
use crate::encoder::general::EncoderSessionState;
use crate::encoder::packer::{FrameHeader, PackedHeaders};
use crate::encoder::{FrameCtrl, FrameType, RawSurface, REFS_PER_FRAME};

bitflags! {
    /// Headers packed in front of a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertHeaders: u8 {
        /// IVF stream header (first frame only).
        const IVF_SEQ = 0x01;
        /// IVF frame header placeholder, patched when the temporal unit completes.
        const IVF_FRAME = 0x02;
        /// Temporal delimiter.
        const TD = 0x04;
        /// Sequence header.
        const SPS = 0x08;
        /// Frame header.
        const PPS = 0x10;
        /// Pack the frame header as OBU_FRAME.
        const OBU_FRAME = 0x20;
        /// HDR metadata OBUs.
        const HDR = 0x40;
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// In the free pool.
    #[default]
    New,
    /// Prepare stage finished, waiting for reorder.
    PreReorder,
    /// Selected for encoding, frame parameters derived.
    PostReorder,
    /// Handed to the device.
    Submitted,
    /// Device output collected.
    Queried,
    /// Resources released.
    Freed,
}

/// Snapshot of the DPB before and after this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskDpb {
    /// Slots this frame may reference.
    pub active: Dpb,
    /// Slots after this frame's refresh.
    pub after: Dpb,
}

/// A hidden frame to re-show once this frame's temporal unit is out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShowFrame {
    pub slot: u8,
    pub display_order: u32,
    pub encoded_order: u32,
    pub frame_type: FrameType,
}

/// A packed show-existing-frame temporal unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedFrame {
    pub show: ShowFrame,
    pub data: Vec<u8>,
    pub ivf_frame_header: Option<usize>,
}

/// Hints returned by look-ahead for this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookAheadHints {
    pub scene_change: bool,
    /// Look-ahead asks for this frame type.
    pub frame_type: Option<FrameType>,
    /// Look-ahead asks to keep this frame as a long-term reference.
    pub long_term: bool,
    pub persistence_map: Option<[u8; 16]>,
    /// Coded size look-ahead considers optimal, in bytes.
    pub optimal_frame_size: Option<u32>,
}

/// Per-frame encode task.
#[derive(Debug, Default)]
pub struct Task {
    /// Index in the task pool.
    pub id: usize,
    pub state: TaskState,
    /// Block to resume the current stage from.
    pub checkpoint: usize,
    /// Send the task back to the device: rate control asked for a recode.
    pub rewind: bool,
    pub cancelled: bool,

    pub surface: Option<Arc<RawSurface>>,
    pub ctrl: FrameCtrl,
    pub timestamp: u64,

    pub display_order: u32,
    /// Display order since the last key frame.
    pub display_order_in_gop: u32,
    pub encoded_order: u32,
    /// Encode order since the last key frame.
    pub encoded_order_in_gop: u32,
    /// Reference frames coded since the last key frame, this one included.
    pub ref_order_in_gop: u32,
    pub frame_type: FrameType,
    pub pyramid_level: u8,
    /// Position inside the current B-pyramid, assigned on first selection.
    pub b_pyramid_order: Option<u32>,
    pub temporal_id: u8,
    pub hints: LookAheadHints,

    pub qp_y: u8,
    pub ref_list: [u8; REFS_PER_FRAME],
    pub refresh_frame_flags: u8,
    pub dpb: TaskDpb,
    pub rec: Option<RecHandle>,
    /// Long-term index when this frame is kept as a long-term reference.
    pub long_term_idx: Option<u16>,
    pub use_ltr_as_ref: bool,
    /// Session state before this task was configured.
    pub session_before: Option<EncoderSessionState>,

    /// Decoded but not shown in its own temporal unit.
    pub is_hidden: bool,
    /// Smallest display order still buffered after this frame was selected.
    pub next_buffered_display_order: Option<u32>,
    pub frames_to_show: Vec<ShowFrame>,

    pub insert_headers: InsertHeaders,
    pub frame_header: FrameHeader,
    pub headers: PackedHeaders,
    pub repeated: Vec<RepeatedFrame>,
    /// Tile data returned by the device.
    pub bitstream: Vec<u8>,

    /// Rate control dropped this frame.
    pub skip: bool,
    pub num_recode: u32,
    /// Minimum coded size requested by rate control, in bytes.
    pub min_frame_size: u32,
}

impl Task {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ref_list: [IDX_INVALID; REFS_PER_FRAME],
            ..Default::default()
        }
    }

    /// Clears all per-frame state, keeping the pool index.
    pub fn reset(&mut self) {
        *self = Task::new(self.id);
    }

    pub fn is_shown(&self) -> bool {
        !self.is_hidden
    }

    /// The application forced a quantizer of zero.
    pub fn lossless_requested(&self) -> bool {
        self.ctrl.qp == Some(0)
    }
}
