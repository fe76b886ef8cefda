//! A reconstructed frame held in one or more DPB slots.

use crate::encoder::FrameType;

use super::pool::RecHandle;

/// Reference marking state for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingState {
    /// Used for short-term reference.
    #[default]
    ShortTerm,
    /// Used for long-term reference.
    LongTerm,
}

impl MarkingState {
    /// Returns true if this is a short-term reference.
    pub fn is_short_term(&self) -> bool {
        matches!(self, Self::ShortTerm)
    }

    /// Returns true if this is a long-term reference.
    pub fn is_long_term(&self) -> bool {
        matches!(self, Self::LongTerm)
    }
}

/// A frame in the decoded picture buffer.
///
/// The same frame may occupy several slots; all copies share `rec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbFrame {
    /// Global display order.
    pub display_order: u32,
    /// Display order since the last key frame (source of the order hint).
    pub display_order_in_gop: u32,
    /// Global encode order.
    pub encoded_order: u32,
    pub frame_type: FrameType,
    pub pyramid_level: u8,
    pub temporal_id: u8,
    pub marking: MarkingState,
    pub long_term_idx: u16,
    /// The application asked not to reference this frame.
    pub rejected: bool,
    /// Reconstructed surface.
    pub rec: RecHandle,
}

impl DpbFrame {
    /// Both entries describe the same coded frame.
    pub fn same_frame(&self, other: &DpbFrame) -> bool {
        self.display_order == other.display_order && self.rec == other.rec
    }

    pub fn is_long_term(&self) -> bool {
        self.marking.is_long_term()
    }

    /// Mark as long-term reference.
    pub fn mark_long_term(&mut self, long_term_idx: u16) {
        self.marking = MarkingState::LongTerm;
        self.long_term_idx = long_term_idx;
    }
}
