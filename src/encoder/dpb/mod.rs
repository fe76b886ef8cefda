//! Decoded Picture Buffer (DPB) management for AV1 encoding.
//!
//! This module provides:
//! - The 8-slot AV1 reference buffer and its frames (`Dpb`, `DpbFrame`)
//! - A reference-counted pool of reconstructed surfaces (`FramePool`)
//! - Reference list construction for LAST..ALTREF (`set_task_ref_list`)
//! - Slot refresh decisions, including duplicate-slot filling and
//!   long-term/hidden-frame protection (`set_task_dpb_refresh`)

mod entry;
mod pool;
mod reference_lists;
mod refresh;

pub use entry::{DpbFrame, MarkingState};
pub use pool::{FramePool, RecHandle};
pub use reference_lists::{set_task_ref_list, RefListParams};
pub use refresh::{set_task_dpb_refresh, RefreshParams};

use crate::encoder::NUM_REF_FRAMES;

/// Reference list entry that points at no slot.
pub const IDX_INVALID: u8 = 0xFF;

/// Positions in the per-frame reference list (`ref_frame_idx[]`).
pub const LAST_FRAME: usize = 0;
pub const LAST2_FRAME: usize = 1;
pub const LAST3_FRAME: usize = 2;
pub const GOLDEN_FRAME: usize = 3;
pub const BWDREF_FRAME: usize = 4;
pub const ALTREF2_FRAME: usize = 5;
pub const ALTREF_FRAME: usize = 6;

/// Forward reference names in fill order.
pub const FORWARD_REFS: [usize; 4] = [LAST_FRAME, LAST2_FRAME, LAST3_FRAME, GOLDEN_FRAME];

/// Backward reference names in fill order.
pub const BACKWARD_REFS: [usize; 3] = [BWDREF_FRAME, ALTREF_FRAME, ALTREF2_FRAME];

/// The eight AV1 reference slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dpb {
    pub slots: [Option<DpbFrame>; NUM_REF_FRAMES],
}

impl Dpb {
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, slot: usize) -> Option<&DpbFrame> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Occupied slots with their index.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &DpbFrame)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i, f)))
    }

    /// One entry per distinct frame, at the lowest slot holding it.
    pub fn unique_frames(&self) -> Vec<(usize, DpbFrame)> {
        let mut out: Vec<(usize, DpbFrame)> = Vec::with_capacity(NUM_REF_FRAMES);
        for (slot, frame) in self.occupied() {
            if !out.iter().any(|(_, f)| f.same_frame(frame)) {
                out.push((slot, *frame));
            }
        }
        out
    }

    pub fn num_unique(&self) -> usize {
        self.unique_frames().len()
    }

    /// Bit mask of the slots holding `frame`.
    pub fn slots_of(&self, frame: &DpbFrame) -> u8 {
        self.occupied()
            .filter(|(_, f)| f.same_frame(frame))
            .fold(0u8, |mask, (slot, _)| mask | (1 << slot))
    }

    /// First empty slot, or the first slot repeating a frame already held at
    /// a lower index.
    pub fn first_free_or_duplicate_slot(&self) -> Option<usize> {
        if let Some(empty) = self.slots.iter().position(Option::is_none) {
            return Some(empty);
        }
        (0..NUM_REF_FRAMES).find(|&i| {
            let Some(frame) = &self.slots[i] else {
                return false;
            };
            self.slots[..i].iter().flatten().any(|f| f.same_frame(frame))
        })
    }

    pub fn find_display_order(&self, display_order: u32) -> Option<(usize, &DpbFrame)> {
        self.occupied().find(|(_, f)| f.display_order == display_order)
    }

    /// True when a frame following `display_order` is available as a backward reference.
    pub fn has_later_than(&self, display_order: u32) -> bool {
        self.occupied().any(|(_, f)| f.display_order > display_order)
    }

    /// Copy of this DPB with `frame` written into every slot set in `mask`.
    pub fn refreshed(&self, mask: u8, frame: DpbFrame) -> Dpb {
        let mut out = *self;
        for slot in 0..NUM_REF_FRAMES {
            if mask & (1 << slot) != 0 {
                out.slots[slot] = Some(frame);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.slots = [None; NUM_REF_FRAMES];
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_unique_frames_dedupes() {
        let dpb = dpb_of(&[Some(0), Some(0), Some(4), Some(0), Some(4), None, None, None]);
        let unique = dpb.unique_frames();
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].0, 0);
        assert_eq!(unique[1].0, 2);
        assert_eq!(dpb.slots_of(&frame(0)), 0b0000_1011);
    }

    #[test]
    fn test_first_free_or_duplicate_slot() {
        let dpb = dpb_of(&[Some(0), Some(1), None, None, None, None, None, None]);
        assert_eq!(dpb.first_free_or_duplicate_slot(), Some(2));

        let dpb = dpb_of(&[Some(0), Some(1), Some(2), Some(1), Some(4), Some(5), Some(6), Some(7)]);
        assert_eq!(dpb.first_free_or_duplicate_slot(), Some(3));

        let dpb = dpb_of(&[Some(0), Some(1), Some(2), Some(3), Some(4), Some(5), Some(6), Some(7)]);
        assert_eq!(dpb.first_free_or_duplicate_slot(), None);
    }

    #[test]
    fn test_refreshed() {
        let dpb = dpb_of(&[Some(0); 8]);
        let after = dpb.refreshed(0b1000_0001, frame(8));
        assert_eq!(after.get(0).map(|f| f.display_order), Some(8));
        assert_eq!(after.get(7).map(|f| f.display_order), Some(8));
        assert_eq!(after.get(3).map(|f| f.display_order), Some(0));
        assert!(after.has_later_than(7));
        assert!(!dpb.has_later_than(0));
    }
}
