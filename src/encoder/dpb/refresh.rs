//! DPB slot refresh decisions.
//!
//! Decides which of the eight slots the current frame overwrites once it is
//! decoded, and derives the post-refresh DPB snapshot.

use tracing::debug;

use super::entry::{DpbFrame, MarkingState};
use super::reference_lists::VC_ANCHOR_PERIOD;
use super::Dpb;
use crate::encoder::task::Task;
use crate::encoder::{EncodeConfig, FrameType, NUM_REF_FRAMES};
use crate::error::{EncodeError, Result};

/// Every slot.
const ALL_SLOTS: u8 = 0xFF;

/// Limits applied while choosing slots to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshParams {
    /// Distinct frames the DPB may hold.
    pub num_ref_frame: usize,
    /// Use the conference heuristic for flat low-delay streams.
    pub conference_low_delay: bool,
    /// Base-layer frames a P-frame keeps before the oldest one is evicted
    /// ahead of higher pyramid levels.
    pub num_ref_p: usize,
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self {
            num_ref_frame: 4,
            conference_low_delay: false,
            num_ref_p: 3,
        }
    }
}

impl RefreshParams {
    pub fn from_config(config: &EncodeConfig) -> Self {
        let num_ref_frame = if config.num_ref_frame == 0 {
            Self::default().num_ref_frame
        } else {
            config.num_ref_frame as usize
        };
        let num_ref_p = if config.num_ref_active_p == 0 {
            Self::default().num_ref_p
        } else {
            config.num_ref_active_p as usize
        };
        Self {
            num_ref_frame: num_ref_frame.clamp(1, NUM_REF_FRAMES),
            conference_low_delay: config.is_conference_low_delay(),
            num_ref_p: num_ref_p.clamp(1, NUM_REF_FRAMES),
        }
    }
}

/// DPB entry describing the frame coded by `task`.
pub fn dpb_frame_of(task: &Task) -> DpbFrame {
    let (marking, long_term_idx) = match task.long_term_idx {
        Some(idx) => (MarkingState::LongTerm, idx),
        None => (MarkingState::ShortTerm, 0),
    };
    DpbFrame {
        display_order: task.display_order,
        display_order_in_gop: task.display_order_in_gop,
        encoded_order: task.encoded_order,
        frame_type: task.frame_type,
        pyramid_level: task.pyramid_level,
        temporal_id: task.temporal_id,
        marking,
        long_term_idx,
        rejected: false,
        rec: task.rec.unwrap_or_default(),
    }
}

/// Sets `task.refresh_frame_flags` and `task.dpb.after`.
///
/// A reference frame that ends up refreshing no slot loses its REF flag.
/// A hidden frame must land in the DPB to be shown later, so failing to place
/// one is an error.
pub fn set_task_dpb_refresh(task: &mut Task, params: &RefreshParams) -> Result<()> {
    let dpb = task.dpb.active;

    let mut mask = if task.frame_type.is_i() {
        ALL_SLOTS
    } else if !task.frame_type.is_ref() {
        0
    } else {
        let rejected = rejected_slots(&dpb);
        if rejected != 0 {
            rejected
        } else if params.conference_low_delay {
            vc_low_delay_refresh(&dpb)
        } else {
            default_refresh(&dpb, task, params)
        }
    };

    if mask != 0 && mask != ALL_SLOTS && task.use_ltr_as_ref {
        mask |= superseded_by_ltr(&dpb, task.display_order);
    }

    if mask == 0 {
        if task.is_hidden {
            return Err(EncodeError::InvalidDpbState(format!(
                "hidden frame {} has no DPB slot to refresh",
                task.display_order
            )));
        }
        task.frame_type.remove(FrameType::REF);
    } else if task.rec.is_none() {
        return Err(EncodeError::InvalidDpbState(format!(
            "frame {} refreshes the DPB without a reconstructed surface",
            task.display_order
        )));
    }

    task.refresh_frame_flags = mask;
    task.dpb.after = dpb.refreshed(mask, dpb_frame_of(task));

    debug!(
        display_order = task.display_order,
        refresh = format_args!("{mask:#010b}"),
        "DPB refresh"
    );
    Ok(())
}

fn rejected_slots(dpb: &Dpb) -> u8 {
    dpb.occupied()
        .filter(|(_, f)| f.rejected)
        .fold(0, |mask, (slot, _)| mask | (1 << slot))
}

/// Frames that must survive this refresh: long-term references and frames
/// decoded ahead of `display_order` that are still waiting to be shown.
fn is_protected(frame: &DpbFrame, display_order: u32) -> bool {
    frame.is_long_term() || frame.display_order > display_order
}

fn default_refresh(dpb: &Dpb, task: &Task, params: &RefreshParams) -> u8 {
    if dpb.num_unique() < params.num_ref_frame {
        if let Some(slot) = dpb.first_free_or_duplicate_slot() {
            return 1 << slot;
        }
    }
    find_oldest_lowest_priority_str(dpb, task, params)
        .map(|frame| dpb.slots_of(&frame))
        .unwrap_or(0)
}

/// Short-term frame to evict: highest pyramid level first, then the oldest.
/// Frames of a lower temporal layer than the current one are never evicted.
///
/// A P-frame holding more base-layer frames than it can reference evicts the
/// oldest of those instead.
fn find_oldest_lowest_priority_str(
    dpb: &Dpb,
    task: &Task,
    params: &RefreshParams,
) -> Option<DpbFrame> {
    let candidates: Vec<DpbFrame> = dpb
        .unique_frames()
        .into_iter()
        .map(|(_, f)| f)
        .filter(|f| !is_protected(f, task.display_order))
        .filter(|f| f.temporal_id >= task.temporal_id)
        .collect();

    if task.frame_type.is_p() {
        let base = candidates.iter().filter(|f| f.pyramid_level == 0);
        if base.clone().count() > params.num_ref_p {
            return base.min_by_key(|f| f.display_order).copied();
        }
    }
    candidates
        .into_iter()
        .min_by_key(|f| (std::cmp::Reverse(f.pyramid_level), f.display_order))
}

/// Slot choice for flat low-delay conferencing: duplicates, then stale
/// anchors, then the oldest ordinary frame, then the oldest every-fourth frame.
fn vc_low_delay_refresh(dpb: &Dpb) -> u8 {
    if let Some(slot) = dpb.first_free_or_duplicate_slot() {
        return 1 << slot;
    }

    let frames: Vec<DpbFrame> = dpb
        .unique_frames()
        .into_iter()
        .map(|(_, f)| f)
        .filter(|f| !f.is_long_term())
        .collect();
    let is_anchor = |f: &DpbFrame| f.display_order % VC_ANCHOR_PERIOD == 0;
    let newest_anchor = frames
        .iter()
        .filter(|f| is_anchor(f))
        .map(|f| f.display_order)
        .max();

    let stale_anchor = frames
        .iter()
        .filter(|f| is_anchor(f) && Some(f.display_order) != newest_anchor)
        .min_by_key(|f| f.display_order);
    let ordinary = frames
        .iter()
        .filter(|f| !is_anchor(f) && f.display_order % 4 != 0)
        .min_by_key(|f| f.display_order);
    let fourth = frames
        .iter()
        .filter(|f| !is_anchor(f) && f.display_order % 4 == 0)
        .min_by_key(|f| f.display_order);
    let oldest = frames.iter().min_by_key(|f| f.display_order);

    stale_anchor
        .or(ordinary)
        .or(fourth)
        .or(oldest)
        .map(|f| dpb.slots_of(f))
        .unwrap_or(0)
}

/// Short-term slots older than the current frame, dropped once a long-term
/// reference is in use.
fn superseded_by_ltr(dpb: &Dpb, display_order: u32) -> u8 {
    dpb.occupied()
        .filter(|(_, f)| !f.is_long_term() && f.display_order < display_order)
        .fold(0, |mask, (slot, _)| mask | (1 << slot))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::dpb_of;
    use super::super::RecHandle;
    use super::*;

    fn task(order: u32, frame_type: FrameType, dpb: Dpb) -> Task {
        let mut task = Task::new(0);
        task.display_order = order;
        task.display_order_in_gop = order;
        task.encoded_order = order;
        task.frame_type = frame_type;
        task.dpb.active = dpb;
        task.rec = Some(RecHandle(100));
        task
    }

    #[test]
    fn test_key_frame_refreshes_all() {
        let mut t = task(0, FrameType::I | FrameType::REF, Dpb::default());
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0xFF);
        assert_eq!(t.dpb.after.num_unique(), 1);
    }

    #[test]
    fn test_fills_duplicate_slot() {
        let dpb = dpb_of(&[Some(0); 8]);
        let mut t = task(1, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);
        assert_eq!(t.dpb.after.num_unique(), 2);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let dpb = dpb_of(&[Some(0), Some(1), Some(2), Some(3), Some(0), Some(0), Some(0), Some(0)]);
        let mut t = task(4, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b1111_0001);
        assert!(t.dpb.after.find_display_order(0).is_none());
    }

    #[test]
    fn test_evicts_highest_level_first() {
        let mut dpb = dpb_of(&[Some(0), Some(2), Some(4), Some(8), None, None, None, None]);
        if let Some(f) = dpb.slots[1].as_mut() {
            f.pyramid_level = 2;
        }
        if let Some(f) = dpb.slots[2].as_mut() {
            f.pyramid_level = 1;
        }
        let mut t = task(16, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);
    }

    #[test]
    fn test_p_frame_keeps_base_layer_below_threshold() {
        let mut dpb = dpb_of(&[Some(0), Some(2), None, None, None, None, None, None]);
        if let Some(f) = dpb.slots[1].as_mut() {
            f.pyramid_level = 1;
        }
        let params = RefreshParams {
            num_ref_frame: 2,
            num_ref_p: 1,
            ..Default::default()
        };
        let mut t = task(4, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);
        assert!(t.dpb.after.find_display_order(0).is_some());
    }

    #[test]
    fn test_p_frame_evicts_surplus_base_layer() {
        let mut dpb = dpb_of(&[Some(0), Some(4), Some(2), None, None, None, None, None]);
        if let Some(f) = dpb.slots[2].as_mut() {
            f.pyramid_level = 1;
        }
        let params = RefreshParams {
            num_ref_frame: 3,
            num_ref_p: 1,
            ..Default::default()
        };
        let mut t = task(8, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0001);
        assert!(t.dpb.after.find_display_order(2).is_some());

        // A B-frame still evicts the highest level.
        let mut t = task(3, FrameType::B | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0100);
    }

    #[test]
    fn test_protects_future_and_long_term() {
        let mut dpb = dpb_of(&[Some(0), Some(8), Some(4), Some(2), None, None, None, None]);
        if let Some(f) = dpb.slots[0].as_mut() {
            f.mark_long_term(0);
        }
        let mut t = task(3, FrameType::B | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_1000);
    }

    #[test]
    fn test_rejected_slots_refreshed_first() {
        let mut dpb = dpb_of(&[Some(0), Some(1), Some(2), None, None, None, None, None]);
        if let Some(f) = dpb.slots[1].as_mut() {
            f.rejected = true;
        }
        let mut t = task(3, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);
    }

    #[test]
    fn test_non_ref_frame() {
        let dpb = dpb_of(&[Some(0); 8]);
        let mut t = task(1, FrameType::B, dpb);
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0);
        assert_eq!(t.dpb.after, dpb);
    }

    #[test]
    fn test_no_slot_clears_ref_flag() {
        let mut dpb = dpb_of(&[Some(0), Some(8), Some(8), Some(8), Some(8), Some(8), Some(8), Some(8)]);
        if let Some(f) = dpb.slots[0].as_mut() {
            f.mark_long_term(0);
        }
        let params = RefreshParams {
            num_ref_frame: 2,
            ..Default::default()
        };
        let mut t = task(4, FrameType::B | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0);
        assert!(!t.frame_type.is_ref());
    }

    #[test]
    fn test_hidden_frame_without_slot_fails() {
        let mut dpb = dpb_of(&[Some(0), Some(8), Some(8), Some(8), Some(8), Some(8), Some(8), Some(8)]);
        if let Some(f) = dpb.slots[0].as_mut() {
            f.mark_long_term(0);
        }
        let params = RefreshParams {
            num_ref_frame: 2,
            ..Default::default()
        };
        let mut t = task(4, FrameType::B | FrameType::REF, dpb);
        t.is_hidden = true;
        assert!(matches!(
            set_task_dpb_refresh(&mut t, &params),
            Err(EncodeError::InvalidDpbState(_))
        ));
    }

    #[test]
    fn test_vc_prefers_stale_anchor() {
        let dpb = dpb_of(&[Some(0), Some(30), Some(31), Some(32), Some(33), Some(34), Some(35), Some(36)]);
        let params = RefreshParams {
            num_ref_frame: 8,
            conference_low_delay: true,
            ..Default::default()
        };
        let mut t = task(37, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0001);

        let dpb = dpb_of(&[Some(30), Some(31), Some(32), Some(33), Some(34), Some(35), Some(36), Some(37)]);
        let mut t = task(38, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);

        let dpb = dpb_of(&[Some(30), Some(32), Some(36), Some(40), Some(44), Some(48), Some(52), Some(56)]);
        let mut t = task(57, FrameType::P | FrameType::REF, dpb);
        set_task_dpb_refresh(&mut t, &params).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_0010);
    }

    #[test]
    fn test_ltr_supersedes_older_strs() {
        let mut dpb = dpb_of(&[Some(0), Some(5), Some(6), Some(7), None, None, None, None]);
        if let Some(f) = dpb.slots[0].as_mut() {
            f.mark_long_term(0);
        }
        let mut t = task(8, FrameType::P | FrameType::REF, dpb);
        t.use_ltr_as_ref = true;
        set_task_dpb_refresh(&mut t, &RefreshParams::default()).unwrap();
        assert_eq!(t.refresh_frame_flags, 0b0000_1110);
        assert!(t.dpb.after.get(0).is_some_and(DpbFrame::is_long_term));
    }
}
