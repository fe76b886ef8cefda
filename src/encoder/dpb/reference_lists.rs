//! Reference list construction for LAST..ALTREF.
//!
//! Candidates come from the task's active DPB. Forward candidates precede the
//! current frame in display order, backward candidates follow it. Both sets are
//! restricted to frames of the same or a lower pyramid level and temporal
//! layer, then sorted nearest first and mapped onto the AV1 reference names.

use tracing::debug;

use super::entry::DpbFrame;
use super::{Dpb, BACKWARD_REFS, FORWARD_REFS, IDX_INVALID};
use crate::encoder::task::Task;
use crate::encoder::{EncodeConfig, REFS_PER_FRAME};

/// Period of the anchor frames kept by the conference reference heuristics.
pub const VC_ANCHOR_PERIOD: u32 = 30;

/// Limits applied while building a reference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefListParams {
    /// Forward references used by P-frames.
    pub num_ref_active_p: usize,
    /// Forward references used by B-frames.
    pub num_ref_active_bl0: usize,
    /// Backward references used by B-frames.
    pub num_ref_active_bl1: usize,
    /// P-frames also fill the backward names with forward references.
    pub low_delay_b: bool,
    /// Move periodic anchors forward in the list (low-delay conferencing).
    pub conference_low_delay: bool,
    /// Look-ahead manages long-term references.
    pub enc_tools: bool,
}

impl Default for RefListParams {
    fn default() -> Self {
        Self {
            num_ref_active_p: 3,
            num_ref_active_bl0: 2,
            num_ref_active_bl1: 1,
            low_delay_b: false,
            conference_low_delay: false,
            enc_tools: false,
        }
    }
}

impl RefListParams {
    pub fn from_config(config: &EncodeConfig) -> Self {
        let or_default = |v: u32, d: usize| if v == 0 { d } else { v as usize };
        let defaults = Self::default();
        Self {
            num_ref_active_p: or_default(config.num_ref_active_p, defaults.num_ref_active_p),
            num_ref_active_bl0: or_default(config.num_ref_active_bl0, defaults.num_ref_active_bl0),
            num_ref_active_bl1: or_default(config.num_ref_active_bl1, defaults.num_ref_active_bl1),
            low_delay_b: config.low_delay_b,
            conference_low_delay: config.is_conference_low_delay(),
            enc_tools: config.enc_tools,
        }
    }
}

/// A candidate reference: the lowest slot holding a frame.
type Candidate = (usize, DpbFrame);

/// Builds `task.ref_list` from `task.dpb.active`.
///
/// Intra frames get an all-invalid list. Inter frames always receive at least
/// one forward reference when the DPB holds any frame.
pub fn set_task_ref_list(task: &mut Task, params: &RefListParams) {
    task.ref_list = [IDX_INVALID; REFS_PER_FRAME];
    task.use_ltr_as_ref = false;

    if task.frame_type.is_i() {
        return;
    }

    let dpb = task.dpb.active;
    let ctrl = task.ctrl.ref_list.as_ref();
    let current = task.display_order;

    let mut fwd: Vec<Candidate> = Vec::new();
    let mut bwd: Vec<Candidate> = Vec::new();
    let mut ltr: Vec<Candidate> = Vec::new();

    for (slot, frame) in dpb.unique_frames() {
        if frame.display_order == current {
            continue;
        }
        if frame.is_long_term() {
            let preferred = ctrl.map_or(true, |c| {
                c.preferred.is_empty()
                    || c.preferred.iter().any(|p| p.frame_order == frame.display_order)
            });
            if preferred && !frame.rejected {
                ltr.push((slot, frame));
            }
            continue;
        }
        if frame.pyramid_level > task.pyramid_level || frame.temporal_id > task.temporal_id {
            continue;
        }
        if frame.display_order < current {
            fwd.push((slot, frame));
        } else {
            bwd.push((slot, frame));
        }
    }

    fwd.sort_by(|a, b| b.1.display_order.cmp(&a.1.display_order));
    bwd.sort_by_key(|c| c.1.display_order);

    remove_rejected(&mut fwd, true);
    remove_rejected(&mut bwd, false);

    if params.conference_low_delay {
        adjust_vc_ref_order(&mut fwd);
    }

    let is_b = task.frame_type.is_b();
    let mut max_fwd = if is_b {
        params.num_ref_active_bl0
    } else {
        params.num_ref_active_p
    };
    let mut max_bwd = params.num_ref_active_bl1;
    if let Some(c) = ctrl {
        if c.num_ref_idx_l0_active > 0 {
            max_fwd = max_fwd.min(c.num_ref_idx_l0_active as usize);
        }
        if c.num_ref_idx_l1_active > 0 {
            max_bwd = max_bwd.min(c.num_ref_idx_l1_active as usize);
        }
    }
    let max_fwd = max_fwd.clamp(1, FORWARD_REFS.len());
    let max_bwd = max_bwd.min(BACKWARD_REFS.len());

    if !ltr.is_empty() {
        insert_ltr(&mut fwd, &ltr, max_fwd);
        task.use_ltr_as_ref = true;
    }

    if params.enc_tools && task.frame_type.is_p() {
        if let Some(pos) = fwd.iter().position(|c| c.1.is_long_term()) {
            if pos > 1 {
                let ltr = fwd.remove(pos);
                fwd.insert(1, ltr);
            }
        }
    }

    if fwd.is_empty() {
        if let Some(nearest) = nearest_any(&dpb, current) {
            fwd.push(nearest);
        }
    }

    fwd.truncate(max_fwd);
    for (name, (slot, _)) in FORWARD_REFS.iter().zip(&fwd) {
        task.ref_list[*name] = *slot as u8;
    }

    if is_b {
        for (name, (slot, _)) in BACKWARD_REFS.iter().zip(bwd.iter().take(max_bwd)) {
            task.ref_list[*name] = *slot as u8;
        }
    } else if params.low_delay_b {
        for (name, (slot, _)) in BACKWARD_REFS.iter().zip(fwd.iter().take(max_bwd.max(1))) {
            task.ref_list[*name] = *slot as u8;
        }
    }

    debug!(
        display_order = current,
        refs = ?task.ref_list,
        use_ltr = task.use_ltr_as_ref,
        "reference list"
    );
}

/// Strips rejected frames. When `keep_one` is set and every candidate was
/// rejected, the nearest one stays.
fn remove_rejected(list: &mut Vec<Candidate>, keep_one: bool) {
    if !list.iter().any(|c| c.1.rejected) {
        return;
    }
    let nearest = list.first().copied();
    list.retain(|c| !c.1.rejected);
    if keep_one && list.is_empty() {
        list.extend(nearest);
    }
}

/// Moves the newest periodic anchor to the second forward position.
fn adjust_vc_ref_order(fwd: &mut Vec<Candidate>) {
    if fwd.len() <= 2 {
        return;
    }
    if let Some(pos) = fwd
        .iter()
        .position(|c| c.1.display_order % VC_ANCHOR_PERIOD == 0)
    {
        if pos > 1 {
            let anchor = fwd.remove(pos);
            fwd.insert(1, anchor);
        }
    }
}

/// Merges long-term references into the forward list.
///
/// With fewer than two short-term references the long-term ones are appended.
/// Otherwise the farthest short-term references make room and the long-term
/// ones are placed just before the last short-term entry.
fn insert_ltr(fwd: &mut Vec<Candidate>, ltr: &[Candidate], max_fwd: usize) {
    if fwd.len() < 2 {
        fwd.extend_from_slice(ltr);
        return;
    }
    let keep = max_fwd.saturating_sub(ltr.len()).max(1).min(fwd.len());
    fwd.truncate(keep);
    let pos = fwd.len().saturating_sub(1).max(1).min(fwd.len());
    for (i, c) in ltr.iter().enumerate() {
        fwd.insert(pos + i, *c);
    }
}

/// The frame closest to `display_order`, preferring earlier frames.
fn nearest_any(dpb: &Dpb, display_order: u32) -> Option<Candidate> {
    dpb.unique_frames()
        .into_iter()
        .filter(|(_, f)| f.display_order != display_order)
        .min_by_key(|(_, f)| {
            let later = f.display_order > display_order;
            (f.display_order.abs_diff(display_order), later)
        })
}
