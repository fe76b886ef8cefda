//! Frame reordering for B-frame support.
//!
//! Frames arrive in display order but must be encoded in a different order
//! because B-frames reference both past and future frames.
//!
//! For example, with three B-frames in a pyramid:
//! - Display order: I(0), B(1), B(2), B(3), P(4), ...
//! - Encode order:  I(0), P(4), B(2), B(1), B(3), ...
//!
//! The anchor must be encoded before the B-frames that reference it, so a
//! B-frame only becomes eligible once a later frame sits in the DPB.

use tracing::trace;

use crate::encoder::dpb::Dpb;
use crate::encoder::task::Task;
use crate::encoder::{BRefType, FrameType};

/// Picks the next task to encode from the reorder window.
pub trait ReorderStrategy: Send {
    /// Returns the index in `window` of the task to encode next.
    ///
    /// `window` holds tagged tasks in display order. `dpb` is the reference
    /// buffer after the last encoded frame. With `flush` set no further input
    /// will arrive, so buffered B-frames must not wait for an anchor.
    fn select(&self, window: &mut [Task], dpb: &Dpb, flush: bool) -> Option<usize>;
}

/// B-frame reorderer supporting flat and pyramid structures.
#[derive(Debug, Clone, Copy)]
pub struct Reorderer {
    b_ref_type: BRefType,
}

impl Reorderer {
    pub fn new(b_ref_type: BRefType) -> Self {
        Self { b_ref_type }
    }

    fn is_pyramid(&self) -> bool {
        self.b_ref_type == BRefType::Pyramid
    }

    /// Assigns levels and encode priorities to a run of B-frames the first
    /// time the run becomes eligible.
    fn assign_pyramid(&self, run: &mut [Task]) {
        let num = run.len() as u32;
        for (i, task) in run.iter_mut().enumerate() {
            if task.b_pyramid_order.is_some() {
                continue;
            }
            let location = bi_frame_location(i as u32, num);
            task.pyramid_level = location.level;
            task.b_pyramid_order = Some(location.order);
            if location.is_ref {
                task.frame_type.insert(FrameType::REF);
            } else {
                task.frame_type.remove(FrameType::REF);
            }
        }
    }
}

impl ReorderStrategy for Reorderer {
    fn select(&self, window: &mut [Task], dpb: &Dpb, flush: bool) -> Option<usize> {
        if window.is_empty() {
            return None;
        }

        // A key frame closes the window: nothing after it may be selected and
        // the frames before it cannot wait for a later anchor.
        let (end, flush) = match window.iter().position(|t| t.frame_type.is_i()) {
            Some(0) => return Some(0),
            Some(idx) => (idx, true),
            None => (window.len(), flush),
        };
        let window = &mut window[..end];

        let run_len = window.iter().take_while(|t| t.frame_type.is_b()).count();
        let eligible = window[..run_len]
            .iter()
            .take_while(|t| dpb.has_later_than(t.display_order))
            .count();

        if eligible > 0 {
            let run = &mut window[..eligible];
            if self.is_pyramid() {
                self.assign_pyramid(run);
                let idx = run
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, t)| t.b_pyramid_order.unwrap_or(u32::MAX))
                    .map(|(i, _)| i);
                trace!(?idx, "pyramid B selected");
                return idx;
            }
            // Only B-frames behind a decoded anchor get here, so the anchor
            // is always coded ahead of its run: I0 B1 B2 B3 P4 codes as
            // I0 P4 B2 B1 B3, a reference B within two frames going first.
            let first = run[0].display_order;
            let idx = run
                .iter()
                .position(|t| t.frame_type.is_ref() && t.display_order - first <= 2)
                .unwrap_or(0);
            return Some(idx);
        }

        if let Some(idx) = window.iter().position(|t| !t.frame_type.is_b()) {
            return Some(idx);
        }

        if flush {
            let last = window.len() - 1;
            let task = &mut window[last];
            task.frame_type = FrameType::P | FrameType::REF;
            task.pyramid_level = 0;
            task.b_pyramid_order = None;
            trace!(display_order = task.display_order, "trailing B promoted to P");
            return Some(last);
        }

        None
    }
}

/// Pyramid placement of one B-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiFrameLocation {
    pub level: u8,
    /// Encode priority inside the run; lower goes first.
    pub order: u32,
    /// Other frames of the run reference this one.
    pub is_ref: bool,
}

/// Locates B-frame `i` of a run of `num` by recursive bisection.
///
/// The midpoint of a range is coded first at the range's level, then each
/// half recurses one level deeper. A frame is a reference when its range
/// holds more than one frame.
pub fn bi_frame_location(i: u32, num: u32) -> BiFrameLocation {
    let (mut begin, mut end) = (0u32, num.max(i + 1));
    let mut level = 1u8;
    let mut before = 0u32;
    loop {
        let is_ref = end - begin > 1;
        let pivot = (begin + end) / 2;
        if i == pivot {
            return BiFrameLocation {
                level,
                order: level as u32 + before,
                is_ref,
            };
        }
        level += 1;
        if i < pivot {
            end = pivot;
        } else {
            before += pivot - begin;
            begin = pivot + 1;
        }
    }
}

/// Hidden-frame bookkeeping for the task chosen at `idx`.
///
/// Returns whether the chosen frame is hidden (an earlier display order is
/// still buffered) and the smallest buffered display order after it.
pub fn buffered_display_info(window: &[Task], idx: usize) -> (bool, Option<u32>) {
    let chosen = window[idx].display_order;
    let others = window
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, t)| t.display_order);
    let mut hidden = false;
    let mut next = None::<u32>;
    for order in others {
        if order < chosen {
            hidden = true;
        } else if order > chosen {
            next = Some(next.map_or(order, |n| n.min(order)));
        }
    }
    (hidden, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::dpb::test_util::dpb_of;

    fn window(types: &[(u32, FrameType)]) -> Vec<Task> {
        types
            .iter()
            .map(|&(order, frame_type)| {
                let mut task = Task::new(order as usize);
                task.display_order = order;
                task.frame_type = frame_type;
                task
            })
            .collect()
    }

    fn encode_order(reorderer: &Reorderer, mut buffered: Vec<Task>) -> Vec<u32> {
        let mut dpb = dpb_of(&[Some(0); 8]);
        let mut out = Vec::new();
        while let Some(idx) = reorderer.select(&mut buffered, &dpb, true) {
            let task = buffered.remove(idx);
            if task.frame_type.is_ref() {
                let slot = dpb.first_free_or_duplicate_slot().unwrap_or(7);
                dpb.slots[slot] = dpb_of(&[Some(task.display_order)]).slots[0];
            }
            out.push(task.display_order);
        }
        out
    }

    #[test]
    fn test_bi_frame_location() {
        // Run of 7: 3 is the root, 1 and 5 next, the rest are leaves.
        let levels: Vec<u8> = (0..7).map(|i| bi_frame_location(i, 7).level).collect();
        assert_eq!(levels, vec![3, 2, 3, 1, 3, 2, 3]);
        assert!(bi_frame_location(3, 7).is_ref);
        assert!(bi_frame_location(1, 7).is_ref);
        assert!(!bi_frame_location(0, 7).is_ref);

        let mut by_order: Vec<u32> = (0..7).collect();
        by_order.sort_by_key(|&i| bi_frame_location(i, 7).order);
        assert_eq!(by_order, vec![3, 1, 0, 2, 5, 4, 6]);
    }

    #[test]
    fn test_anchor_before_b() {
        let reorderer = Reorderer::new(BRefType::Off);
        let b = FrameType::B;
        let p = FrameType::P | FrameType::REF;
        let order = encode_order(&reorderer, window(&[(1, b), (2, b), (3, p), (4, b), (5, b), (6, p)]));
        assert_eq!(order, vec![3, 1, 2, 6, 4, 5]);
    }

    #[test]
    fn test_simple_ref_b_first() {
        let reorderer = Reorderer::new(BRefType::Simple);
        let b = FrameType::B;
        let bref = FrameType::B | FrameType::REF;
        let p = FrameType::P | FrameType::REF;
        let order = encode_order(&reorderer, window(&[(1, b), (2, bref), (3, b), (4, p)]));
        assert_eq!(order, vec![4, 2, 1, 3]);
    }

    #[test]
    fn test_pyramid_order() {
        let reorderer = Reorderer::new(BRefType::Pyramid);
        let b = FrameType::B;
        let p = FrameType::P | FrameType::REF;
        let order = encode_order(
            &reorderer,
            window(&[(1, b), (2, b), (3, b), (4, b), (5, b), (6, b), (7, b), (8, p)]),
        );
        assert_eq!(order, vec![8, 4, 2, 1, 3, 6, 5, 7]);
    }

    #[test]
    fn test_waits_for_anchor() {
        let reorderer = Reorderer::new(BRefType::Off);
        let mut buffered = window(&[(1, FrameType::B), (2, FrameType::B)]);
        let dpb = dpb_of(&[Some(0); 8]);
        assert_eq!(reorderer.select(&mut buffered, &dpb, false), None);

        // Flushing promotes the last buffered B-frame.
        assert_eq!(reorderer.select(&mut buffered, &dpb, true), Some(1));
        assert_eq!(buffered[1].frame_type, FrameType::P | FrameType::REF);
    }

    #[test]
    fn test_key_frame_closes_window() {
        let reorderer = Reorderer::new(BRefType::Off);
        let key = FrameType::I | FrameType::REF | FrameType::IDR;
        let mut buffered = window(&[(1, FrameType::B), (2, FrameType::B), (3, key), (4, FrameType::B)]);
        let dpb = dpb_of(&[Some(0); 8]);
        assert_eq!(reorderer.select(&mut buffered, &dpb, false), Some(1));
        assert!(buffered[1].frame_type.is_p());
    }

    #[test]
    fn test_buffered_display_info() {
        let tasks = window(&[(1, FrameType::B), (3, FrameType::B), (4, FrameType::P)]);
        assert_eq!(buffered_display_info(&tasks, 2), (true, None));
        assert_eq!(buffered_display_info(&tasks, 0), (false, Some(3)));
        assert_eq!(buffered_display_info(&tasks, 1), (true, Some(4)));
    }
}
