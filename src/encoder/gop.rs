//! GOP (Group of Pictures) structure for AV1 encoding.
//!
//! Tags frames in display order with their type, GOP position and temporal
//! layer before they enter the reorder window. Every I-frame is coded as an
//! AV1 key frame, so order hints restart at each one.

use crate::encoder::{BRefType, EncodeConfig, FrameType, INFINITE_GOP};

/// Position of one input frame in the GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopPosition {
    /// Overall frame index in the sequence.
    pub display_order: u32,
    /// Frames since the last key frame (order hint source).
    pub display_order_in_gop: u32,
    /// Frame type flags.
    pub frame_type: FrameType,
    /// Pyramid level. B-pyramid levels are reassigned by the reorderer.
    pub pyramid_level: u8,
    /// Temporal layer ID.
    pub temporal_id: u8,
}

/// GOP structure manager.
///
/// Decides frame types from the distance to the last IDR frame, and tracks
/// the key frame that the current order hints are relative to.
#[derive(Debug, Clone)]
pub struct GopStructure {
    /// Frames between I-frames. `INFINITE_GOP` disables periodic I-frames.
    gop_pic_size: u32,
    /// Distance between anchor frames.
    gop_ref_dist: u32,
    /// I-frames between IDR frames, minus one.
    idr_interval: u32,
    b_ref_type: BRefType,
    /// Temporal layer scales, e.g. `[1, 2, 4]`.
    temporal_scales: Vec<u32>,
    /// Next display order.
    frame_index: u32,
    /// Display order of the last IDR frame.
    last_idr: u32,
    /// Display order of the last key frame.
    last_key: u32,
    /// Flag to force the next frame to be an IDR.
    force_idr: bool,
}

impl GopStructure {
    /// Create a GOP structure from a resolved configuration.
    pub fn new(config: &EncodeConfig) -> Self {
        Self {
            gop_pic_size: config.gop_pic_size.max(1),
            gop_ref_dist: config.gop_ref_dist.max(1),
            idr_interval: config.idr_interval,
            b_ref_type: config.b_ref_type,
            temporal_scales: config.temporal_layers.clone(),
            frame_index: 0,
            last_idr: 0,
            last_key: 0,
            force_idr: false,
        }
    }

    /// Frame type of the frame `order` frames after the last IDR.
    pub fn frame_type(&self, order: u32) -> FrameType {
        let infinite = self.gop_pic_size >= INFINITE_GOP;
        let idr_distance = if infinite {
            0
        } else {
            self.gop_pic_size.saturating_mul(self.idr_interval + 1)
        };

        if order == 0 || (idr_distance != 0 && order % idr_distance == 0) {
            return FrameType::I | FrameType::REF | FrameType::IDR;
        }

        let in_gop = if infinite {
            order
        } else {
            order % self.gop_pic_size
        };
        if in_gop == 0 {
            return FrameType::I | FrameType::REF;
        }
        if in_gop % self.gop_ref_dist == 0 {
            return FrameType::P | FrameType::REF;
        }
        // The next frame starts a new GOP, so nothing after this one can be
        // a backward reference.
        if !infinite && in_gop + 1 == self.gop_pic_size {
            return FrameType::P | FrameType::REF;
        }

        let offset = in_gop % self.gop_ref_dist;
        if self.b_ref_type == BRefType::Simple && offset == self.gop_ref_dist / 2 {
            FrameType::B | FrameType::REF
        } else {
            FrameType::B
        }
    }

    /// Temporal layer of a frame `order_in_gop` frames after the last key frame.
    pub fn temporal_id(&self, order_in_gop: u32) -> u8 {
        let Some(&top) = self.temporal_scales.last() else {
            return 0;
        };
        self.temporal_scales
            .iter()
            .position(|&scale| scale != 0 && order_in_gop % (top / scale).max(1) == 0)
            .unwrap_or(self.temporal_scales.len() - 1) as u8
    }

    /// Tags the next input frame.
    ///
    /// `forced` comes from the application or from look-ahead and overrides
    /// the regular pattern for this frame only.
    pub fn next_frame(&mut self, forced: Option<FrameType>) -> GopPosition {
        let display_order = self.frame_index;
        self.frame_index += 1;

        let since_idr = display_order - self.last_idr;
        let mut frame_type = match forced {
            Some(t) if t.is_idr() => FrameType::I | FrameType::REF | FrameType::IDR,
            Some(t) if t.is_i() => FrameType::I | FrameType::REF,
            Some(t) if t.is_p() => FrameType::P | FrameType::REF,
            Some(t) if t.is_b() => t & (FrameType::B | FrameType::REF),
            _ => self.frame_type(since_idr),
        };
        if self.force_idr {
            frame_type = FrameType::I | FrameType::REF | FrameType::IDR;
            self.force_idr = false;
        }

        if frame_type.is_idr() {
            self.last_idr = display_order;
        }
        if frame_type.is_i() {
            self.last_key = display_order;
        }

        let display_order_in_gop = display_order - self.last_key;
        let pyramid_level = if frame_type.is_b() {
            if frame_type.is_ref() || self.b_ref_type != BRefType::Simple {
                1
            } else {
                2
            }
        } else {
            0
        };

        GopPosition {
            display_order,
            display_order_in_gop,
            frame_type,
            pyramid_level,
            temporal_id: self.temporal_id(display_order_in_gop),
        }
    }

    /// Get total frames tagged.
    pub fn total_frames(&self) -> u32 {
        self.frame_index
    }

    /// Reset the GOP structure.
    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.last_idr = 0;
        self.last_key = 0;
        self.force_idr = false;
    }

    /// Request that the next frame be an IDR frame.
    pub fn request_idr(&mut self) {
        self.force_idr = true;
    }
}
