//! Uncompressed frame header syntax.
//!
//! The writer records the bit positions of the fields rate control may have
//! to rewrite after the device ran (see [`BitOffsets`]).

use crate::encoder::bitwriter::BitstreamWriter;
use crate::encoder::{NUM_REF_FRAMES, REFS_PER_FRAME};

use super::sequence::{SequenceHeader, SELECT_INTEGER_MV, SELECT_SCREEN_CONTENT_TOOLS};

/// `primary_ref_frame` value meaning "no CDF/segmentation inheritance".
pub const PRIMARY_REF_NONE: u8 = 7;

/// Every slot refreshed.
pub const ALL_REF_FRAMES_MASK: u8 = 0xFF;

const SEG_FEATURE_BITS: [u8; 8] = [8, 6, 6, 6, 6, 3, 0, 0];
const SEG_FEATURE_SIGNED: [bool; 8] = [true, true, true, true, true, false, false, false];

/// AV1 `frame_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Av1FrameType {
    #[default]
    Key = 0,
    Inter = 1,
    IntraOnly = 2,
    Switch = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileInfo {
    pub tile_cols_log2: u8,
    pub tile_rows_log2: u8,
    pub min_log2_tile_cols: u8,
    pub max_log2_tile_cols: u8,
    pub min_log2_tile_rows: u8,
    pub max_log2_tile_rows: u8,
    pub context_update_tile_id: u32,
    pub tile_size_bytes_minus_1: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuantizationParams {
    pub base_q_idx: u8,
    pub delta_q_y_dc: i8,
    pub diff_uv_delta: bool,
    pub delta_q_u_dc: i8,
    pub delta_q_u_ac: i8,
    pub delta_q_v_dc: i8,
    pub delta_q_v_ac: i8,
    pub using_qmatrix: bool,
    pub qm_y: u8,
    pub qm_u: u8,
    pub qm_v: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub update_map: bool,
    pub temporal_update: bool,
    pub update_data: bool,
    pub feature_enabled: [[bool; 8]; 8],
    pub feature_data: [[i16; 8]; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// `[y_vertical, y_horizontal, u, v]`.
    pub level: [u8; 4],
    pub sharpness: u8,
    pub delta_enabled: bool,
    pub delta_update: bool,
    pub ref_deltas: [i8; NUM_REF_FRAMES],
    pub mode_deltas: [i8; 2],
    pub update_ref_delta: [bool; NUM_REF_FRAMES],
    pub update_mode_delta: [bool; 2],
}

impl Default for LoopFilterParams {
    fn default() -> Self {
        Self {
            level: [0; 4],
            sharpness: 0,
            delta_enabled: true,
            delta_update: true,
            ref_deltas: [1, 0, 0, 0, -1, 0, -1, -1],
            mode_deltas: [0, 0],
            update_ref_delta: [false; NUM_REF_FRAMES],
            update_mode_delta: [false; 2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CdefParams {
    pub damping_minus_3: u8,
    pub bits: u8,
    pub y_pri_strength: [u8; 8],
    pub y_sec_strength: [u8; 8],
    pub uv_pri_strength: [u8; 8],
    pub uv_sec_strength: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopRestorationParams {
    pub frame_restoration_type: [u8; 3],
    pub lr_unit_shift: u8,
    pub lr_unit_extra_shift: u8,
    pub lr_uv_shift: u8,
}

/// Bit positions of patchable fields, relative to the packed header buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitOffsets {
    pub q_index: u32,
    pub segmentation: u32,
    pub loop_filter: u32,
    pub cdef: u32,
    pub loop_restoration: u32,
    /// Bits of the uncompressed header, excluding the OBU header and size.
    pub frame_header_size: u32,
    /// Byte offset of the fixed-width OBU size field (OBU_FRAME only).
    pub obu_size_byte_offset: Option<u32>,
}

/// Uncompressed frame header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub show_existing_frame: bool,
    pub frame_to_show_map_idx: u8,
    pub frame_type: Av1FrameType,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub error_resilient_mode: bool,
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: bool,
    pub force_integer_mv: bool,
    pub frame_size_override_flag: bool,
    pub order_hint: u32,
    pub primary_ref_frame: u8,
    pub refresh_frame_flags: u8,
    pub ref_order_hint: [u32; NUM_REF_FRAMES],
    pub frame_width: u32,
    pub frame_height: u32,
    pub render_and_frame_size_different: bool,
    pub render_width: u32,
    pub render_height: u32,
    pub allow_intrabc: bool,
    pub frame_refs_short_signaling: bool,
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub allow_high_precision_mv: bool,
    pub is_filter_switchable: bool,
    pub interpolation_filter: u8,
    pub is_motion_mode_switchable: bool,
    pub use_ref_frame_mvs: bool,
    pub disable_frame_end_update_cdf: bool,
    pub tile_info: TileInfo,
    pub quantization: QuantizationParams,
    pub segmentation: SegmentationParams,
    pub delta_q_present: bool,
    pub delta_q_res: u8,
    pub delta_lf_present: bool,
    pub delta_lf_res: u8,
    pub delta_lf_multi: bool,
    pub loop_filter: LoopFilterParams,
    pub cdef: CdefParams,
    pub loop_restoration: LoopRestorationParams,
    pub tx_mode_select: bool,
    pub reference_select: bool,
    pub skip_mode_present: bool,
    pub allow_warped_motion: bool,
    pub reduced_tx_set: bool,
}

impl FrameHeader {
    pub fn is_intra(&self) -> bool {
        matches!(self.frame_type, Av1FrameType::Key | Av1FrameType::IntraOnly)
    }

    /// True when every segment codes with quantizer index 0 and no deltas.
    pub fn is_coded_lossless(&self) -> bool {
        let q = &self.quantization;
        let deltas_zero = q.delta_q_y_dc == 0
            && q.delta_q_u_dc == 0
            && q.delta_q_u_ac == 0
            && q.delta_q_v_dc == 0
            && q.delta_q_v_ac == 0;
        if !deltas_zero {
            return false;
        }
        if !self.segmentation.enabled {
            return q.base_q_idx == 0;
        }
        (0..8).all(|seg| {
            let delta = if self.segmentation.feature_enabled[seg][0] {
                self.segmentation.feature_data[seg][0] as i32
            } else {
                0
            };
            (q.base_q_idx as i32 + delta).clamp(0, 255) == 0
        })
    }

    /// Writes `uncompressed_header()`, recording patchable field offsets.
    pub(crate) fn write(&self, sh: &SequenceHeader, w: &mut BitstreamWriter, offsets: &mut BitOffsets) {
        let start = w.bit_offset();

        if self.show_existing_frame {
            w.put_bit(true);
            w.put_bits(self.frame_to_show_map_idx as u64, 3);
            offsets.frame_header_size = w.bit_offset() - start;
            return;
        }

        w.put_bit(false); // show_existing_frame
        w.put_bits(self.frame_type as u64, 2);
        w.put_bit(self.show_frame);
        if !self.show_frame {
            w.put_bit(self.showable_frame);
        }

        let error_resilient = self.frame_type == Av1FrameType::Switch
            || (self.frame_type == Av1FrameType::Key && self.show_frame)
            || self.error_resilient_mode;
        if !(self.frame_type == Av1FrameType::Switch
            || (self.frame_type == Av1FrameType::Key && self.show_frame))
        {
            w.put_bit(self.error_resilient_mode);
        }

        w.put_bit(self.disable_cdf_update);

        let allow_sct = if sh.seq_force_screen_content_tools == SELECT_SCREEN_CONTENT_TOOLS {
            w.put_bit(self.allow_screen_content_tools);
            self.allow_screen_content_tools
        } else {
            sh.seq_force_screen_content_tools != 0
        };
        let mut force_integer_mv = false;
        if allow_sct {
            if sh.seq_force_integer_mv == SELECT_INTEGER_MV {
                w.put_bit(self.force_integer_mv);
                force_integer_mv = self.force_integer_mv;
            } else {
                force_integer_mv = sh.seq_force_integer_mv != 0;
            }
        }
        if self.is_intra() {
            force_integer_mv = true;
        }

        if self.frame_type != Av1FrameType::Switch && !sh.reduced_still_picture_header {
            w.put_bit(self.frame_size_override_flag);
        }

        let hint_bits = sh.order_hint_bits();
        if hint_bits > 0 {
            w.put_bits((self.order_hint & ((1 << hint_bits) - 1)) as u64, hint_bits);
        }

        if !(self.is_intra() || error_resilient) {
            w.put_bits(self.primary_ref_frame as u64, 3);
        }

        if !(self.frame_type == Av1FrameType::Switch
            || (self.frame_type == Av1FrameType::Key && self.show_frame))
        {
            w.put_bits(self.refresh_frame_flags as u64, 8);
        }

        if (!self.is_intra() || self.refresh_frame_flags != ALL_REF_FRAMES_MASK)
            && error_resilient
            && sh.enable_order_hint
        {
            for hint in &self.ref_order_hint {
                w.put_bits((hint & ((1 << hint_bits) - 1)) as u64, hint_bits);
            }
        }

        if self.is_intra() {
            self.write_frame_size(sh, w);
            self.write_render_size(w);
            if allow_sct {
                w.put_bit(self.allow_intrabc);
            }
        } else {
            if sh.enable_order_hint {
                w.put_bit(self.frame_refs_short_signaling);
            }
            for idx in &self.ref_frame_idx {
                w.put_bits(*idx as u64, 3);
            }
            // frame_size_with_refs is not used: every frame keeps the sequence size.
            self.write_frame_size(sh, w);
            self.write_render_size(w);
            if !force_integer_mv {
                w.put_bit(self.allow_high_precision_mv);
            }
            w.put_bit(self.is_filter_switchable);
            if !self.is_filter_switchable {
                w.put_bits(self.interpolation_filter as u64, 2);
            }
            w.put_bit(self.is_motion_mode_switchable);
            if !error_resilient && sh.enable_ref_frame_mvs {
                w.put_bit(self.use_ref_frame_mvs);
            }
        }

        if !(sh.reduced_still_picture_header || self.disable_cdf_update) {
            w.put_bit(self.disable_frame_end_update_cdf);
        }

        self.write_tile_info(w);

        offsets.q_index = w.bit_offset();
        self.write_quantization(sh, w);

        offsets.segmentation = w.bit_offset();
        self.write_segmentation(w);

        if self.quantization.base_q_idx > 0 {
            w.put_bit(self.delta_q_present);
        }
        if self.delta_q_present {
            w.put_bits(self.delta_q_res as u64, 2);
            if !self.allow_intrabc {
                w.put_bit(self.delta_lf_present);
            }
            if self.delta_lf_present {
                w.put_bits(self.delta_lf_res as u64, 2);
                w.put_bit(self.delta_lf_multi);
            }
        }

        let coded_lossless = self.is_coded_lossless();

        offsets.loop_filter = w.bit_offset();
        if !(coded_lossless || self.allow_intrabc) {
            self.write_loop_filter(sh, w);
        }

        offsets.cdef = w.bit_offset();
        if !(coded_lossless || self.allow_intrabc) && sh.enable_cdef {
            self.write_cdef(sh, w);
        }

        offsets.loop_restoration = w.bit_offset();
        if !(coded_lossless || self.allow_intrabc) && sh.enable_restoration {
            self.write_loop_restoration(sh, w);
        }

        if !coded_lossless {
            w.put_bit(self.tx_mode_select);
        }

        if !self.is_intra() {
            w.put_bit(self.reference_select);
        }

        if skip_mode_allowed(sh, self) {
            w.put_bit(self.skip_mode_present);
        }

        if !(self.is_intra() || error_resilient || !sh.enable_warped_motion) {
            w.put_bit(self.allow_warped_motion);
        }

        w.put_bit(self.reduced_tx_set);

        if !self.is_intra() {
            for _ in 0..REFS_PER_FRAME {
                w.put_bit(false); // is_global
            }
        }

        if sh.film_grain_params_present && (self.show_frame || self.showable_frame) {
            w.put_bit(false); // apply_grain
        }

        offsets.frame_header_size = w.bit_offset() - start;
    }

    fn write_frame_size(&self, sh: &SequenceHeader, w: &mut BitstreamWriter) {
        if self.frame_size_override_flag {
            w.put_bits((self.frame_width - 1) as u64, sh.frame_width_bits_minus_1 + 1);
            w.put_bits((self.frame_height - 1) as u64, sh.frame_height_bits_minus_1 + 1);
        }
        if sh.enable_superres {
            w.put_bit(false); // use_superres
        }
    }

    fn write_render_size(&self, w: &mut BitstreamWriter) {
        w.put_bit(self.render_and_frame_size_different);
        if self.render_and_frame_size_different {
            w.put_bits((self.render_width - 1) as u64, 16);
            w.put_bits((self.render_height - 1) as u64, 16);
        }
    }

    fn write_tile_info(&self, w: &mut BitstreamWriter) {
        let ti = &self.tile_info;
        w.put_bit(true); // uniform_tile_spacing_flag
        for _ in ti.min_log2_tile_cols..ti.tile_cols_log2 {
            w.put_bit(true);
        }
        if ti.tile_cols_log2 < ti.max_log2_tile_cols {
            w.put_bit(false);
        }
        for _ in ti.min_log2_tile_rows..ti.tile_rows_log2 {
            w.put_bit(true);
        }
        if ti.tile_rows_log2 < ti.max_log2_tile_rows {
            w.put_bit(false);
        }
        let tiles_log2 = ti.tile_cols_log2 + ti.tile_rows_log2;
        if tiles_log2 > 0 {
            w.put_bits(ti.context_update_tile_id as u64, tiles_log2);
            w.put_bits(ti.tile_size_bytes_minus_1 as u64, 2);
        }
    }

    fn write_quantization(&self, sh: &SequenceHeader, w: &mut BitstreamWriter) {
        let q = &self.quantization;
        w.put_bits(q.base_q_idx as u64, 8);
        w.put_delta_q(q.delta_q_y_dc);
        if sh.color_config.num_planes() > 1 {
            let diff_uv_delta = sh.color_config.separate_uv_delta_q && q.diff_uv_delta;
            if sh.color_config.separate_uv_delta_q {
                w.put_bit(diff_uv_delta);
            }
            w.put_delta_q(q.delta_q_u_dc);
            w.put_delta_q(q.delta_q_u_ac);
            if diff_uv_delta {
                w.put_delta_q(q.delta_q_v_dc);
                w.put_delta_q(q.delta_q_v_ac);
            }
        }
        w.put_bit(q.using_qmatrix);
        if q.using_qmatrix {
            w.put_bits(q.qm_y as u64, 4);
            w.put_bits(q.qm_u as u64, 4);
            if sh.color_config.separate_uv_delta_q {
                w.put_bits(q.qm_v as u64, 4);
            }
        }
    }

    fn write_segmentation(&self, w: &mut BitstreamWriter) {
        let seg = &self.segmentation;
        w.put_bit(seg.enabled);
        if !seg.enabled {
            return;
        }
        let update_data = if self.primary_ref_frame == PRIMARY_REF_NONE {
            true
        } else {
            w.put_bit(seg.update_map);
            if seg.update_map {
                w.put_bit(seg.temporal_update);
            }
            w.put_bit(seg.update_data);
            seg.update_data
        };
        if update_data {
            for i in 0..8 {
                for j in 0..8 {
                    w.put_bit(seg.feature_enabled[i][j]);
                    if seg.feature_enabled[i][j] {
                        let bits = SEG_FEATURE_BITS[j];
                        let data = seg.feature_data[i][j];
                        if SEG_FEATURE_SIGNED[j] {
                            w.put_su(data as i32, bits);
                        } else if bits > 0 {
                            w.put_bits(data as u64, bits);
                        }
                    }
                }
            }
        }
    }

    fn write_loop_filter(&self, sh: &SequenceHeader, w: &mut BitstreamWriter) {
        let lf = &self.loop_filter;
        w.put_bits(lf.level[0] as u64, 6);
        w.put_bits(lf.level[1] as u64, 6);
        if sh.color_config.num_planes() > 1 && (lf.level[0] > 0 || lf.level[1] > 0) {
            w.put_bits(lf.level[2] as u64, 6);
            w.put_bits(lf.level[3] as u64, 6);
        }
        w.put_bits(lf.sharpness as u64, 3);
        w.put_bit(lf.delta_enabled);
        if lf.delta_enabled {
            w.put_bit(lf.delta_update);
            if lf.delta_update {
                for i in 0..NUM_REF_FRAMES {
                    w.put_bit(lf.update_ref_delta[i]);
                    if lf.update_ref_delta[i] {
                        w.put_su(lf.ref_deltas[i] as i32, 6);
                    }
                }
                for i in 0..2 {
                    w.put_bit(lf.update_mode_delta[i]);
                    if lf.update_mode_delta[i] {
                        w.put_su(lf.mode_deltas[i] as i32, 6);
                    }
                }
            }
        }
    }

    fn write_cdef(&self, sh: &SequenceHeader, w: &mut BitstreamWriter) {
        let cdef = &self.cdef;
        w.put_bits(cdef.damping_minus_3 as u64, 2);
        w.put_bits(cdef.bits as u64, 2);
        for i in 0..(1usize << cdef.bits) {
            w.put_bits(cdef.y_pri_strength[i] as u64, 4);
            w.put_bits(cdef.y_sec_strength[i] as u64, 2);
            if sh.color_config.num_planes() > 1 {
                w.put_bits(cdef.uv_pri_strength[i] as u64, 4);
                w.put_bits(cdef.uv_sec_strength[i] as u64, 2);
            }
        }
    }

    fn write_loop_restoration(&self, sh: &SequenceHeader, w: &mut BitstreamWriter) {
        let lr = &self.loop_restoration;
        let planes = sh.color_config.num_planes();
        let mut uses_lr = false;
        let mut uses_chroma_lr = false;
        for i in 0..planes {
            w.put_bits(lr.frame_restoration_type[i] as u64, 2);
            if lr.frame_restoration_type[i] != 0 {
                uses_lr = true;
                if i > 0 {
                    uses_chroma_lr = true;
                }
            }
        }
        if uses_lr {
            if sh.use_128x128_superblock {
                w.put_bit(lr.lr_unit_shift != 0);
            } else {
                w.put_bit(lr.lr_unit_shift != 0);
                if lr.lr_unit_shift != 0 {
                    w.put_bit(lr.lr_unit_extra_shift != 0);
                }
            }
            let cc = &sh.color_config;
            if cc.subsampling_x && cc.subsampling_y && uses_chroma_lr {
                w.put_bit(lr.lr_uv_shift != 0);
            }
        }
    }
}

/// Relative distance between two order hints (`get_relative_dist`).
pub fn relative_dist(sh: &SequenceHeader, a: u32, b: u32) -> i32 {
    let bits = sh.order_hint_bits();
    if bits == 0 {
        return 0;
    }
    let m = 1i32 << (bits - 1);
    let diff = a as i32 - b as i32;
    (diff & (m - 1)) - (diff & m)
}

/// `skipModeAllowed` derivation: a forward and a backward (or a second
/// forward) reference with known order hints must exist.
pub fn skip_mode_allowed(sh: &SequenceHeader, fh: &FrameHeader) -> bool {
    if fh.is_intra() || !fh.reference_select || !sh.enable_order_hint {
        return false;
    }

    let mut forward: Option<u32> = None;
    let mut backward: Option<u32> = None;
    for &idx in &fh.ref_frame_idx {
        let ref_hint = fh.ref_order_hint[idx as usize];
        if relative_dist(sh, ref_hint, fh.order_hint) < 0 {
            if forward.map_or(true, |f| relative_dist(sh, ref_hint, f) > 0) {
                forward = Some(ref_hint);
            }
        } else if relative_dist(sh, ref_hint, fh.order_hint) > 0
            && backward.map_or(true, |b| relative_dist(sh, ref_hint, b) < 0)
        {
            backward = Some(ref_hint);
        }
    }

    match (forward, backward) {
        (None, _) => false,
        (Some(_), Some(_)) => true,
        (Some(fwd), None) => fh.ref_frame_idx.iter().any(|&idx| {
            let ref_hint = fh.ref_order_hint[idx as usize];
            relative_dist(sh, ref_hint, fwd) < 0
        }),
    }
}
