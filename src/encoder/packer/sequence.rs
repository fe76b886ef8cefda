//! Sequence header syntax.

use crate::encoder::bitwriter::BitstreamWriter;

/// `seq_force_screen_content_tools` / `seq_force_integer_mv` value meaning
/// "decided per frame".
pub const SELECT_SCREEN_CONTENT_TOOLS: u8 = 2;
pub const SELECT_INTEGER_MV: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_display_tick: u32,
    pub time_scale: u32,
    pub equal_picture_interval: bool,
    pub num_ticks_per_picture_minus_1: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingPoint {
    /// Bit `i` set: temporal layer `i` decoded. Bit `8 + j`: spatial layer `j`.
    pub idc: u16,
    pub seq_level_idx: u8,
    pub seq_tier: bool,
}

/// `(color_primaries, transfer_characteristics, matrix_coefficients)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorDescription {
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl ColorDescription {
    fn is_srgb_triple(&self) -> bool {
        self.color_primaries == 1 && self.transfer_characteristics == 13 && self.matrix_coefficients == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConfig {
    pub bit_depth: u8,
    pub mono_chrome: bool,
    pub color_description: Option<ColorDescription>,
    pub color_range: bool,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub chroma_sample_position: u8,
    pub separate_uv_delta_q: bool,
}

impl ColorConfig {
    pub fn num_planes(&self) -> usize {
        if self.mono_chrome {
            1
        } else {
            3
        }
    }
}

/// Sequence header OBU payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceHeader {
    pub seq_profile: u8,
    pub still_picture: bool,
    pub reduced_still_picture_header: bool,
    pub timing_info: Option<TimingInfo>,
    pub operating_points: Vec<OperatingPoint>,
    pub frame_width_bits_minus_1: u8,
    pub frame_height_bits_minus_1: u8,
    pub max_frame_width_minus_1: u32,
    pub max_frame_height_minus_1: u32,
    pub use_128x128_superblock: bool,
    pub enable_filter_intra: bool,
    pub enable_intra_edge_filter: bool,
    pub enable_interintra_compound: bool,
    pub enable_masked_compound: bool,
    pub enable_warped_motion: bool,
    pub enable_dual_filter: bool,
    pub enable_order_hint: bool,
    pub enable_jnt_comp: bool,
    pub enable_ref_frame_mvs: bool,
    pub seq_choose_screen_content_tools: bool,
    /// 0, 1 or `SELECT_SCREEN_CONTENT_TOOLS`.
    pub seq_force_screen_content_tools: u8,
    pub seq_choose_integer_mv: bool,
    /// 0, 1 or `SELECT_INTEGER_MV`.
    pub seq_force_integer_mv: u8,
    pub order_hint_bits_minus_1: u8,
    pub enable_superres: bool,
    pub enable_cdef: bool,
    pub enable_restoration: bool,
    pub color_config: ColorConfig,
    pub film_grain_params_present: bool,
}

impl SequenceHeader {
    pub fn order_hint_bits(&self) -> u8 {
        if self.enable_order_hint {
            self.order_hint_bits_minus_1 + 1
        } else {
            0
        }
    }

    /// Number of temporal layers signalled by the operating points.
    pub fn num_temporal_layers(&self) -> u8 {
        self.operating_points
            .iter()
            .map(|op| (op.idc & 0xFF).count_ones() as u8)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub(crate) fn write(&self, w: &mut BitstreamWriter) {
        w.put_bits(self.seq_profile as u64, 3);
        w.put_bit(self.still_picture);
        w.put_bit(self.reduced_still_picture_header);

        if self.reduced_still_picture_header {
            let level = self.operating_points.first().map_or(0, |op| op.seq_level_idx);
            w.put_bits(level as u64, 5);
        } else {
            w.put_bit(self.timing_info.is_some());
            if let Some(ti) = &self.timing_info {
                w.put_bits(ti.num_units_in_display_tick as u64, 32);
                w.put_bits(ti.time_scale as u64, 32);
                w.put_bit(ti.equal_picture_interval);
                if ti.equal_picture_interval {
                    w.put_uvlc(ti.num_ticks_per_picture_minus_1);
                }
                w.put_bit(false); // decoder_model_info_present_flag
            }
            w.put_bit(false); // initial_display_delay_present_flag

            let count = self.operating_points.len().max(1);
            w.put_bits((count - 1) as u64, 5);
            for i in 0..count {
                let op = self.operating_points.get(i).copied().unwrap_or(OperatingPoint {
                    idc: 0,
                    seq_level_idx: 0,
                    seq_tier: false,
                });
                w.put_bits(op.idc as u64, 12);
                w.put_bits(op.seq_level_idx as u64, 5);
                if op.seq_level_idx > 7 {
                    w.put_bit(op.seq_tier);
                }
            }
        }

        w.put_bits(self.frame_width_bits_minus_1 as u64, 4);
        w.put_bits(self.frame_height_bits_minus_1 as u64, 4);
        w.put_bits(
            self.max_frame_width_minus_1 as u64,
            self.frame_width_bits_minus_1 + 1,
        );
        w.put_bits(
            self.max_frame_height_minus_1 as u64,
            self.frame_height_bits_minus_1 + 1,
        );

        if !self.reduced_still_picture_header {
            w.put_bit(false); // frame_id_numbers_present_flag
        }

        w.put_bit(self.use_128x128_superblock);
        w.put_bit(self.enable_filter_intra);
        w.put_bit(self.enable_intra_edge_filter);

        if !self.reduced_still_picture_header {
            w.put_bit(self.enable_interintra_compound);
            w.put_bit(self.enable_masked_compound);
            w.put_bit(self.enable_warped_motion);
            w.put_bit(self.enable_dual_filter);
            w.put_bit(self.enable_order_hint);
            if self.enable_order_hint {
                w.put_bit(self.enable_jnt_comp);
                w.put_bit(self.enable_ref_frame_mvs);
            }

            w.put_bit(self.seq_choose_screen_content_tools);
            if !self.seq_choose_screen_content_tools {
                w.put_bit(self.seq_force_screen_content_tools != 0);
            }
            if self.seq_force_screen_content_tools > 0 {
                w.put_bit(self.seq_choose_integer_mv);
                if !self.seq_choose_integer_mv {
                    w.put_bit(self.seq_force_integer_mv != 0);
                }
            }
            if self.enable_order_hint {
                w.put_bits(self.order_hint_bits_minus_1 as u64, 3);
            }
        }

        w.put_bit(self.enable_superres);
        w.put_bit(self.enable_cdef);
        w.put_bit(self.enable_restoration);

        self.write_color_config(w);

        w.put_bit(self.film_grain_params_present);
    }

    fn write_color_config(&self, w: &mut BitstreamWriter) {
        let cc = &self.color_config;
        let high_bitdepth = cc.bit_depth > 8;
        w.put_bit(high_bitdepth);
        if self.seq_profile == 2 && high_bitdepth {
            w.put_bit(cc.bit_depth == 12);
        }
        if self.seq_profile != 1 {
            w.put_bit(cc.mono_chrome);
        }

        w.put_bit(cc.color_description.is_some());
        let mut srgb_triple = false;
        if let Some(cd) = &cc.color_description {
            w.put_bits(cd.color_primaries as u64, 8);
            w.put_bits(cd.transfer_characteristics as u64, 8);
            w.put_bits(cd.matrix_coefficients as u64, 8);
            srgb_triple = cd.is_srgb_triple();
        }

        if cc.mono_chrome {
            w.put_bit(cc.color_range);
            return;
        }
        if !srgb_triple {
            w.put_bit(cc.color_range);
            if self.seq_profile == 2 && cc.bit_depth == 12 {
                w.put_bit(cc.subsampling_x);
                if cc.subsampling_x {
                    w.put_bit(cc.subsampling_y);
                }
            }
            if cc.subsampling_x && cc.subsampling_y {
                w.put_bits(cc.chroma_sample_position as u64, 2);
            }
        }
        w.put_bit(cc.separate_uv_delta_q);
    }
}
