//! Sequence header and frame header templates derived from the configuration.

use crate::encoder::packer::frame::{FrameHeader, TileInfo, PRIMARY_REF_NONE};
use crate::encoder::packer::sequence::{
    ColorConfig, ColorDescription, OperatingPoint, SequenceHeader, TimingInfo, SELECT_INTEGER_MV,
    SELECT_SCREEN_CONTENT_TOOLS,
};
use crate::encoder::{CdefMode, Dimensions, EncodeConfig};

/// Superblock size used by the hardware.
pub const SB_SIZE_LOG2: u32 = 6;

const MAX_TILE_WIDTH: u32 = 4096;
const MAX_TILE_AREA: u32 = 4096 * 2304;
const MAX_TILE_COLS: u32 = 64;
const MAX_TILE_ROWS: u32 = 64;

/// Order hint width.
const ORDER_HINT_BITS: u8 = 8;

/// BT.2020 primaries, SMPTE ST 2084 transfer, BT.2020 non-constant luminance.
const HDR10_COLOR: ColorDescription = ColorDescription {
    color_primaries: 9,
    transfer_characteristics: 16,
    matrix_coefficients: 9,
};

/// Smallest `k` such that `blk_size << k >= target`.
pub fn tile_log2(blk_size: u32, target: u32) -> u8 {
    let mut k = 0;
    while (blk_size << k) < target {
        k += 1;
    }
    k
}

fn ceil_log2(value: u32) -> u8 {
    tile_log2(1, value.max(1))
}

/// Uniform tile layout for a frame, clamped to the legal range.
pub fn tile_info(dimensions: Dimensions, columns: u32, rows: u32) -> TileInfo {
    let sb_cols = dimensions.width.div_ceil(1 << SB_SIZE_LOG2).max(1);
    let sb_rows = dimensions.height.div_ceil(1 << SB_SIZE_LOG2).max(1);

    let max_tile_width_sb = MAX_TILE_WIDTH >> SB_SIZE_LOG2;
    let max_tile_area_sb = MAX_TILE_AREA >> (2 * SB_SIZE_LOG2);
    let min_log2_tile_cols = tile_log2(max_tile_width_sb, sb_cols);
    let max_log2_tile_cols = tile_log2(1, sb_cols.min(MAX_TILE_COLS));
    let max_log2_tile_rows = tile_log2(1, sb_rows.min(MAX_TILE_ROWS));
    let min_log2_tiles = min_log2_tile_cols.max(tile_log2(max_tile_area_sb, sb_cols * sb_rows));

    let tile_cols_log2 = ceil_log2(columns)
        .max(min_log2_tile_cols)
        .min(max_log2_tile_cols);
    let min_log2_tile_rows = min_log2_tiles.saturating_sub(tile_cols_log2);
    let tile_rows_log2 = ceil_log2(rows)
        .max(min_log2_tile_rows)
        .min(max_log2_tile_rows);

    TileInfo {
        tile_cols_log2,
        tile_rows_log2,
        min_log2_tile_cols,
        max_log2_tile_cols,
        min_log2_tile_rows,
        max_log2_tile_rows,
        context_update_tile_id: 0,
        tile_size_bytes_minus_1: 3,
    }
}

/// Operating points for a stream with `layers` temporal layers, highest
/// frame rate first.
fn operating_points(layers: usize, seq_level_idx: u8) -> Vec<OperatingPoint> {
    if layers <= 1 {
        return vec![OperatingPoint {
            idc: 0,
            seq_level_idx,
            seq_tier: false,
        }];
    }
    (0..layers)
        .map(|i| {
            let decoded = layers - i;
            OperatingPoint {
                idc: 0x100 | ((1u16 << decoded) - 1),
                seq_level_idx,
                seq_tier: false,
            }
        })
        .collect()
}

/// Builds the sequence header for a resolved configuration.
pub fn make_sequence_header(config: &EncodeConfig) -> SequenceHeader {
    let max = config.max_dimensions.unwrap_or(config.dimensions);
    let (subsampling_x, subsampling_y) = config.pixel_format.subsampling();
    let dq = &config.delta_q;

    let timing_info = (config.frame_rate_numerator > 0 && config.frame_rate_denominator > 0).then(|| TimingInfo {
        num_units_in_display_tick: config.frame_rate_denominator,
        time_scale: config.frame_rate_numerator,
        equal_picture_interval: false,
        num_ticks_per_picture_minus_1: 0,
    });

    SequenceHeader {
        seq_profile: config.pixel_format.seq_profile(),
        still_picture: false,
        reduced_still_picture_header: false,
        timing_info,
        operating_points: operating_points(config.temporal_layers.len(), config.level),
        frame_width_bits_minus_1: 15,
        frame_height_bits_minus_1: 15,
        max_frame_width_minus_1: max.width.max(1) - 1,
        max_frame_height_minus_1: max.height.max(1) - 1,
        use_128x128_superblock: false,
        enable_filter_intra: false,
        enable_intra_edge_filter: true,
        enable_interintra_compound: false,
        enable_masked_compound: false,
        enable_warped_motion: false,
        enable_dual_filter: false,
        enable_order_hint: true,
        enable_jnt_comp: false,
        enable_ref_frame_mvs: false,
        seq_choose_screen_content_tools: true,
        seq_force_screen_content_tools: SELECT_SCREEN_CONTENT_TOOLS,
        seq_choose_integer_mv: true,
        seq_force_integer_mv: SELECT_INTEGER_MV,
        order_hint_bits_minus_1: ORDER_HINT_BITS - 1,
        enable_superres: false,
        enable_cdef: config.cdef == CdefMode::Auto,
        enable_restoration: false,
        color_config: ColorConfig {
            bit_depth: config.bit_depth.bits(),
            mono_chrome: false,
            color_description: config.hdr.map(|_| HDR10_COLOR),
            color_range: config.full_range,
            subsampling_x,
            subsampling_y,
            chroma_sample_position: 0,
            separate_uv_delta_q: dq.u_dc != dq.v_dc || dq.u_ac != dq.v_ac,
        },
        film_grain_params_present: false,
    }
}

/// Builds the frame header every task starts from.
pub fn make_frame_header_template(sh: &SequenceHeader, config: &EncodeConfig) -> FrameHeader {
    let dims = config.dimensions;
    let mut fh = FrameHeader {
        frame_width: dims.width,
        frame_height: dims.height,
        render_width: dims.width,
        render_height: dims.height,
        frame_size_override_flag: dims.width != sh.max_frame_width_minus_1 + 1
            || dims.height != sh.max_frame_height_minus_1 + 1,
        primary_ref_frame: PRIMARY_REF_NONE,
        tile_info: tile_info(dims, config.num_tile_columns, config.num_tile_rows),
        error_resilient_mode: config.error_resilient,
        interpolation_filter: 0,
        is_filter_switchable: false,
        tx_mode_select: true,
        ..Default::default()
    };

    let q = &mut fh.quantization;
    q.delta_q_y_dc = config.delta_q.y_dc;
    q.delta_q_u_dc = config.delta_q.u_dc;
    q.delta_q_u_ac = config.delta_q.u_ac;
    q.diff_uv_delta = sh.color_config.separate_uv_delta_q;
    if q.diff_uv_delta {
        q.delta_q_v_dc = config.delta_q.v_dc;
        q.delta_q_v_ac = config.delta_q.v_ac;
    } else {
        q.delta_q_v_dc = config.delta_q.u_dc;
        q.delta_q_v_ac = config.delta_q.u_ac;
    }

    fh.loop_filter.sharpness = 0;
    fh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::general::defaults::set_defaults;
    use crate::encoder::{BitDepth, HdrMetadata, PixelFormat};

    #[test]
    fn test_tile_info_1080p() {
        let info = tile_info(
            Dimensions {
                width: 1920,
                height: 1080,
            },
            1,
            1,
        );
        // 30x17 superblocks
        assert_eq!(info.min_log2_tile_cols, 0);
        assert_eq!(info.max_log2_tile_cols, 5);
        assert_eq!(info.max_log2_tile_rows, 5);
        assert_eq!(info.tile_cols_log2, 0);
        assert_eq!(info.tile_rows_log2, 0);
    }

    #[test]
    fn test_tile_info_clamps() {
        let small = Dimensions {
            width: 128,
            height: 64,
        };
        let info = tile_info(small, 16, 16);
        assert_eq!(info.tile_cols_log2, 1);
        assert_eq!(info.tile_rows_log2, 0);

        // 8K needs at least two tile columns.
        let wide = Dimensions {
            width: 8192,
            height: 4320,
        };
        let info = tile_info(wide, 1, 1);
        assert_eq!(info.tile_cols_log2, 1);
        assert!(info.tile_cols_log2 + info.tile_rows_log2 >= 2);
    }

    #[test]
    fn test_sequence_header_from_config() {
        let mut config = EncodeConfig::av1(1280, 720)
            .with_bit_depth(BitDepth::Ten)
            .with_pixel_format(PixelFormat::Yuv444)
            .with_hdr(HdrMetadata::default());
        set_defaults(&mut config);
        let sh = make_sequence_header(&config);
        assert_eq!(sh.seq_profile, 1);
        assert_eq!(sh.color_config.bit_depth, 10);
        assert!(!sh.color_config.subsampling_x);
        assert_eq!(sh.color_config.color_description, Some(HDR10_COLOR));
        assert_eq!(sh.max_frame_width_minus_1, 1279);
        assert_eq!(sh.order_hint_bits(), 8);
        assert!(sh.timing_info.is_some());
        assert_eq!(sh.operating_points.len(), 1);
    }

    #[test]
    fn test_temporal_operating_points() {
        let mut config = EncodeConfig::av1(640, 480)
            .with_gop(30, 1)
            .with_temporal_layers(vec![1, 2, 4]);
        set_defaults(&mut config);
        let sh = make_sequence_header(&config);
        let idcs: Vec<u16> = sh.operating_points.iter().map(|op| op.idc).collect();
        assert_eq!(idcs, vec![0x107, 0x103, 0x101]);
        assert_eq!(sh.num_temporal_layers(), 3);
    }

    #[test]
    fn test_frame_header_template() {
        let mut config = EncodeConfig::av1(640, 480);
        config.max_dimensions = Some(Dimensions {
            width: 1280,
            height: 720,
        });
        set_defaults(&mut config);
        let sh = make_sequence_header(&config);
        let fh = make_frame_header_template(&sh, &config);
        assert!(fh.frame_size_override_flag);
        assert_eq!(fh.frame_width, 640);
        assert_eq!(fh.primary_ref_frame, PRIMARY_REF_NONE);
        assert!(fh.tx_mode_select);
    }
}
