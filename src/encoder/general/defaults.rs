//! Parameter checks and default resolution.
//!
//! Every `check_*` function clamps what it can and reports
//! `Status::ParamCorrected`, or fails with `UnsupportedConfig` /
//! `InvalidVideoParam` when the request cannot be served. Zero-valued fields
//! mean "not set" and pass the checks untouched; [`set_defaults`] resolves
//! them afterwards.

use tracing::{debug, warn};

use crate::encoder::{
    BRefType, EncodeConfig, PixelFormat, RateControlMode, Scenario, DEFAULT_ASYNC_DEPTH,
    DEFAULT_AV1_QP, DEFAULT_FRAME_RATE, DEFAULT_GOP_REF_DIST, DEFAULT_GOP_SIZE,
    DEFAULT_TARGET_KBPS, INFINITE_GOP, MAX_FRAME_DIMENSION, MAX_GOP_REF_DIST, MAX_QP,
    NUM_REF_FRAMES,
};
use crate::error::{EncodeError, Result, Status};

use super::templates::tile_log2;

/// Default I-frame quantizer offset below `DEFAULT_AV1_QP`.
const QP_I_OFFSET: u32 = 16;
/// Default B-frame quantizer offset above `DEFAULT_AV1_QP`.
const QP_B_OFFSET: u32 = 8;

/// Largest forward reference count the hardware uses.
const MAX_ACTIVE_FWD: u32 = 4;
/// Largest backward reference count the hardware uses.
const MAX_ACTIVE_BWD: u32 = 2;

const MAX_TILES_PER_DIM: u32 = 64;
const MAX_DELTA_Q: i8 = 63;
const MAX_TEMPORAL_LAYERS: usize = 8;

/// `seq_level_idx` used when no defined level fits.
pub const LEVEL_MAX_PARAMETERS: u8 = 31;

/// One row of the AV1 level table (Annex A.3).
#[derive(Debug, Clone, Copy)]
struct LevelLimits {
    seq_level_idx: u8,
    max_pic_size: u64,
    max_display_rate: u64,
}

const LEVELS: &[LevelLimits] = &[
    LevelLimits { seq_level_idx: 0, max_pic_size: 147_456, max_display_rate: 4_423_680 },
    LevelLimits { seq_level_idx: 1, max_pic_size: 278_784, max_display_rate: 8_363_520 },
    LevelLimits { seq_level_idx: 4, max_pic_size: 665_856, max_display_rate: 19_975_680 },
    LevelLimits { seq_level_idx: 5, max_pic_size: 1_065_024, max_display_rate: 31_950_720 },
    LevelLimits { seq_level_idx: 8, max_pic_size: 2_359_296, max_display_rate: 70_778_880 },
    LevelLimits { seq_level_idx: 9, max_pic_size: 2_359_296, max_display_rate: 141_557_760 },
    LevelLimits { seq_level_idx: 12, max_pic_size: 8_912_896, max_display_rate: 267_386_880 },
    LevelLimits { seq_level_idx: 13, max_pic_size: 8_912_896, max_display_rate: 534_773_760 },
    LevelLimits { seq_level_idx: 14, max_pic_size: 8_912_896, max_display_rate: 1_069_547_520 },
    LevelLimits { seq_level_idx: 15, max_pic_size: 8_912_896, max_display_rate: 1_069_547_520 },
    LevelLimits { seq_level_idx: 16, max_pic_size: 35_651_584, max_display_rate: 1_069_547_520 },
    LevelLimits { seq_level_idx: 17, max_pic_size: 35_651_584, max_display_rate: 2_139_095_040 },
    LevelLimits { seq_level_idx: 18, max_pic_size: 35_651_584, max_display_rate: 4_278_190_080 },
    LevelLimits { seq_level_idx: 19, max_pic_size: 35_651_584, max_display_rate: 4_278_190_080 },
];

/// Lowest level whose picture size and display rate limits hold the stream.
pub fn level_for(config: &EncodeConfig) -> u8 {
    let dims = config.max_dimensions.unwrap_or(config.dimensions);
    let pic_size = dims.width as u64 * dims.height as u64;
    let num = config.frame_rate_numerator.max(1) as u64;
    let den = config.frame_rate_denominator.max(1) as u64;
    let display_rate = (pic_size * num).div_ceil(den);
    LEVELS
        .iter()
        .find(|l| pic_size <= l.max_pic_size && display_rate <= l.max_display_rate)
        .map_or(LEVEL_MAX_PARAMETERS, |l| l.seq_level_idx)
}

fn is_known_level(level: u8) -> bool {
    level == LEVEL_MAX_PARAMETERS || LEVELS.iter().any(|l| l.seq_level_idx == level)
}

/// Distinct frames the DPB must hold for the configured GOP.
pub fn min_ref_frames(gop_ref_dist: u32, b_ref_type: BRefType) -> u32 {
    match (gop_ref_dist, b_ref_type) {
        (0 | 1, _) => 1,
        (dist, BRefType::Pyramid) => 1 + tile_log2(1, dist) as u32,
        _ => 2,
    }
}

/// Resolves every unset field of `config`.
pub fn set_defaults(config: &mut EncodeConfig) {
    if config.frame_rate_numerator == 0 || config.frame_rate_denominator == 0 {
        config.frame_rate_numerator = DEFAULT_FRAME_RATE;
        config.frame_rate_denominator = 1;
    }
    if config.max_dimensions.is_none() {
        config.max_dimensions = Some(config.dimensions);
    }

    if config.gop_pic_size == 0 {
        config.gop_pic_size = DEFAULT_GOP_SIZE;
    }
    if config.gop_ref_dist == 0 {
        let low_delay =
            config.scenario == Scenario::VideoConference || !config.temporal_layers.is_empty();
        config.gop_ref_dist = if low_delay {
            1
        } else {
            DEFAULT_GOP_REF_DIST.min(config.gop_pic_size.saturating_sub(1)).max(1)
        };
    }
    if config.b_ref_type == BRefType::Unknown {
        config.b_ref_type = if config.gop_ref_dist > 2 {
            BRefType::Pyramid
        } else {
            BRefType::Off
        };
    }

    if config.num_ref_frame == 0 {
        config.num_ref_frame = min_ref_frames(config.gop_ref_dist, config.b_ref_type)
            .max(4)
            .min(NUM_REF_FRAMES as u32);
    }
    let refs = config.num_ref_frame;
    if config.num_ref_active_p == 0 {
        config.num_ref_active_p = 3.min(refs);
    }
    if config.num_ref_active_bl0 == 0 {
        config.num_ref_active_bl0 = 2.min(refs);
    }
    if config.num_ref_active_bl1 == 0 {
        config.num_ref_active_bl1 = 1;
    }

    if config.async_depth == 0 {
        config.async_depth = DEFAULT_ASYNC_DEPTH;
    }

    if config.qp_p == 0 {
        config.qp_p = DEFAULT_AV1_QP;
    }
    if config.qp_i == 0 {
        config.qp_i = config.qp_p.saturating_sub(QP_I_OFFSET).max(1);
    }
    if config.qp_b == 0 {
        config.qp_b = (config.qp_p + QP_B_OFFSET).min(MAX_QP);
    }
    if config.rate_control_mode != RateControlMode::Cqp {
        if config.target_kbps == 0 {
            config.target_kbps = DEFAULT_TARGET_KBPS;
        }
        if config.max_kbps == 0 || config.rate_control_mode == RateControlMode::Cbr {
            config.max_kbps = config.target_kbps;
        }
    }

    if config.num_tile_columns == 0 {
        config.num_tile_columns = 1;
    }
    if config.num_tile_rows == 0 {
        config.num_tile_rows = 1;
    }
    if config.level == 0 {
        config.level = level_for(config);
    }

    debug!(
        "Resolved defaults: gop={} ref_dist={} b_ref={:?} num_ref={} async_depth={} level={}",
        config.gop_pic_size,
        config.gop_ref_dist,
        config.b_ref_type,
        config.num_ref_frame,
        config.async_depth,
        config.level
    );
}

/// Runs every check in a fixed order and returns the worst status.
pub fn check_video_param(config: &mut EncodeConfig) -> Result<Status> {
    let checks: [fn(&mut EncodeConfig) -> Result<Status>; 12] = [
        check_format,
        check_dimensions,
        check_frame_rate,
        check_temporal_layers,
        check_gop,
        check_num_ref_frame,
        check_active_refs,
        check_low_delay_b,
        check_qp,
        check_rate_control,
        check_tiles,
        check_delta_q,
    ];
    let mut status = Status::Ok;
    for check in checks {
        status = status.worst(check(config)?);
    }
    status = status.worst(check_level(config));
    Ok(status)
}

fn corrected(what: &str, from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Status {
    warn!("Corrected {}: {:?} -> {:?}", what, from, to);
    Status::ParamCorrected
}

pub fn check_format(config: &mut EncodeConfig) -> Result<Status> {
    if config.pixel_format == PixelFormat::Yuv422 {
        return Err(EncodeError::UnsupportedConfig(
            "4:2:2 (professional profile) encoding is not supported".to_string(),
        ));
    }
    Ok(Status::Ok)
}

pub fn check_dimensions(config: &mut EncodeConfig) -> Result<Status> {
    let dims = config.dimensions;
    if dims.width == 0 || dims.height == 0 {
        return Err(EncodeError::InvalidVideoParam(format!(
            "frame size {}x{} is empty",
            dims.width, dims.height
        )));
    }
    if dims.width > MAX_FRAME_DIMENSION || dims.height > MAX_FRAME_DIMENSION {
        return Err(EncodeError::UnsupportedConfig(format!(
            "frame size {}x{} exceeds {}",
            dims.width, dims.height, MAX_FRAME_DIMENSION
        )));
    }
    if let Some(max) = config.max_dimensions {
        if max.width < dims.width || max.height < dims.height {
            return Err(EncodeError::InvalidVideoParam(format!(
                "frame size {}x{} exceeds the declared maximum {}x{}",
                dims.width, dims.height, max.width, max.height
            )));
        }
        if max.width > MAX_FRAME_DIMENSION || max.height > MAX_FRAME_DIMENSION {
            return Err(EncodeError::UnsupportedConfig(format!(
                "maximum frame size {}x{} exceeds {}",
                max.width, max.height, MAX_FRAME_DIMENSION
            )));
        }
    }
    Ok(Status::Ok)
}

pub fn check_frame_rate(config: &mut EncodeConfig) -> Result<Status> {
    if config.frame_rate_numerator != 0 && config.frame_rate_denominator == 0 {
        return Err(EncodeError::InvalidVideoParam(format!(
            "frame rate {}/0",
            config.frame_rate_numerator
        )));
    }
    Ok(Status::Ok)
}

pub fn check_temporal_layers(config: &mut EncodeConfig) -> Result<Status> {
    let scales = &config.temporal_layers;
    if scales.is_empty() {
        return Ok(Status::Ok);
    }
    if scales.len() > MAX_TEMPORAL_LAYERS {
        return Err(EncodeError::UnsupportedConfig(format!(
            "{} temporal layers, at most {} are supported",
            scales.len(),
            MAX_TEMPORAL_LAYERS
        )));
    }
    if scales[0] != 1 {
        return Err(EncodeError::UnsupportedConfig(format!(
            "base temporal layer scale must be 1, got {}",
            scales[0]
        )));
    }
    if let Some(pair) = scales
        .windows(2)
        .find(|w| w[1] <= w[0] || w[1] % w[0] != 0)
    {
        return Err(EncodeError::UnsupportedConfig(format!(
            "temporal layer scale {} does not divide {}",
            pair[0], pair[1]
        )));
    }
    if config.gop_ref_dist > 1 {
        return Err(EncodeError::UnsupportedConfig(format!(
            "temporal layers need a low-delay GOP, got GopRefDist {}",
            config.gop_ref_dist
        )));
    }
    Ok(Status::Ok)
}

pub fn check_gop(config: &mut EncodeConfig) -> Result<Status> {
    let mut status = Status::Ok;
    if config.gop_pic_size > INFINITE_GOP {
        status = corrected("GopPicSize", config.gop_pic_size, INFINITE_GOP);
        config.gop_pic_size = INFINITE_GOP;
    }
    if config.gop_ref_dist > MAX_GOP_REF_DIST {
        status = corrected("GopRefDist", config.gop_ref_dist, MAX_GOP_REF_DIST);
        config.gop_ref_dist = MAX_GOP_REF_DIST;
    }
    if config.gop_pic_size > 1 && config.gop_ref_dist >= config.gop_pic_size {
        let dist = config.gop_pic_size - 1;
        status = corrected("GopRefDist", config.gop_ref_dist, dist);
        config.gop_ref_dist = dist;
    }
    if config.gop_pic_size == 1 && config.gop_ref_dist > 1 {
        status = corrected("GopRefDist", config.gop_ref_dist, 1);
        config.gop_ref_dist = 1;
    }
    Ok(status)
}

pub fn check_num_ref_frame(config: &mut EncodeConfig) -> Result<Status> {
    if config.num_ref_frame == 0 {
        return Ok(Status::Ok);
    }
    let mut status = Status::Ok;
    if config.num_ref_frame > NUM_REF_FRAMES as u32 {
        status = corrected("NumRefFrame", config.num_ref_frame, NUM_REF_FRAMES);
        config.num_ref_frame = NUM_REF_FRAMES as u32;
    }
    let b_ref = match config.b_ref_type {
        BRefType::Unknown if config.gop_ref_dist > 2 => BRefType::Pyramid,
        other => other,
    };
    let required = min_ref_frames(config.gop_ref_dist, b_ref);
    if config.num_ref_frame < required {
        status = corrected("NumRefFrame", config.num_ref_frame, required);
        config.num_ref_frame = required;
    }
    Ok(status)
}

pub fn check_active_refs(config: &mut EncodeConfig) -> Result<Status> {
    let limit = if config.num_ref_frame == 0 {
        NUM_REF_FRAMES as u32
    } else {
        config.num_ref_frame
    };
    let mut status = Status::Ok;
    let fwd_limit = MAX_ACTIVE_FWD.min(limit);
    for (name, value) in [
        ("NumRefActiveP", &mut config.num_ref_active_p),
        ("NumRefActiveBL0", &mut config.num_ref_active_bl0),
    ] {
        if *value > fwd_limit {
            status = corrected(name, *value, fwd_limit);
            *value = fwd_limit;
        }
    }
    let bwd_limit = MAX_ACTIVE_BWD.min(limit);
    if config.num_ref_active_bl1 > bwd_limit {
        status = corrected("NumRefActiveBL1", config.num_ref_active_bl1, bwd_limit);
        config.num_ref_active_bl1 = bwd_limit;
    }
    Ok(status)
}

pub fn check_low_delay_b(config: &mut EncodeConfig) -> Result<Status> {
    if config.low_delay_b && config.gop_ref_dist > 1 {
        config.low_delay_b = false;
        return Ok(corrected("LowDelayB", true, false));
    }
    Ok(Status::Ok)
}

pub fn check_qp(config: &mut EncodeConfig) -> Result<Status> {
    let mut status = Status::Ok;
    for (name, qp) in [
        ("QPI", &mut config.qp_i),
        ("QPP", &mut config.qp_p),
        ("QPB", &mut config.qp_b),
    ] {
        if *qp > MAX_QP {
            status = corrected(name, *qp, MAX_QP);
            *qp = MAX_QP;
        }
    }
    Ok(status)
}

pub fn check_rate_control(config: &mut EncodeConfig) -> Result<Status> {
    if config.rate_control_mode == RateControlMode::Cqp {
        return Ok(Status::Ok);
    }
    if config.rate_control_mode == RateControlMode::Vbr
        && config.max_kbps != 0
        && config.max_kbps < config.target_kbps
    {
        let status = corrected("MaxKbps", config.max_kbps, config.target_kbps);
        config.max_kbps = config.target_kbps;
        return Ok(status);
    }
    if config.rate_control_mode == RateControlMode::Cbr
        && config.max_kbps != 0
        && config.max_kbps != config.target_kbps
    {
        let status = corrected("MaxKbps", config.max_kbps, config.target_kbps);
        config.max_kbps = config.target_kbps;
        return Ok(status);
    }
    Ok(Status::Ok)
}

pub fn check_tiles(config: &mut EncodeConfig) -> Result<Status> {
    let mut status = Status::Ok;
    for (name, value) in [
        ("NumTileColumns", &mut config.num_tile_columns),
        ("NumTileRows", &mut config.num_tile_rows),
    ] {
        if *value > MAX_TILES_PER_DIM {
            status = corrected(name, *value, MAX_TILES_PER_DIM);
            *value = MAX_TILES_PER_DIM;
        }
        if *value > 1 && !value.is_power_of_two() {
            let uniform = value.next_power_of_two().min(MAX_TILES_PER_DIM);
            status = corrected(name, *value, uniform);
            *value = uniform;
        }
    }
    Ok(status)
}

pub fn check_delta_q(config: &mut EncodeConfig) -> Result<Status> {
    let dq = &mut config.delta_q;
    let mut status = Status::Ok;
    for (name, delta) in [
        ("DeltaQYDc", &mut dq.y_dc),
        ("DeltaQUDc", &mut dq.u_dc),
        ("DeltaQUAc", &mut dq.u_ac),
        ("DeltaQVDc", &mut dq.v_dc),
        ("DeltaQVAc", &mut dq.v_ac),
    ] {
        let clamped = (*delta).clamp(-MAX_DELTA_Q, MAX_DELTA_Q);
        if clamped != *delta {
            status = corrected(name, *delta, clamped);
            *delta = clamped;
        }
    }
    Ok(status)
}

/// Unknown levels are reset to "derive".
pub fn check_level(config: &mut EncodeConfig) -> Status {
    if config.level != 0 && !is_known_level(config.level) {
        let status = corrected("seq_level_idx", config.level, 0);
        config.level = 0;
        return status;
    }
    Status::Ok
}
