//! In-loop filter strengths derived from the frame quantizer.

use crate::encoder::packer::frame::CdefParams;
use crate::encoder::BitDepth;

/// Highest loop filter level.
pub const MAX_LOOP_FILTER: i32 = 63;

/// Approximate AC quantizer step for `qindex`.
///
/// Linear up to index 128, exponential to the top of the 8-bit table (1828)
/// after that. 10-bit steps are four times larger.
fn ac_q(qindex: u8, bit_depth: BitDepth) -> i32 {
    let q = qindex as f64;
    let step = if qindex <= 128 {
        4.0 + q * 1.2
    } else {
        let knee = 4.0 + 128.0 * 1.2;
        knee * ((q - 128.0) * (1828.0f64 / knee).ln() / 127.0).exp()
    };
    let scale = match bit_depth {
        BitDepth::Eight => 1.0,
        BitDepth::Ten => 4.0,
    };
    (step * scale).round() as i32
}

/// Loop filter levels `[y_vertical, y_horizontal, u, v]` for a frame.
pub fn loop_filter_levels(qindex: u8, is_key: bool, bit_depth: BitDepth) -> [u8; 4] {
    if qindex == 0 {
        return [0; 4];
    }
    let q = ac_q(qindex, bit_depth) as i64;
    let level = match bit_depth {
        BitDepth::Eight => {
            if is_key {
                (q * 17563 - 421574 + (1 << 17)) >> 18
            } else {
                (q * 6017 + 650707 + (1 << 17)) >> 18
            }
        }
        BitDepth::Ten => {
            let level = (q * 20723 + 4060632 + (1 << 19)) >> 20;
            if is_key {
                level - 4
            } else {
                level
            }
        }
    };
    let level = level.clamp(0, MAX_LOOP_FILTER as i64) as u8;
    [level; 4]
}

struct CdefTier {
    damping_minus_3: u8,
    y_pri: [u8; 4],
    y_sec: [u8; 4],
    uv_pri: [u8; 4],
    uv_sec: [u8; 4],
}

const CDEF_LOW: CdefTier = CdefTier {
    damping_minus_3: 0,
    y_pri: [0, 1, 2, 3],
    y_sec: [0, 0, 1, 1],
    uv_pri: [0, 1, 1, 2],
    uv_sec: [0, 0, 0, 1],
};

const CDEF_DEFAULT: CdefTier = CdefTier {
    damping_minus_3: 1,
    y_pri: [1, 3, 5, 7],
    y_sec: [0, 1, 1, 2],
    uv_pri: [1, 2, 3, 4],
    uv_sec: [0, 0, 1, 1],
};

const CDEF_MEDIUM: CdefTier = CdefTier {
    damping_minus_3: 1,
    y_pri: [2, 4, 6, 9],
    y_sec: [0, 1, 2, 2],
    uv_pri: [1, 3, 4, 6],
    uv_sec: [0, 1, 1, 2],
};

const CDEF_HIGH: CdefTier = CdefTier {
    damping_minus_3: 2,
    y_pri: [3, 6, 9, 12],
    y_sec: [1, 1, 2, 3],
    uv_pri: [2, 4, 6, 8],
    uv_sec: [0, 1, 2, 2],
};

const CDEF_EXTREME: CdefTier = CdefTier {
    damping_minus_3: 3,
    y_pri: [5, 8, 12, 15],
    y_sec: [1, 2, 3, 3],
    uv_pri: [3, 5, 8, 10],
    uv_sec: [1, 1, 2, 3],
};

fn widen(strengths: [u8; 4]) -> [u8; 8] {
    let mut out = [0; 8];
    out[..4].copy_from_slice(&strengths);
    out
}

/// CDEF strengths for a frame coded at `qindex`. Four strength presets are
/// signalled per frame; stronger presets for coarser quantizers.
pub fn cdef_for_qp(qindex: u8) -> CdefParams {
    let tier = match qindex {
        0..=89 => &CDEF_LOW,
        90..=130 => &CDEF_DEFAULT,
        131..=140 => &CDEF_MEDIUM,
        141..=210 => &CDEF_HIGH,
        _ => &CDEF_EXTREME,
    };
    CdefParams {
        damping_minus_3: tier.damping_minus_3,
        bits: 2,
        y_pri_strength: widen(tier.y_pri),
        y_sec_strength: widen(tier.y_sec),
        uv_pri_strength: widen(tier.uv_pri),
        uv_sec_strength: widen(tier.uv_sec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdef_tiers() {
        assert_eq!(cdef_for_qp(50).y_pri_strength[3], 3);
        assert_eq!(cdef_for_qp(128).damping_minus_3, 1);
        assert_eq!(cdef_for_qp(135).y_pri_strength[3], 9);
        assert_eq!(cdef_for_qp(200).damping_minus_3, 2);
        let extreme = cdef_for_qp(255);
        assert_eq!(extreme.damping_minus_3, 3);
        assert_eq!(extreme.bits, 2);
        assert_eq!(extreme.y_pri_strength[4..], [0; 4]);
    }

    #[test]
    fn test_loop_filter_grows_with_qp() {
        let low = loop_filter_levels(40, false, BitDepth::Eight);
        let high = loop_filter_levels(220, false, BitDepth::Eight);
        assert!(high[0] > low[0]);
        assert_eq!(high[0], high[3]);
        assert!(high[0] as i32 <= MAX_LOOP_FILTER);
        assert_eq!(loop_filter_levels(0, true, BitDepth::Eight), [0; 4]);
        assert_eq!(loop_filter_levels(255, true, BitDepth::Ten)[0], MAX_LOOP_FILTER as u8);
    }

    #[test]
    fn test_key_frames_filter_less_at_low_qp() {
        let key = loop_filter_levels(20, true, BitDepth::Eight);
        let inter = loop_filter_levels(20, false, BitDepth::Eight);
        assert!(key[0] <= inter[0]);
    }
}
