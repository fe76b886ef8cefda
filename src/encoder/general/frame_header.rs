//! Per-frame specialization of the frame header template.

use tracing::trace;

use crate::encoder::dpb::{IDX_INVALID, LAST_FRAME};
use crate::encoder::enctools::{cdef_for_qp, loop_filter_levels};
use crate::encoder::packer::frame::{skip_mode_allowed, Av1FrameType, CdefParams, FrameHeader};
use crate::encoder::packer::SequenceHeader;
use crate::encoder::task::Task;
use crate::encoder::{EncodeConfig, NUM_REF_FRAMES};

/// Builds the frame header of `task` from the template.
///
/// The task must have its reference list, refresh mask and quantizer set.
pub fn get_current_frame_header(
    sh: &SequenceHeader,
    template: &FrameHeader,
    task: &Task,
    config: &EncodeConfig,
) -> FrameHeader {
    let mut fh = template.clone();
    let key = task.frame_type.is_i();

    fh.frame_type = if key {
        Av1FrameType::Key
    } else {
        Av1FrameType::Inter
    };
    fh.show_frame = task.is_shown();
    fh.showable_frame = task.is_hidden;
    fh.error_resilient_mode = (key && fh.show_frame) || config.error_resilient;
    fh.order_hint = task.display_order_in_gop;
    fh.refresh_frame_flags = task.refresh_frame_flags;

    for slot in 0..NUM_REF_FRAMES {
        fh.ref_order_hint[slot] = task
            .dpb
            .active
            .get(slot)
            .map_or(0, |f| f.display_order_in_gop);
    }

    if !key {
        // Unused names point at LAST so every index is a valid slot.
        let fallback = match task.ref_list[LAST_FRAME] {
            IDX_INVALID => 0,
            idx => idx,
        };
        for (dst, &idx) in fh.ref_frame_idx.iter_mut().zip(&task.ref_list) {
            *dst = if idx == IDX_INVALID { fallback } else { idx };
        }
    }

    fh.quantization.base_q_idx = task.qp_y;

    if fh.is_coded_lossless() {
        fh.loop_filter.level = [0; 4];
        fh.cdef = CdefParams::default();
        fh.tx_mode_select = false;
    } else {
        fh.loop_filter.level = config
            .loop_filter_levels
            .unwrap_or_else(|| loop_filter_levels(task.qp_y, key, config.bit_depth));
        if sh.enable_cdef {
            fh.cdef = cdef_for_qp(task.qp_y);
        }
        fh.tx_mode_select = true;
    }

    fh.reference_select = !key && (task.frame_type.is_b() || config.low_delay_b);
    fh.skip_mode_present = skip_mode_allowed(sh, &fh);

    trace!(
        display_order = task.display_order,
        order_hint = fh.order_hint,
        q = fh.quantization.base_q_idx,
        refs = ?fh.ref_frame_idx,
        "frame header"
    );
    fh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::dpb::test_util::dpb_of;
    use crate::encoder::general::defaults::set_defaults;
    use crate::encoder::general::templates::{make_frame_header_template, make_sequence_header};
    use crate::encoder::FrameType;

    fn setup(config: EncodeConfig) -> (EncodeConfig, SequenceHeader, FrameHeader) {
        let mut config = config;
        set_defaults(&mut config);
        let sh = make_sequence_header(&config);
        let fh = make_frame_header_template(&sh, &config);
        (config, sh, fh)
    }

    fn inter_task(order: u32, frame_type: FrameType, refs: [u8; 7]) -> Task {
        let mut task = Task::new(0);
        task.display_order = order;
        task.display_order_in_gop = order;
        task.frame_type = frame_type;
        task.ref_list = refs;
        task.qp_y = 120;
        task.dpb.active = dpb_of(&[Some(0), Some(8), Some(4)]);
        task
    }

    #[test]
    fn test_key_frame() {
        let (config, sh, template) = setup(EncodeConfig::av1(320, 240));
        let mut task = Task::new(0);
        task.frame_type = FrameType::I | FrameType::REF | FrameType::IDR;
        task.refresh_frame_flags = 0xFF;
        task.qp_y = 100;
        let fh = get_current_frame_header(&sh, &template, &task, &config);
        assert_eq!(fh.frame_type, Av1FrameType::Key);
        assert!(fh.show_frame);
        assert!(fh.error_resilient_mode);
        assert!(!fh.reference_select);
        assert!(!fh.skip_mode_present);
        assert_eq!(fh.quantization.base_q_idx, 100);
        assert_eq!(fh.cdef, cdef_for_qp(100));
    }

    #[test]
    fn test_hidden_b_frame() {
        let (config, sh, template) = setup(EncodeConfig::av1(320, 240).with_gop(30, 8));
        let mut refs = [IDX_INVALID; 7];
        refs[LAST_FRAME] = 0;
        refs[4] = 2;
        let mut task = inter_task(2, FrameType::B | FrameType::REF, refs);
        task.is_hidden = true;
        let fh = get_current_frame_header(&sh, &template, &task, &config);
        assert_eq!(fh.frame_type, Av1FrameType::Inter);
        assert!(!fh.show_frame);
        assert!(fh.showable_frame);
        assert!(!fh.error_resilient_mode);
        assert_eq!(fh.order_hint, 2);
        assert_eq!(fh.ref_order_hint[..3], [0, 8, 4]);
        assert_eq!(fh.ref_frame_idx, [0, 0, 0, 0, 2, 0, 0]);
        assert!(fh.reference_select);
        // Forward hint 0 and backward hint 4.
        assert!(fh.skip_mode_present);
    }

    #[test]
    fn test_p_only_never_skip_mode() {
        let (config, sh, template) = setup(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut refs = [IDX_INVALID; 7];
        refs[LAST_FRAME] = 2;
        refs[1] = 0;
        let task = inter_task(5, FrameType::P | FrameType::REF, refs);
        let fh = get_current_frame_header(&sh, &template, &task, &config);
        assert!(!fh.reference_select);
        assert!(!fh.skip_mode_present);
        assert_eq!(fh.ref_frame_idx[6], 2);
    }

    #[test]
    fn test_lossless_disables_filters() {
        let (config, sh, template) = setup(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut refs = [IDX_INVALID; 7];
        refs[LAST_FRAME] = 0;
        let mut task = inter_task(1, FrameType::P | FrameType::REF, refs);
        task.qp_y = 0;
        let fh = get_current_frame_header(&sh, &template, &task, &config);
        assert!(fh.is_coded_lossless());
        assert_eq!(fh.loop_filter.level, [0; 4]);
        assert_eq!(fh.cdef, CdefParams::default());
        assert!(!fh.tx_mode_select);
    }

    #[test]
    fn test_explicit_loop_filter() {
        let mut config = EncodeConfig::av1(320, 240).with_gop(30, 1);
        config.loop_filter_levels = Some([7, 7, 3, 3]);
        let (config, sh, template) = setup(config);
        let mut refs = [IDX_INVALID; 7];
        refs[LAST_FRAME] = 0;
        let task = inter_task(1, FrameType::P | FrameType::REF, refs);
        let fh = get_current_frame_header(&sh, &template, &task, &config);
        assert_eq!(fh.loop_filter.level, [7, 7, 3, 3]);
    }
}
