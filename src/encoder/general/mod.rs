//! Per-frame parameter derivation.
//!
//! [`General`] owns the resolved configuration and the header templates.
//! [`General::configure_task`] runs once per task in encode order and carries
//! the DPB and order counters forward through [`EncoderSessionState`].

pub mod defaults;
pub mod frame_header;
pub mod templates;

use tracing::{debug, info};

use crate::encoder::dpb::{
    set_task_dpb_refresh, set_task_ref_list, Dpb, FramePool, RefListParams, RefreshParams,
};
use crate::encoder::packer::{FrameHeader, SequenceHeader};
use crate::encoder::task::{InsertHeaders, ShowFrame, Task};
use crate::encoder::{EncodeConfig, FrameType, MAX_QP};
use crate::error::{EncodeError, Result, Status};

pub use frame_header::get_current_frame_header;

/// State carried from one encoded task to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSessionState {
    /// DPB after the last configured task.
    pub dpb: Dpb,
    pub last_encoded_order: Option<u32>,
    pub encoded_order_in_gop: u32,
    pub ref_order_in_gop: u32,
    /// The last task was shown, so the next one opens a temporal unit.
    pub prev_shown: bool,
    pub first_frame: bool,
}

impl Default for EncoderSessionState {
    fn default() -> Self {
        Self {
            dpb: Dpb::default(),
            last_encoded_order: None,
            encoded_order_in_gop: 0,
            ref_order_in_gop: 0,
            prev_shown: true,
            first_frame: true,
        }
    }
}

impl EncoderSessionState {
    /// Drops the DPB references and starts over. Encode order keeps counting.
    pub fn reset(&mut self, pool: &mut FramePool) {
        pool.release_dpb(&self.dpb);
        let last_encoded_order = self.last_encoded_order;
        *self = Self {
            last_encoded_order,
            ..Self::default()
        };
    }
}

/// Resolved configuration plus everything derived from it once.
#[derive(Debug, Clone)]
pub struct General {
    pub config: EncodeConfig,
    pub sh: SequenceHeader,
    pub fh_template: FrameHeader,
    ref_params: RefListParams,
    refresh_params: RefreshParams,
}

impl General {
    /// Checks `config`, resolves its defaults and builds the header templates.
    ///
    /// Returns `Status::ParamCorrected` when a parameter had to be clamped.
    pub fn new(mut config: EncodeConfig) -> Result<(Self, Status)> {
        let status = defaults::check_video_param(&mut config)?;
        defaults::set_defaults(&mut config);

        let sh = templates::make_sequence_header(&config);
        let fh_template = templates::make_frame_header_template(&sh, &config);
        info!(
            "AV1 parameters: {}x{} profile={} level={} gop={} ref_dist={} rc={:?}",
            config.dimensions.width,
            config.dimensions.height,
            sh.seq_profile,
            config.level,
            config.gop_pic_size,
            config.gop_ref_dist,
            config.rate_control_mode
        );
        Ok((
            Self {
                ref_params: RefListParams::from_config(&config),
                refresh_params: RefreshParams::from_config(&config),
                config,
                sh,
                fh_template,
            },
            status,
        ))
    }

    /// Derives every encode parameter of `task` and advances `state`.
    ///
    /// On failure the task holds no pool references and `state` is unchanged.
    pub fn configure_task(
        &self,
        task: &mut Task,
        state: &mut EncoderSessionState,
        pool: &mut FramePool,
    ) -> Result<()> {
        let rec = pool.acquire()?;
        task.rec = Some(rec);

        let mut next = *state;
        if let Err(e) = self.derive(task, &mut next) {
            pool.release(rec);
            task.rec = None;
            task.dpb = Default::default();
            return Err(e);
        }

        // The task keeps its references alive until it is freed; the session
        // state moves to the post-refresh DPB.
        pool.retain_dpb(&task.dpb.active);
        pool.retain_dpb(&task.dpb.after);
        pool.release_dpb(&state.dpb);
        next.dpb = task.dpb.after;
        task.session_before = Some(*state);
        *state = next;
        Ok(())
    }

    /// Takes back the last configured task after rate control dropped it.
    ///
    /// The session returns to the state `task` was configured against: the
    /// frame leaves no trace in the DPB and its encode order is handed to the
    /// next frame. The task keeps `dpb.active` until it is freed.
    pub fn unconfigure_task(
        &self,
        task: &mut Task,
        state: &mut EncoderSessionState,
        pool: &mut FramePool,
    ) -> Result<()> {
        if state.last_encoded_order != Some(task.encoded_order) {
            return Err(EncodeError::InvalidDpbState(format!(
                "frame {} (encode order {}) is not the last configured frame",
                task.display_order, task.encoded_order
            )));
        }
        let before = task.session_before.take().ok_or_else(|| {
            EncodeError::InvalidDpbState(format!(
                "frame {} was never configured",
                task.display_order
            ))
        })?;

        pool.retain_dpb(&before.dpb);
        pool.release_dpb(&state.dpb);
        *state = before;

        task.refresh_frame_flags = 0;
        task.frame_type.remove(FrameType::REF);
        task.dpb.after = task.dpb.active;
        debug!(
            "Dropped display {}: encode order {} is reused",
            task.display_order, task.encoded_order
        );
        Ok(())
    }

    fn derive(&self, task: &mut Task, state: &mut EncoderSessionState) -> Result<()> {
        set_task_encode_orders(task, state);
        init_task_dpb(task, &state.dpb);
        self.set_task_long_term(task);
        set_task_ref_list(task, &self.ref_params);
        self.set_task_qp(task);
        set_task_dpb_refresh(task, &self.refresh_params)?;
        set_task_frames_to_show(task);
        self.set_task_insert_headers(task, state);
        task.frame_header = get_current_frame_header(&self.sh, &self.fh_template, task, &self.config);

        debug!(
            "Configured display={} encoded={} type={:?} hidden={} refs={:?} refresh={:#010b}",
            task.display_order,
            task.encoded_order,
            task.frame_type,
            task.is_hidden,
            task.ref_list,
            task.refresh_frame_flags
        );
        Ok(())
    }

    fn set_task_long_term(&self, task: &mut Task) {
        task.long_term_idx = None;
        if !task.frame_type.is_ref() {
            return;
        }
        let requested = task
            .ctrl
            .ref_list
            .as_ref()
            .and_then(|c| c.long_term.first())
            .map(|e| e.long_term_idx);
        task.long_term_idx = match requested {
            Some(idx) => Some(idx),
            None if task.hints.long_term => Some(0),
            None => None,
        };
    }

    /// Quantizer from the frame control, or the CQP value of the frame type.
    pub fn set_task_qp(&self, task: &mut Task) {
        if let Some(qp) = task.ctrl.qp {
            task.qp_y = qp;
            return;
        }
        let config = &self.config;
        let ft = task.frame_type;
        let qp = if ft.is_i() {
            config.qp_i as i32
        } else if ft.is_b() {
            let offset = config
                .qp_offsets
                .map_or(0, |o| o[(task.pyramid_level as usize).min(7)] as i32);
            config.qp_b as i32 + offset
        } else {
            config.qp_p as i32
        };
        task.qp_y = qp.clamp(1, MAX_QP as i32) as u8;
    }

    fn set_task_insert_headers(&self, task: &mut Task, state: &mut EncoderSessionState) {
        let config = &self.config;
        let mut insert = InsertHeaders::PPS;
        if state.first_frame && config.ivf {
            insert |= InsertHeaders::IVF_SEQ;
        }
        if state.prev_shown {
            insert |= InsertHeaders::TD;
            if config.ivf {
                insert |= InsertHeaders::IVF_FRAME;
            }
        }
        if task.frame_type.is_i() {
            insert |= InsertHeaders::SPS;
            if config.hdr.is_some() {
                insert |= InsertHeaders::HDR;
            }
        }
        if config.pack_obu_frame {
            insert |= InsertHeaders::OBU_FRAME;
        }
        task.insert_headers = insert;
        state.first_frame = false;
        state.prev_shown = task.is_shown();
    }
}

/// Global and per-GOP encode order.
pub fn set_task_encode_orders(task: &mut Task, state: &mut EncoderSessionState) {
    task.encoded_order = state.last_encoded_order.map_or(0, |o| o + 1);
    let gop_start = task.frame_type.is_i() || state.last_encoded_order.is_none();
    if gop_start {
        task.encoded_order_in_gop = 0;
        task.ref_order_in_gop = 0;
    } else {
        task.encoded_order_in_gop = state.encoded_order_in_gop + 1;
        task.ref_order_in_gop = state.ref_order_in_gop + u32::from(task.frame_type.is_ref());
    }
    state.last_encoded_order = Some(task.encoded_order);
    state.encoded_order_in_gop = task.encoded_order_in_gop;
    state.ref_order_in_gop = task.ref_order_in_gop;
}

/// Copies the session DPB into the task and flags frames the application
/// rejected for this frame.
pub fn init_task_dpb(task: &mut Task, dpb: &Dpb) {
    task.dpb.active = *dpb;
    let Some(ctrl) = task.ctrl.ref_list.as_ref() else {
        return;
    };
    // Long-term references can be rejected by index as well.
    for frame in task.dpb.active.slots.iter_mut().flatten() {
        if ctrl.rejected.iter().any(|r| {
            r.frame_order == frame.display_order
                || (frame.is_long_term() && frame.long_term_idx == r.long_term_idx)
        }) {
            frame.rejected = true;
        }
    }
}

/// Hidden frames to re-show right after `task`: decoded frames displayed
/// after it and before the next frame still waiting in the reorder window.
pub fn set_task_frames_to_show(task: &mut Task) {
    task.frames_to_show.clear();
    if task.is_hidden {
        return;
    }
    let current = task.display_order;
    let limit = task.next_buffered_display_order.unwrap_or(u32::MAX);
    let mut pending: Vec<ShowFrame> = task
        .dpb
        .after
        .unique_frames()
        .into_iter()
        .filter(|(_, f)| f.display_order > current && f.display_order < limit)
        .map(|(slot, f)| ShowFrame {
            slot: slot as u8,
            display_order: f.display_order,
            encoded_order: f.encoded_order,
            frame_type: f.frame_type,
        })
        .collect();
    pending.sort_by_key(|s| s.display_order);
    task.frames_to_show = pending;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::dpb::test_util::dpb_of;
    use crate::encoder::dpb::IDX_INVALID;
    use crate::encoder::{FrameType, RefListCtrl, RefListEntry};

    fn general(config: EncodeConfig) -> General {
        General::new(config).unwrap().0
    }

    fn task(order: u32, frame_type: FrameType) -> Task {
        let mut task = Task::new(order as usize);
        task.display_order = order;
        task.display_order_in_gop = order;
        task.frame_type = frame_type;
        task
    }

    fn key() -> FrameType {
        FrameType::I | FrameType::REF | FrameType::IDR
    }

    fn p_ref() -> FrameType {
        FrameType::P | FrameType::REF
    }

    #[test]
    fn test_new_reports_corrections() {
        let (general, status) = General::new(EncodeConfig::av1(640, 480)).unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(general.config.gop_pic_size, 30);

        let (_, status) = General::new(EncodeConfig::av1(640, 480).with_qp(300, 0, 0)).unwrap();
        assert_eq!(status, Status::ParamCorrected);
    }

    #[test]
    fn test_ip_sequence() {
        let general = general(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut pool = FramePool::new(16);
        let mut state = EncoderSessionState::default();

        let mut t0 = task(0, key());
        general.configure_task(&mut t0, &mut state, &mut pool).unwrap();
        assert_eq!(t0.encoded_order, 0);
        assert_eq!(t0.refresh_frame_flags, 0xFF);
        assert!(t0.insert_headers.contains(
            InsertHeaders::IVF_SEQ | InsertHeaders::IVF_FRAME | InsertHeaders::TD | InsertHeaders::SPS
        ));
        assert_eq!(t0.qp_y as u32, general.config.qp_i);

        let mut t1 = task(1, p_ref());
        general.configure_task(&mut t1, &mut state, &mut pool).unwrap();
        assert_eq!(t1.encoded_order, 1);
        assert_eq!(t1.encoded_order_in_gop, 1);
        assert_eq!(t1.ref_order_in_gop, 1);
        assert_eq!(t1.ref_list[0], 0);
        assert!(!t1.insert_headers.contains(InsertHeaders::IVF_SEQ));
        assert!(!t1.insert_headers.contains(InsertHeaders::SPS));
        assert!(t1.insert_headers.contains(InsertHeaders::TD));
        assert_eq!(state.last_encoded_order, Some(1));

        let rec0 = t0.rec.unwrap();
        assert!(pool.refcount(rec0) > 1);
        assert_eq!(pool.refcount(t1.rec.unwrap()), 2);
    }

    #[test]
    fn test_hidden_frame_shown_later() {
        let general = general(
            EncodeConfig::av1(320, 240)
                .with_gop(30, 2)
                .with_b_ref_type(crate::encoder::BRefType::Off),
        );
        let mut pool = FramePool::new(16);
        let mut state = EncoderSessionState::default();

        let mut t0 = task(0, key());
        general.configure_task(&mut t0, &mut state, &mut pool).unwrap();

        let mut t2 = task(2, p_ref());
        t2.is_hidden = true;
        t2.next_buffered_display_order = Some(1);
        general.configure_task(&mut t2, &mut state, &mut pool).unwrap();
        assert!(t2.frames_to_show.is_empty());
        assert!(!t2.frame_header.show_frame);
        assert!(!t2.insert_headers.contains(InsertHeaders::SPS));

        let mut t1 = task(1, FrameType::B);
        general.configure_task(&mut t1, &mut state, &mut pool).unwrap();
        // The hidden frame shares t1's temporal unit.
        assert!(!t1.insert_headers.contains(InsertHeaders::TD));
        assert_eq!(t1.frames_to_show.len(), 1);
        assert_eq!(t1.frames_to_show[0].display_order, 2);
        assert_ne!(t1.ref_list[4], IDX_INVALID);
        assert_eq!(t1.refresh_frame_flags, 0);
    }

    #[test]
    fn test_rejected_reference_is_refreshed() {
        let general = general(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut pool = FramePool::new(16);
        let mut state = EncoderSessionState::default();
        for order in 0..3 {
            let ft = if order == 0 { key() } else { p_ref() };
            let mut t = task(order, ft);
            general.configure_task(&mut t, &mut state, &mut pool).unwrap();
        }

        let mut t3 = task(3, p_ref());
        t3.ctrl.ref_list = Some(RefListCtrl {
            rejected: vec![RefListEntry {
                frame_order: 2,
                long_term_idx: 0,
            }],
            ..Default::default()
        });
        general.configure_task(&mut t3, &mut state, &mut pool).unwrap();
        let (slot, _) = t3.dpb.active.find_display_order(2).unwrap();
        assert!(t3.dpb.active.get(slot).unwrap().rejected);
        assert_ne!(t3.ref_list[0] as usize, slot);
        assert_ne!(t3.refresh_frame_flags & (1 << slot), 0);
    }

    #[test]
    fn test_rejected_long_term_index() {
        let mut dpb = dpb_of(&[Some(0), Some(4), Some(8), None, None, None, None, None]);
        if let Some(f) = dpb.slots[0].as_mut() {
            f.mark_long_term(1);
        }
        let mut t = task(12, p_ref());
        t.ctrl.ref_list = Some(RefListCtrl {
            rejected: vec![RefListEntry {
                frame_order: 99,
                long_term_idx: 1,
            }],
            ..Default::default()
        });
        init_task_dpb(&mut t, &dpb);
        assert!(t.dpb.active.get(0).unwrap().rejected);
        // Short-term frames are matched by display order only.
        assert!(!t.dpb.active.get(1).unwrap().rejected);
        assert!(!t.dpb.active.get(2).unwrap().rejected);
        // The session's own DPB is untouched.
        assert!(!dpb.get(0).unwrap().rejected);
    }

    #[test]
    fn test_long_term_request() {
        let general = general(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut pool = FramePool::new(16);
        let mut state = EncoderSessionState::default();
        let mut t0 = task(0, key());
        t0.ctrl.ref_list = Some(RefListCtrl {
            long_term: vec![RefListEntry {
                frame_order: 0,
                long_term_idx: 1,
            }],
            ..Default::default()
        });
        general.configure_task(&mut t0, &mut state, &mut pool).unwrap();
        assert_eq!(t0.long_term_idx, Some(1));
        assert!(state.dpb.get(0).unwrap().is_long_term());
    }

    #[test]
    fn test_qp_selection() {
        let mut config = EncodeConfig::av1(320, 240).with_qp(100, 120, 140);
        config.qp_offsets = Some([0, 2, 4, 6, 8, 8, 8, 8]);
        let general = general(config);

        let mut t = task(3, FrameType::B);
        t.pyramid_level = 2;
        general.set_task_qp(&mut t);
        assert_eq!(t.qp_y, 144);

        t.ctrl.qp = Some(0);
        general.set_task_qp(&mut t);
        assert_eq!(t.qp_y, 0);

        let mut t = task(0, key());
        general.set_task_qp(&mut t);
        assert_eq!(t.qp_y, 100);
    }

    #[test]
    fn test_exhausted_pool_leaves_state() {
        let general = general(EncodeConfig::av1(320, 240).with_gop(30, 1));
        let mut pool = FramePool::new(1);
        let mut state = EncoderSessionState::default();
        let mut t0 = task(0, key());
        general.configure_task(&mut t0, &mut state, &mut pool).unwrap();

        let mut t1 = task(1, p_ref());
        assert!(general.configure_task(&mut t1, &mut state, &mut pool).is_err());
        assert!(t1.rec.is_none());
        assert_eq!(state.last_encoded_order, Some(0));
    }
}
