//! Software look-ahead and reservoir rate control.
//!
//! Scene changes are detected from the mean absolute luma difference between
//! consecutive input frames. Rate control keeps a bit reservoir that is
//! filled by `bits_per_frame` each frame and drained by the coded size; the
//! quantizer moves with the distance of the reservoir from its target.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::{
    BrcFrameParams, BrcStatus, EncToolsBuffer, EncToolsBufferId, EncToolsConfig, EncToolsEngine,
};
use crate::encoder::{EncodeConfig, FrameType, RateControlMode, MAX_QP};
use crate::error::{EncodeError, Result, Status};

/// Mean absolute luma difference that counts as a scene cut.
const SCENECUT_THRESHOLD: f64 = 40.0;

/// Region difference below which a region counts as unchanged.
const PERSISTENCE_DIFF: f64 = 2.0;

/// Largest look-ahead depth offered.
const MAX_LA_DEPTH: u32 = 16;

/// Quantizer step applied on every recode.
const RECODE_QP_STEP: i32 = 16;

/// No downward recode below this quantizer.
const MIN_RECODE_QP: u8 = 8;

/// Analysis result for one input frame.
#[derive(Debug, Clone, Copy, Default)]
struct FrameAnalysis {
    scene_change: bool,
    persistence: [u8; 16],
}

#[derive(Debug, Default)]
struct FrameState {
    analysis: Option<FrameAnalysis>,
    params: Option<BrcFrameParams>,
    qp: u8,
    recode_adjust: i32,
    verdict: Option<(BrcStatus, u32)>,
}

/// Bit reservoir rate control.
#[derive(Debug)]
struct ReservoirBrc {
    mode: RateControlMode,
    bits_per_frame: i64,
    reservoir_max: i64,
    reservoir_target: i64,
    reservoir_fullness: i64,
    qp_i: u32,
    qp_p: u32,
    qp_b: u32,
    qp_offsets: Option<[i8; 8]>,
    max_recode: u32,
}

impl ReservoirBrc {
    fn new(config: &EncodeConfig) -> Self {
        let num = config.frame_rate_numerator.max(1) as i64;
        let den = config.frame_rate_denominator.max(1) as i64;
        let bits_per_frame = (config.target_kbps as i64 * 1000 * den / num).max(32);
        // 1.5x the key frame interval, within [12, 256] frames.
        let delay = (config.gop_pic_size as i64 * 3 / 2).clamp(12, 256);
        let reservoir_max = bits_per_frame * delay;
        let reservoir_target = (reservoir_max + 1) >> 1;
        Self {
            mode: config.rate_control_mode,
            bits_per_frame,
            reservoir_max,
            reservoir_target,
            reservoir_fullness: reservoir_target,
            qp_i: config.qp_i,
            qp_p: config.qp_p,
            qp_b: config.qp_b,
            qp_offsets: config.qp_offsets,
            max_recode: config.max_recode,
        }
    }

    /// Share of `bits_per_frame` a frame type gets, in quarters.
    fn weight(frame_type: FrameType) -> i64 {
        if frame_type.is_i() {
            24
        } else if frame_type.is_b() {
            2
        } else {
            4
        }
    }

    fn expected_bits(&self, frame_type: FrameType) -> i64 {
        self.bits_per_frame * Self::weight(frame_type) / 4
    }

    fn select_qp(&self, params: &BrcFrameParams, recode_adjust: i32) -> u8 {
        let ft = params.frame_type;
        let mut base = if ft.is_i() {
            self.qp_i as i32
        } else if ft.is_b() {
            self.qp_b as i32
        } else {
            self.qp_p as i32
        };
        if ft.is_b() {
            if let Some(offsets) = self.qp_offsets {
                base += offsets[(params.pyramid_level as usize).min(7)] as i32;
            }
        }
        // Frames of budget the reservoir is behind its target.
        let deficit = (self.reservoir_target - self.reservoir_fullness) / self.bits_per_frame;
        let delta = (deficit as i32 * 2).clamp(-48, 48);
        (base + delta + recode_adjust).clamp(1, MAX_QP as i32) as u8
    }

    fn verdict(&self, params: &BrcFrameParams, coded_bytes: u32, qp: u8) -> (BrcStatus, u32) {
        let bits = coded_bytes as i64 * 8;
        let expected = self.expected_bits(params.frame_type);
        let can_recode = params.num_recode < self.max_recode;

        if bits > expected * 3 {
            if can_recode && (qp as u32) < MAX_QP {
                return (BrcStatus::BigFrame, 0);
            }
            if !params.frame_type.is_ref() && bits > self.reservoir_fullness + self.bits_per_frame {
                return (BrcStatus::PanicBigFrame, 0);
            }
            return (BrcStatus::Ok, 0);
        }
        if bits * 4 < expected && can_recode && qp > MIN_RECODE_QP {
            return (BrcStatus::SmallFrame, 0);
        }
        let overflow = self.reservoir_fullness + self.bits_per_frame - bits - self.reservoir_max;
        if self.mode == RateControlMode::Cbr && overflow > 0 {
            let min_bytes = ((bits + overflow + 7) / 8) as u32;
            return (BrcStatus::PanicSmallFrame, min_bytes);
        }
        (BrcStatus::Ok, 0)
    }

    fn commit(&mut self, coded_bits: i64) {
        self.reservoir_fullness += self.bits_per_frame - coded_bits;
        self.reservoir_fullness = self.reservoir_fullness.min(self.reservoir_max);
        trace!(fullness = self.reservoir_fullness, "reservoir updated");
    }
}

/// Built-in [`EncToolsEngine`].
#[derive(Debug, Default)]
pub struct BuiltinEncTools {
    active: EncToolsConfig,
    width: usize,
    height: usize,
    brc: Option<ReservoirBrc>,
    frames: BTreeMap<u32, FrameState>,
    prev_luma: Option<Vec<u8>>,
    persistence: [u8; 16],
    newest: Option<u32>,
    end_of_stream: bool,
}

impl BuiltinEncTools {
    pub fn new() -> Self {
        Self::default()
    }

    fn luma<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let size = self.width * self.height;
        if size > 0 && data.len() >= size {
            &data[..size]
        } else {
            data
        }
    }

    fn analyze(&mut self, luma: &[u8]) -> FrameAnalysis {
        let mut analysis = FrameAnalysis::default();
        let Some(prev) = self.prev_luma.as_deref() else {
            return analysis;
        };
        if prev.len() != luma.len() || luma.is_empty() {
            return analysis;
        }

        let diff: u64 = prev
            .iter()
            .zip(luma)
            .map(|(&a, &b)| a.abs_diff(b) as u64)
            .sum();
        let mean = diff as f64 / luma.len() as f64;
        analysis.scene_change = mean > SCENECUT_THRESHOLD;

        let (w, h) = (self.width.max(1), self.height.max(1));
        let (rw, rh) = (w.div_ceil(4), h.div_ceil(4));
        let mut region_diff = [0u64; 16];
        let mut region_count = [0u64; 16];
        for (i, (&a, &b)) in prev.iter().zip(luma).enumerate() {
            let (x, y) = (i % w, i / w);
            let region = ((y / rh).min(3) * 4 + (x / rw).min(3)) as usize;
            region_diff[region] += a.abs_diff(b) as u64;
            region_count[region] += 1;
        }
        for r in 0..16 {
            let unchanged = region_count[r] > 0
                && (region_diff[r] as f64 / region_count[r] as f64) < PERSISTENCE_DIFF;
            self.persistence[r] = if unchanged && !analysis.scene_change {
                self.persistence[r].saturating_add(1)
            } else {
                0
            };
        }
        analysis.persistence = self.persistence;
        analysis
    }

    fn hints_ready(&self, display_order: u32) -> bool {
        let analyzed = self
            .frames
            .get(&display_order)
            .is_some_and(|f| f.analysis.is_some());
        analyzed
            && (self.end_of_stream
                || self
                    .newest
                    .is_some_and(|n| n >= display_order + self.active.la_depth))
    }

    fn on_encode_result(&mut self, display_order: u32, coded_size: u32, num_recode: u32) -> Result<()> {
        let brc = self
            .brc
            .as_mut()
            .ok_or_else(|| EncodeError::EncTools("BRC is not enabled".to_string()))?;
        let state = self.frames.get_mut(&display_order).ok_or_else(|| {
            EncodeError::EncTools(format!("no BRC frame parameters for display order {display_order}"))
        })?;
        let mut params = state.params.ok_or_else(|| {
            EncodeError::EncTools(format!("no BRC frame parameters for display order {display_order}"))
        })?;
        params.num_recode = num_recode;

        let (status, min_size) = brc.verdict(&params, coded_size, state.qp);
        match status {
            BrcStatus::Ok => brc.commit(coded_size as i64 * 8),
            BrcStatus::PanicBigFrame => brc.commit(0),
            BrcStatus::BigFrame => state.recode_adjust += RECODE_QP_STEP,
            BrcStatus::SmallFrame => state.recode_adjust -= RECODE_QP_STEP,
            BrcStatus::PanicSmallFrame => {}
        }
        state.verdict = Some((status, min_size));
        Ok(())
    }
}

impl EncToolsEngine for BuiltinEncTools {
    fn supported_config(&self, config: &EncodeConfig) -> EncToolsConfig {
        let brc = config.rate_control_mode != RateControlMode::Cqp;
        EncToolsConfig {
            adaptive_i: true,
            adaptive_b: false,
            adaptive_ltr: true,
            scene_analysis: true,
            persistence_map: true,
            buffer_hints: brc,
            brc,
            la_depth: MAX_LA_DEPTH,
        }
    }

    fn init(&mut self, requested: &EncToolsConfig, config: &EncodeConfig) -> Result<()> {
        *self = Self {
            active: *requested,
            width: config.dimensions.width as usize,
            height: config.dimensions.height as usize,
            brc: requested.brc.then(|| ReservoirBrc::new(config)),
            ..Self::default()
        };
        debug!("Built-in EncTools: {:?}", self.active);
        Ok(())
    }

    fn active_config(&self) -> EncToolsConfig {
        self.active
    }

    fn delay_in_frames(&self) -> u32 {
        self.active.la_depth
    }

    fn submit(&mut self, buffers: &[EncToolsBuffer]) -> Result<Status> {
        let mut status = Status::Ok;
        for buffer in buffers {
            match buffer {
                EncToolsBuffer::FrameToAnalyze {
                    display_order,
                    surface: Some(surface),
                } => {
                    let luma = self.luma(&surface.data).to_vec();
                    let analysis = self.analyze(&luma);
                    self.prev_luma = Some(luma);
                    self.frames.entry(*display_order).or_default().analysis = Some(analysis);
                    self.newest = Some(*display_order);
                    if !self.hints_ready(*display_order) {
                        status = status.worst(Status::MoreData);
                    }
                }
                EncToolsBuffer::FrameToAnalyze { surface: None, .. } => {
                    self.end_of_stream = true;
                }
                EncToolsBuffer::BrcFrameParams(params) => {
                    let state = self.frames.entry(params.display_order).or_default();
                    state.params = Some(*params);
                    state.verdict = None;
                }
                EncToolsBuffer::BrcEncodeResult {
                    display_order,
                    coded_size,
                    num_recode,
                    ..
                } => self.on_encode_result(*display_order, *coded_size, *num_recode)?,
                other => {
                    return Err(EncodeError::EncTools(format!(
                        "{:?} cannot be submitted",
                        other.id()
                    )))
                }
            }
        }
        Ok(status)
    }

    fn query(
        &mut self,
        display_order: u32,
        ids: &[EncToolsBufferId],
    ) -> Result<(Status, Vec<EncToolsBuffer>)> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                EncToolsBufferId::SceneChange
                | EncToolsBufferId::GopHint
                | EncToolsBufferId::PersistenceMap
                | EncToolsBufferId::BufferHint => {
                    if !self.hints_ready(display_order) {
                        return Ok((Status::MoreData, Vec::new()));
                    }
                    let analysis = self
                        .frames
                        .get(&display_order)
                        .and_then(|f| f.analysis)
                        .unwrap_or_default();
                    match id {
                        EncToolsBufferId::SceneChange => out.push(EncToolsBuffer::SceneChange {
                            display_order,
                            scene_change: analysis.scene_change,
                            long_term: analysis.scene_change,
                        }),
                        EncToolsBufferId::GopHint => out.push(EncToolsBuffer::GopHint {
                            display_order,
                            frame_type: (analysis.scene_change && self.active.adaptive_i)
                                .then_some(FrameType::I),
                        }),
                        EncToolsBufferId::PersistenceMap if self.active.persistence_map => {
                            out.push(EncToolsBuffer::PersistenceMap {
                                display_order,
                                map: analysis.persistence,
                            })
                        }
                        EncToolsBufferId::BufferHint if self.active.buffer_hints => {
                            if let Some(brc) = &self.brc {
                                let frame_type = if analysis.scene_change {
                                    FrameType::I
                                } else {
                                    FrameType::P
                                };
                                out.push(EncToolsBuffer::BufferHint {
                                    display_order,
                                    optimal_frame_size: (brc.expected_bits(frame_type) / 8) as u32,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                EncToolsBufferId::BrcQuantControl | EncToolsBufferId::BrcHrdPos => {
                    let Some(brc) = &self.brc else {
                        continue;
                    };
                    let state = self.frames.entry(display_order).or_default();
                    let Some(params) = state.params else {
                        return Ok((Status::MoreData, Vec::new()));
                    };
                    if id == EncToolsBufferId::BrcQuantControl {
                        state.qp = brc.select_qp(&params, state.recode_adjust);
                        out.push(EncToolsBuffer::BrcQuantControl {
                            display_order,
                            qp: state.qp,
                        });
                    } else {
                        out.push(EncToolsBuffer::BrcHrdPos {
                            display_order,
                            buffer_fullness: brc.reservoir_fullness,
                        });
                    }
                }
                EncToolsBufferId::BrcStatus => {
                    let verdict = self.frames.get(&display_order).and_then(|f| f.verdict);
                    let Some((status, min_frame_size)) = verdict else {
                        return Ok((Status::MoreData, Vec::new()));
                    };
                    out.push(EncToolsBuffer::BrcStatus {
                        display_order,
                        status,
                        min_frame_size,
                    });
                }
                other => {
                    return Err(EncodeError::EncTools(format!("{other:?} cannot be queried")));
                }
            }
        }
        Ok((Status::Ok, out))
    }

    fn discard(&mut self, display_order: u32) -> Result<()> {
        self.frames.remove(&display_order);
        Ok(())
    }

    fn reset(&mut self, config: &EncodeConfig) -> Result<()> {
        let active = self.active;
        self.init(&active, config)
    }

    fn close(&mut self) {
        self.frames.clear();
        self.prev_luma = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::general::defaults::set_defaults;

    fn brc_config(mode: RateControlMode) -> EncodeConfig {
        let mut config = EncodeConfig::av1(64, 64)
            .with_rate_control(mode, 480)
            .with_gop(30, 1);
        set_defaults(&mut config);
        config
    }

    fn params(order: u32, frame_type: FrameType) -> BrcFrameParams {
        BrcFrameParams {
            display_order: order,
            encoded_order: order,
            frame_type,
            pyramid_level: 0,
            scene_change: false,
            long_term: false,
            persistence_map: None,
            num_recode: 0,
        }
    }

    #[test]
    fn test_reservoir_budget() {
        let brc = ReservoirBrc::new(&brc_config(RateControlMode::Cbr));
        // 480 kbps at 30 fps
        assert_eq!(brc.bits_per_frame, 16_000);
        assert_eq!(brc.reservoir_max, 16_000 * 45);
        assert_eq!(brc.expected_bits(FrameType::I), 96_000);
        assert_eq!(brc.expected_bits(FrameType::B), 8_000);
    }

    #[test]
    fn test_qp_follows_reservoir() {
        let mut brc = ReservoirBrc::new(&brc_config(RateControlMode::Vbr));
        let p = params(1, FrameType::P | FrameType::REF);
        let at_target = brc.select_qp(&p, 0);
        assert_eq!(at_target as u32, brc.qp_p);

        // Overspend by ten frames of budget.
        brc.commit(brc.bits_per_frame * 11);
        assert!(brc.select_qp(&p, 0) > at_target);
        assert!(brc.select_qp(&p, RECODE_QP_STEP) > brc.select_qp(&p, 0));
    }

    #[test]
    fn test_verdicts() {
        let brc = ReservoirBrc::new(&brc_config(RateControlMode::Cbr));
        let p = params(1, FrameType::P | FrameType::REF);
        assert_eq!(brc.verdict(&p, 2_000, 128).0, BrcStatus::Ok);
        assert_eq!(brc.verdict(&p, 20_000, 128).0, BrcStatus::BigFrame);
        assert_eq!(brc.verdict(&p, 100, 128).0, BrcStatus::SmallFrame);

        let exhausted = BrcFrameParams {
            num_recode: 2,
            ..params(2, FrameType::B)
        };
        let huge = (brc.reservoir_fullness + brc.bits_per_frame) as u32;
        assert_eq!(brc.verdict(&exhausted, huge, 255).0, BrcStatus::PanicBigFrame);
    }

    #[test]
    fn test_panic_small_frame_min_size() {
        let mut brc = ReservoirBrc::new(&brc_config(RateControlMode::Cbr));
        brc.reservoir_fullness = brc.reservoir_max;
        let p = BrcFrameParams {
            num_recode: 2,
            ..params(3, FrameType::P | FrameType::REF)
        };
        let (status, min_size) = brc.verdict(&p, 10, 128);
        assert_eq!(status, BrcStatus::PanicSmallFrame);
        assert_eq!(min_size, 2_000);
        assert_eq!(brc.verdict(&p, min_size, 128).0, BrcStatus::Ok);
    }

    #[test]
    fn test_query_before_submit_is_not_ready() {
        let config = brc_config(RateControlMode::Cbr);
        let mut engine = BuiltinEncTools::new();
        let requested = engine.supported_config(&config);
        engine.init(&requested, &config).unwrap();
        let (status, out) = engine.query(0, &[EncToolsBufferId::SceneChange]).unwrap();
        assert_eq!(status, Status::MoreData);
        assert!(out.is_empty());
        let (status, _) = engine.query(0, &[EncToolsBufferId::BrcStatus]).unwrap();
        assert_eq!(status, Status::MoreData);
    }
}
