//! Bridge to an external look-ahead / bitrate control engine.
//!
//! The engine speaks an asynchronous protocol: frames are submitted in
//! display order and results are queried per display order once the engine
//! has seen enough frames. All data is exchanged as tagged [`EncToolsBuffer`]s.
//!
//! [`Av1EncTools`] drives that protocol for the encode pipeline:
//! - pre-encode: submit every input frame, then query scene change, GOP,
//!   persistence and buffer hints once the look-ahead depth is satisfied.
//! - BRC: query the quantizer before a frame is packed and report the coded
//!   size after the device finished it.

mod builtin;
mod filters;

pub use builtin::BuiltinEncTools;
pub use filters::{cdef_for_qp, loop_filter_levels};

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::encoder::task::Task;
use crate::encoder::{EncodeConfig, FrameType, RateControlMode, RawSurface};
use crate::error::{EncodeError, Result, Status};

/// Buffer kinds exchanged with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncToolsBufferId {
    FrameToAnalyze,
    SceneChange,
    GopHint,
    PersistenceMap,
    BufferHint,
    BrcFrameParams,
    BrcQuantControl,
    BrcHrdPos,
    BrcEncodeResult,
    BrcStatus,
}

/// Outcome of a BRC update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrcStatus {
    #[default]
    Ok,
    /// Too big; recode with a higher quantizer.
    BigFrame,
    /// Too small; recode with a lower quantizer.
    SmallFrame,
    /// Far too big even at the highest quantizer; the frame is dropped.
    PanicBigFrame,
    /// Too small to keep the buffer from overflowing; pad up to the minimum size.
    PanicSmallFrame,
}

/// Frame parameters handed to BRC before the quantizer is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrcFrameParams {
    pub display_order: u32,
    pub encoded_order: u32,
    pub frame_type: FrameType,
    pub pyramid_level: u8,
    pub scene_change: bool,
    pub long_term: bool,
    pub persistence_map: Option<[u8; 16]>,
    pub num_recode: u32,
}

/// Tagged data exchanged with the engine.
#[derive(Debug, Clone)]
pub enum EncToolsBuffer {
    /// Input frame in display order. `None` marks the end of the stream.
    FrameToAnalyze {
        display_order: u32,
        surface: Option<Arc<RawSurface>>,
    },
    SceneChange {
        display_order: u32,
        scene_change: bool,
        /// The frame is a good long-term reference.
        long_term: bool,
    },
    GopHint {
        display_order: u32,
        frame_type: Option<FrameType>,
    },
    PersistenceMap {
        display_order: u32,
        map: [u8; 16],
    },
    BufferHint {
        display_order: u32,
        optimal_frame_size: u32,
    },
    BrcFrameParams(BrcFrameParams),
    BrcQuantControl {
        display_order: u32,
        qp: u8,
    },
    BrcHrdPos {
        display_order: u32,
        /// Decoder buffer fullness before this frame, in bits.
        buffer_fullness: i64,
    },
    BrcEncodeResult {
        display_order: u32,
        coded_size: u32,
        qp: u8,
        num_recode: u32,
    },
    BrcStatus {
        display_order: u32,
        status: BrcStatus,
        /// Minimum coded size in bytes for `PanicSmallFrame`.
        min_frame_size: u32,
    },
}

impl EncToolsBuffer {
    pub fn id(&self) -> EncToolsBufferId {
        match self {
            EncToolsBuffer::FrameToAnalyze { .. } => EncToolsBufferId::FrameToAnalyze,
            EncToolsBuffer::SceneChange { .. } => EncToolsBufferId::SceneChange,
            EncToolsBuffer::GopHint { .. } => EncToolsBufferId::GopHint,
            EncToolsBuffer::PersistenceMap { .. } => EncToolsBufferId::PersistenceMap,
            EncToolsBuffer::BufferHint { .. } => EncToolsBufferId::BufferHint,
            EncToolsBuffer::BrcFrameParams(_) => EncToolsBufferId::BrcFrameParams,
            EncToolsBuffer::BrcQuantControl { .. } => EncToolsBufferId::BrcQuantControl,
            EncToolsBuffer::BrcHrdPos { .. } => EncToolsBufferId::BrcHrdPos,
            EncToolsBuffer::BrcEncodeResult { .. } => EncToolsBufferId::BrcEncodeResult,
            EncToolsBuffer::BrcStatus { .. } => EncToolsBufferId::BrcStatus,
        }
    }
}

/// Tools enabled in an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncToolsConfig {
    /// Insert key frames at scene changes.
    pub adaptive_i: bool,
    /// Suggest B-frame placement.
    pub adaptive_b: bool,
    /// Suggest long-term references.
    pub adaptive_ltr: bool,
    pub scene_analysis: bool,
    pub persistence_map: bool,
    pub buffer_hints: bool,
    pub brc: bool,
    /// Requested look-ahead depth in frames.
    pub la_depth: u32,
}

impl EncToolsConfig {
    /// Tools the encoder asks for under `config`.
    pub fn from_video_param(config: &EncodeConfig) -> Self {
        if !config.enc_tools {
            return Self::default();
        }
        let brc = config.rate_control_mode != RateControlMode::Cqp;
        Self {
            adaptive_i: true,
            adaptive_b: config.gop_ref_dist > 1,
            adaptive_ltr: config.is_conference_low_delay(),
            scene_analysis: true,
            persistence_map: config.is_conference_low_delay(),
            buffer_hints: brc,
            brc,
            la_depth: config.gop_ref_dist.max(1),
        }
    }

    /// Keeps only tools present in both configurations.
    pub fn intersect(&self, other: &EncToolsConfig) -> EncToolsConfig {
        EncToolsConfig {
            adaptive_i: self.adaptive_i && other.adaptive_i,
            adaptive_b: self.adaptive_b && other.adaptive_b,
            adaptive_ltr: self.adaptive_ltr && other.adaptive_ltr,
            scene_analysis: self.scene_analysis && other.scene_analysis,
            persistence_map: self.persistence_map && other.persistence_map,
            buffer_hints: self.buffer_hints && other.buffer_hints,
            brc: self.brc && other.brc,
            la_depth: self.la_depth.min(other.la_depth),
        }
    }

    /// Frames have to go through pre-encode analysis.
    pub fn needs_analysis(&self) -> bool {
        self.adaptive_i
            || self.adaptive_b
            || self.adaptive_ltr
            || self.scene_analysis
            || self.persistence_map
            || self.buffer_hints
    }

    pub fn is_on(&self) -> bool {
        self.needs_analysis() || self.brc
    }
}

/// External look-ahead and bitrate control engine.
pub trait EncToolsEngine: Send {
    /// Tools the engine can provide for `config`.
    fn supported_config(&self, config: &EncodeConfig) -> EncToolsConfig;

    fn init(&mut self, requested: &EncToolsConfig, config: &EncodeConfig) -> Result<()>;

    /// Tools actually enabled by `init`.
    fn active_config(&self) -> EncToolsConfig;

    /// Frames the engine must see past a frame before its hints are final.
    fn delay_in_frames(&self) -> u32;

    /// `Ok(Status::MoreData)` means the buffers were accepted and the engine
    /// is still filling its look-ahead.
    fn submit(&mut self, buffers: &[EncToolsBuffer]) -> Result<Status>;

    /// Returns the requested buffers for `display_order`, or a not-ready
    /// status when they are not available yet.
    fn query(
        &mut self,
        display_order: u32,
        ids: &[EncToolsBufferId],
    ) -> Result<(Status, Vec<EncToolsBuffer>)>;

    /// Drops everything kept for `display_order`.
    fn discard(&mut self, display_order: u32) -> Result<()>;

    fn reset(&mut self, config: &EncodeConfig) -> Result<()>;

    fn close(&mut self);
}

/// Result of reporting a coded frame to BRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrcDecision {
    pub status: BrcStatus,
    /// Minimum coded size in bytes, for `PanicSmallFrame`.
    pub min_frame_size: u32,
}

const PRE_ENC_HINTS: [EncToolsBufferId; 4] = [
    EncToolsBufferId::SceneChange,
    EncToolsBufferId::GopHint,
    EncToolsBufferId::PersistenceMap,
    EncToolsBufferId::BufferHint,
];

/// Encoder side of the engine protocol.
pub struct Av1EncTools {
    engine: Box<dyn EncToolsEngine>,
    active: EncToolsConfig,
    max_delay: u32,
    last_submitted: Option<u32>,
    end_of_stream: bool,
}

impl std::fmt::Debug for Av1EncTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Av1EncTools")
            .field("active", &self.active)
            .field("max_delay", &self.max_delay)
            .field("last_submitted", &self.last_submitted)
            .finish_non_exhaustive()
    }
}

impl Av1EncTools {
    /// Negotiates the tool set with `engine` and initializes it.
    pub fn new(mut engine: Box<dyn EncToolsEngine>, config: &EncodeConfig) -> Result<Self> {
        let requested = EncToolsConfig::from_video_param(config);
        let supported = engine.supported_config(config);
        let requested = requested.intersect(&supported);
        engine.init(&requested, config)?;

        let active = engine.active_config();
        let max_delay = engine.delay_in_frames();
        info!(
            "EncTools initialized: brc={} scene_analysis={} adaptive_i={} delay={} frames",
            active.brc, active.scene_analysis, active.adaptive_i, max_delay
        );
        Ok(Self {
            engine,
            active,
            max_delay,
            last_submitted: None,
            end_of_stream: false,
        })
    }

    pub fn active_config(&self) -> &EncToolsConfig {
        &self.active
    }

    /// Look-ahead depth reported by the engine.
    pub fn delay(&self) -> u32 {
        if self.active.needs_analysis() {
            self.max_delay
        } else {
            0
        }
    }

    /// Pushes the task's input frame into look-ahead.
    pub fn submit_pre_enc_task(&mut self, task: &Task) -> Result<Status> {
        if !self.active.needs_analysis() {
            return Ok(Status::Ok);
        }
        let buffer = EncToolsBuffer::FrameToAnalyze {
            display_order: task.display_order,
            surface: task.surface.clone(),
        };
        let status = self.engine.submit(&[buffer])?;
        self.last_submitted = Some(task.display_order);
        trace!(display_order = task.display_order, ?status, "look-ahead submit");
        // The engine only buffered the frame.
        if status == Status::MoreData {
            return Ok(Status::Ok);
        }
        Ok(status)
    }

    /// Tells the engine that no more frames follow.
    pub fn submit_end_of_stream(&mut self) -> Result<()> {
        if !self.active.needs_analysis() || self.end_of_stream {
            return Ok(());
        }
        let display_order = self.last_submitted.map_or(0, |d| d + 1);
        self.engine.submit(&[EncToolsBuffer::FrameToAnalyze {
            display_order,
            surface: None,
        }])?;
        self.end_of_stream = true;
        Ok(())
    }

    /// Collects look-ahead hints for `task`.
    ///
    /// Returns `Status::MoreData` until the engine has seen `delay` frames
    /// past the task, unless the stream is being flushed.
    pub fn query_pre_enc_task(&mut self, task: &mut Task, flush: bool) -> Result<Status> {
        if !self.active.needs_analysis() {
            return Ok(Status::Ok);
        }
        let ready = flush
            || self.end_of_stream
            || self
                .last_submitted
                .is_some_and(|last| last >= task.display_order + self.max_delay);
        if !ready {
            return Ok(Status::MoreData);
        }
        if flush {
            self.submit_end_of_stream()?;
        }

        let (status, buffers) = self.engine.query(task.display_order, &PRE_ENC_HINTS)?;
        if status.is_not_ready() {
            return Ok(status);
        }
        for buffer in buffers {
            match buffer {
                EncToolsBuffer::SceneChange {
                    scene_change,
                    long_term,
                    ..
                } => {
                    task.hints.scene_change = scene_change;
                    task.hints.long_term = long_term && self.active.adaptive_ltr;
                }
                EncToolsBuffer::GopHint { frame_type, .. } => {
                    if self.active.adaptive_i || self.active.adaptive_b {
                        task.hints.frame_type = frame_type;
                    }
                }
                EncToolsBuffer::PersistenceMap { map, .. } => {
                    task.hints.persistence_map = Some(map);
                }
                EncToolsBuffer::BufferHint {
                    optimal_frame_size, ..
                } => {
                    task.hints.optimal_frame_size = Some(optimal_frame_size);
                }
                other => {
                    return Err(EncodeError::EncTools(format!(
                        "unexpected {:?} buffer in look-ahead query",
                        other.id()
                    )))
                }
            }
        }
        if task.hints.scene_change {
            debug!("Scene change at display order {}", task.display_order);
        }
        Ok(status)
    }

    /// Asks BRC for the quantizer of `task`.
    pub fn brc_get_ctrl(&mut self, task: &mut Task) -> Result<()> {
        if !self.active.brc {
            return Ok(());
        }
        let params = BrcFrameParams {
            display_order: task.display_order,
            encoded_order: task.encoded_order,
            frame_type: task.frame_type,
            pyramid_level: task.pyramid_level,
            scene_change: task.hints.scene_change,
            long_term: task.long_term_idx.is_some(),
            persistence_map: task.hints.persistence_map,
            num_recode: task.num_recode,
        };
        self.engine.submit(&[EncToolsBuffer::BrcFrameParams(params)])?;

        let (status, buffers) = self.engine.query(
            task.display_order,
            &[EncToolsBufferId::BrcQuantControl, EncToolsBufferId::BrcHrdPos],
        )?;
        if status.is_not_ready() {
            return Err(EncodeError::EncTools(format!(
                "no quantizer for display order {}",
                task.display_order
            )));
        }
        for buffer in buffers {
            match buffer {
                EncToolsBuffer::BrcQuantControl { qp, .. } => {
                    task.qp_y = qp.max(1);
                }
                EncToolsBuffer::BrcHrdPos {
                    buffer_fullness, ..
                } => {
                    trace!(display_order = task.display_order, buffer_fullness, "HRD position");
                }
                _ => {}
            }
        }
        debug!("BRC qp {} for display order {}", task.qp_y, task.display_order);
        Ok(())
    }

    /// Reports the coded size of `task` and returns the BRC verdict.
    pub fn brc_update(&mut self, task: &Task, coded_size: u32) -> Result<BrcDecision> {
        if !self.active.brc {
            return Ok(BrcDecision::default());
        }
        self.engine.submit(&[EncToolsBuffer::BrcEncodeResult {
            display_order: task.display_order,
            coded_size,
            qp: task.qp_y,
            num_recode: task.num_recode,
        }])?;
        let (_, buffers) = self
            .engine
            .query(task.display_order, &[EncToolsBufferId::BrcStatus])?;
        let decision = buffers
            .into_iter()
            .find_map(|b| match b {
                EncToolsBuffer::BrcStatus {
                    status,
                    min_frame_size,
                    ..
                } => Some(BrcDecision {
                    status,
                    min_frame_size,
                }),
                _ => None,
            })
            .unwrap_or_default();
        match decision.status {
            BrcStatus::Ok => {}
            BrcStatus::PanicBigFrame | BrcStatus::PanicSmallFrame => warn!(
                "BRC {:?} for display order {} ({} bytes)",
                decision.status, task.display_order, coded_size
            ),
            _ => debug!(
                "BRC {:?} for display order {} ({} bytes)",
                decision.status, task.display_order, coded_size
            ),
        }
        Ok(decision)
    }

    /// Frees engine state kept for a finished frame.
    pub fn discard(&mut self, display_order: u32) -> Result<()> {
        if !self.active.is_on() {
            return Ok(());
        }
        self.engine.discard(display_order)
    }

    pub fn reset(&mut self, config: &EncodeConfig) -> Result<()> {
        self.engine.reset(config)?;
        self.active = self.engine.active_config();
        self.max_delay = self.engine.delay_in_frames();
        self.last_submitted = None;
        self.end_of_stream = false;
        Ok(())
    }

    pub fn close(&mut self) {
        self.engine.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::general::defaults::set_defaults;

    fn config() -> EncodeConfig {
        let mut config = EncodeConfig::av1(64, 64)
            .with_enc_tools(true)
            .with_rate_control(RateControlMode::Cbr, 500)
            .with_gop(30, 1);
        set_defaults(&mut config);
        config
    }

    fn task(order: u32, luma: u8) -> Task {
        let mut task = Task::new(order as usize);
        task.display_order = order;
        task.frame_type = FrameType::P | FrameType::REF;
        task.surface = Some(Arc::new(RawSurface {
            data: vec![luma; 64 * 64 * 3 / 2],
            timestamp: order as u64,
        }));
        task
    }

    #[test]
    fn test_config_negotiation() {
        let config = config();
        let requested = EncToolsConfig::from_video_param(&config);
        assert!(requested.brc);
        assert!(requested.scene_analysis);
        assert!(!requested.adaptive_b);

        let off = EncodeConfig::av1(64, 64);
        assert!(!EncToolsConfig::from_video_param(&off).is_on());

        let narrowed = requested.intersect(&EncToolsConfig {
            brc: true,
            la_depth: 0,
            ..Default::default()
        });
        assert!(narrowed.brc);
        assert!(!narrowed.needs_analysis());
    }

    #[test]
    fn test_pre_enc_waits_for_delay() {
        let config = config();
        let mut tools = Av1EncTools::new(Box::new(BuiltinEncTools::new()), &config).unwrap();
        let delay = tools.delay();
        assert_eq!(delay, 1);

        let mut first = task(0, 16);
        tools.submit_pre_enc_task(&first).unwrap();
        assert_eq!(tools.query_pre_enc_task(&mut first, false).unwrap(), Status::MoreData);

        let second = task(1, 16);
        tools.submit_pre_enc_task(&second).unwrap();
        assert_eq!(tools.query_pre_enc_task(&mut first, false).unwrap(), Status::Ok);
        assert!(!first.hints.scene_change);
    }

    #[test]
    fn test_scene_change_hint() {
        let config = config();
        let mut tools = Av1EncTools::new(Box::new(BuiltinEncTools::new()), &config).unwrap();
        let mut tasks: Vec<Task> = [16u8, 16, 16, 200, 200]
            .iter()
            .enumerate()
            .map(|(i, &luma)| task(i as u32, luma))
            .collect();
        for t in &tasks {
            tools.submit_pre_enc_task(t).unwrap();
        }
        for t in tasks.iter_mut() {
            tools.query_pre_enc_task(t, true).unwrap();
        }
        assert!(!tasks[2].hints.scene_change);
        assert!(tasks[3].hints.scene_change);
        assert_eq!(tasks[3].hints.frame_type, Some(FrameType::I));
        assert!(!tasks[4].hints.scene_change);
    }

    #[test]
    fn test_brc_round_trip() {
        let config = config();
        let mut tools = Av1EncTools::new(Box::new(BuiltinEncTools::new()), &config).unwrap();
        let mut t = task(0, 16);
        t.frame_type = FrameType::I | FrameType::REF | FrameType::IDR;
        tools.brc_get_ctrl(&mut t).unwrap();
        assert!(t.qp_y >= 1);

        let decision = tools.brc_update(&t, 1_000_000).unwrap();
        assert_eq!(decision.status, BrcStatus::BigFrame);

        t.num_recode = config.max_recode;
        let decision = tools.brc_update(&t, 1_000_000).unwrap();
        assert_ne!(decision.status, BrcStatus::BigFrame);
        tools.discard(0).unwrap();
    }
}
