//! Encoder types, configuration, and shared utilities.
//!
//! This module provides:
//! - Core encoder types and configuration (`EncodeConfig`, `FrameCtrl`, `EncodedPacket`, etc.)
//! - GOP tagging (`gop`) and frame reordering for B-pyramids (`reorder`).
//! - DPB management, reference list construction and refresh decisions (`dpb`).
//! - Per-frame parameter derivation (`general`) and OBU packing (`packer`).
//! - The asynchronous task pipeline (`task_manager`, `pipeline`) driving a device.

pub mod av1;
pub mod bitwriter;
pub mod device;
pub mod dpb;
pub mod enctools;
pub mod general;
pub mod gop;
pub mod ivf;
pub mod packer;
pub mod pipeline;
pub mod reorder;
pub mod session;
pub mod task;
pub mod task_manager;

use bitflags::bitflags;

// Default encoder configuration constants.

/// Default target bitrate in kilobits per second.
pub const DEFAULT_TARGET_KBPS: u32 = 4_000;

/// Default frame rate (frames per second).
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Default GOP (Group of Pictures) size.
pub const DEFAULT_GOP_SIZE: u32 = 30;

/// Default distance between anchor frames when B-frames are allowed.
pub const DEFAULT_GOP_REF_DIST: u32 = 8;

/// Default base quantizer index for P-frames.
pub const DEFAULT_AV1_QP: u32 = 128;

/// Default number of frames in flight on the device.
pub const DEFAULT_ASYNC_DEPTH: u32 = 4;

/// Number of reference slots in the AV1 DPB.
pub const NUM_REF_FRAMES: usize = 8;

/// Number of reference names a frame may use (LAST..ALTREF).
pub const REFS_PER_FRAME: usize = 7;

/// Largest supported GopRefDist.
pub const MAX_GOP_REF_DIST: u32 = 16;

/// Largest base quantizer index.
pub const MAX_QP: u32 = 255;

/// Maximum frame dimension accepted by the hardware.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// GopPicSize value meaning "no periodic key frames".
pub const INFINITE_GOP: u32 = 0xFFFF;

/// Pixel format / chroma subsampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0 (half horizontal and vertical chroma resolution).
    #[default]
    Yuv420,
    /// YUV 4:2:2 (half horizontal chroma resolution).
    Yuv422,
    /// YUV 4:4:4 (full chroma resolution).
    Yuv444,
}

impl PixelFormat {
    /// Calculate frame size in bytes for given dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let luma_size = (width * height) as usize;
        match self {
            PixelFormat::Yuv420 => luma_size * 3 / 2,
            PixelFormat::Yuv422 => luma_size * 2,
            PixelFormat::Yuv444 => luma_size * 3,
        }
    }

    /// AV1 `seq_profile` carrying this chroma format.
    pub fn seq_profile(&self) -> u8 {
        match self {
            PixelFormat::Yuv420 => 0,
            PixelFormat::Yuv444 => 1,
            PixelFormat::Yuv422 => 2,
        }
    }

    /// `(subsampling_x, subsampling_y)`.
    pub fn subsampling(&self) -> (bool, bool) {
        match self {
            PixelFormat::Yuv420 => (true, true),
            PixelFormat::Yuv422 => (true, false),
            PixelFormat::Yuv444 => (false, false),
        }
    }
}

/// Bit depth for video encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit per component (standard).
    #[default]
    Eight,
    /// 10-bit per component (HDR).
    Ten,
}

impl BitDepth {
    pub fn bits(&self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Ten => 10,
        }
    }
}

/// Rate control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControlMode {
    /// Constant QP mode.
    #[default]
    Cqp,
    /// Constant bitrate mode.
    Cbr,
    /// Variable bitrate mode.
    Vbr,
}

/// How B-frames between two anchors are used as references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BRefType {
    /// Let the encoder pick from GopRefDist.
    #[default]
    Unknown,
    /// B-frames are never references.
    Off,
    /// The middle B-frame of each mini-GOP is a reference.
    Simple,
    /// Recursive bisection, every non-leaf B-frame is a reference.
    Pyramid,
}

/// Usage scenario hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scenario {
    #[default]
    Unknown,
    /// Low-delay video conferencing with periodic anchors.
    VideoConference,
}

/// CDEF control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdefMode {
    /// Strengths chosen from the frame quantizer.
    #[default]
    Auto,
    /// CDEF disabled in the sequence header.
    Off,
}

bitflags! {
    /// Frame type flags. A frame carries exactly one of I/P/B plus optional REF/IDR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameType: u16 {
        const I = 0x0001;
        const P = 0x0002;
        const B = 0x0004;
        /// The frame is kept in the DPB for later frames.
        const REF = 0x0040;
        /// Key frame starting a new coded video sequence.
        const IDR = 0x0080;
    }
}

impl FrameType {
    pub fn is_i(self) -> bool {
        self.contains(FrameType::I)
    }
    pub fn is_p(self) -> bool {
        self.contains(FrameType::P)
    }
    pub fn is_b(self) -> bool {
        self.contains(FrameType::B)
    }
    pub fn is_ref(self) -> bool {
        self.contains(FrameType::REF)
    }
    pub fn is_idr(self) -> bool {
        self.contains(FrameType::IDR)
    }
}

/// Video dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// SMPTE ST 2086 mastering display colour volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MasteringDisplay {
    /// `(x, y)` chromaticity of the R, G, B primaries in 0.16 fixed point.
    pub primaries: [(u16, u16); 3],
    /// White point chromaticity in 0.16 fixed point.
    pub white_point: (u16, u16),
    /// Maximum luminance in 24.8 fixed point.
    pub luminance_max: u32,
    /// Minimum luminance in 18.14 fixed point.
    pub luminance_min: u32,
}

/// CTA-861.3 content light level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentLightLevel {
    pub max_cll: u16,
    pub max_fall: u16,
}

/// HDR metadata emitted with every key frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrMetadata {
    pub mastering_display: Option<MasteringDisplay>,
    pub content_light: Option<ContentLightLevel>,
}

/// Quantizer deltas applied to DC/AC of each plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaQ {
    pub y_dc: i8,
    pub u_dc: i8,
    pub u_ac: i8,
    pub v_dc: i8,
    pub v_ac: i8,
}

impl DeltaQ {
    pub fn is_zero(&self) -> bool {
        *self == DeltaQ::default()
    }
}

/// Encode configuration.
///
/// Zero-valued numeric fields are resolved to defaults when the session is
/// initialized.
#[derive(Debug, Clone)]
#[must_use]
pub struct EncodeConfig {
    /// Video dimensions.
    pub dimensions: Dimensions,
    /// Largest dimensions a later `Reset` may switch to (zero: same as `dimensions`).
    pub max_dimensions: Option<Dimensions>,
    /// Pixel format (chroma subsampling).
    pub pixel_format: PixelFormat,
    /// Bit depth per component.
    pub bit_depth: BitDepth,
    /// Full-range (pc) samples instead of studio range.
    pub full_range: bool,
    /// Rate control mode.
    pub rate_control_mode: RateControlMode,
    /// Target bitrate in kbps.
    pub target_kbps: u32,
    /// Maximum bitrate in kbps (VBR).
    pub max_kbps: u32,
    /// Base quantizer index for I-frames (CQP).
    pub qp_i: u32,
    /// Base quantizer index for P-frames (CQP).
    pub qp_p: u32,
    /// Base quantizer index for B-frames (CQP).
    pub qp_b: u32,
    /// Per pyramid level quantizer offsets applied to B-frames.
    pub qp_offsets: Option<[i8; 8]>,
    /// Frame rate numerator.
    pub frame_rate_numerator: u32,
    /// Frame rate denominator.
    pub frame_rate_denominator: u32,
    /// Distance between key frames. `INFINITE_GOP` disables periodic key frames.
    pub gop_pic_size: u32,
    /// Distance between anchor frames (1: no B-frames).
    pub gop_ref_dist: u32,
    /// Key frames refresh every slot, so GOPs are always closed; kept for reporting.
    pub gop_closed: bool,
    /// Number of GOPs between IDR frames minus one.
    pub idr_interval: u32,
    /// B-frame reference structure.
    pub b_ref_type: BRefType,
    /// Number of distinct frames kept in the DPB.
    pub num_ref_frame: u32,
    /// Forward references used by P-frames.
    pub num_ref_active_p: u32,
    /// Forward references used by B-frames.
    pub num_ref_active_bl0: u32,
    /// Backward references used by B-frames.
    pub num_ref_active_bl1: u32,
    /// Code P-frames as compound-capable low-delay B-frames.
    pub low_delay_b: bool,
    /// Usage scenario.
    pub scenario: Scenario,
    /// Temporal layer scales (each divides the next, first is 1). Empty: one layer.
    pub temporal_layers: Vec<u32>,
    /// Frames that may be in flight on the device.
    pub async_depth: u32,
    /// Tile columns (zero: minimum legal).
    pub num_tile_columns: u32,
    /// Tile rows (zero: one).
    pub num_tile_rows: u32,
    /// CDEF control.
    pub cdef: CdefMode,
    /// Explicit loop filter levels `[y_vertical, y_horizontal, u, v]`.
    pub loop_filter_levels: Option<[u8; 4]>,
    /// Quantizer deltas.
    pub delta_q: DeltaQ,
    /// AV1 `seq_level_idx` (zero: derived from resolution and frame rate).
    pub level: u8,
    /// Route look-ahead and rate control through an EncTools engine.
    pub enc_tools: bool,
    /// Prefix the stream with IVF container headers.
    pub ivf: bool,
    /// Pack frame headers into OBU_FRAME instead of OBU_FRAME_HEADER.
    pub pack_obu_frame: bool,
    /// Every frame is coded with `error_resilient_mode`.
    pub error_resilient: bool,
    /// HDR metadata.
    pub hdr: Option<HdrMetadata>,
    /// Maximum re-encodes of one frame requested by rate control.
    pub max_recode: u32,
}

impl EncodeConfig {
    /// Create a new AV1 encode configuration with default settings.
    pub fn av1(width: u32, height: u32) -> Self {
        Self {
            dimensions: Dimensions { width, height },
            max_dimensions: None,
            pixel_format: PixelFormat::Yuv420,
            bit_depth: BitDepth::Eight,
            full_range: false,
            rate_control_mode: RateControlMode::Cqp,
            target_kbps: 0,
            max_kbps: 0,
            qp_i: 0,
            qp_p: 0,
            qp_b: 0,
            qp_offsets: None,
            frame_rate_numerator: DEFAULT_FRAME_RATE,
            frame_rate_denominator: 1,
            gop_pic_size: 0,
            gop_ref_dist: 0,
            gop_closed: true,
            idr_interval: 0,
            b_ref_type: BRefType::Unknown,
            num_ref_frame: 0,
            num_ref_active_p: 0,
            num_ref_active_bl0: 0,
            num_ref_active_bl1: 0,
            low_delay_b: false,
            scenario: Scenario::Unknown,
            temporal_layers: Vec::new(),
            async_depth: 0,
            num_tile_columns: 0,
            num_tile_rows: 0,
            cdef: CdefMode::Auto,
            loop_filter_levels: None,
            delta_q: DeltaQ::default(),
            level: 0,
            enc_tools: false,
            ivf: true,
            pack_obu_frame: false,
            error_resilient: false,
            hdr: None,
            max_recode: 2,
        }
    }

    /// Set the rate control mode and target bitrate.
    pub fn with_rate_control(mut self, mode: RateControlMode, target_kbps: u32) -> Self {
        self.rate_control_mode = mode;
        self.target_kbps = target_kbps;
        self
    }

    /// Set the maximum bitrate.
    pub fn with_max_kbps(mut self, max_kbps: u32) -> Self {
        self.max_kbps = max_kbps;
        self
    }

    /// Set the pixel format (chroma subsampling).
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Set the bit depth (8 or 10 bit).
    pub fn with_bit_depth(mut self, depth: BitDepth) -> Self {
        self.bit_depth = depth;
        self
    }

    /// Set the CQP quantizers for I, P and B frames.
    pub fn with_qp(mut self, qp_i: u32, qp_p: u32, qp_b: u32) -> Self {
        self.qp_i = qp_i;
        self.qp_p = qp_p;
        self.qp_b = qp_b;
        self
    }

    /// Set the frame rate.
    pub fn with_frame_rate(mut self, numerator: u32, denominator: u32) -> Self {
        self.frame_rate_numerator = numerator;
        self.frame_rate_denominator = denominator;
        self
    }

    /// Set the GOP size and anchor distance.
    pub fn with_gop(mut self, gop_pic_size: u32, gop_ref_dist: u32) -> Self {
        self.gop_pic_size = gop_pic_size;
        self.gop_ref_dist = gop_ref_dist;
        self
    }

    /// Set the B-frame reference structure.
    pub fn with_b_ref_type(mut self, b_ref_type: BRefType) -> Self {
        self.b_ref_type = b_ref_type;
        self
    }

    /// Set the number of reference frames kept in the DPB.
    pub fn with_num_ref_frame(mut self, count: u32) -> Self {
        self.num_ref_frame = count;
        self
    }

    /// Set the number of active references per list.
    pub fn with_active_refs(mut self, p: u32, bl0: u32, bl1: u32) -> Self {
        self.num_ref_active_p = p;
        self.num_ref_active_bl0 = bl0;
        self.num_ref_active_bl1 = bl1;
        self
    }

    /// Enable low-delay B coding.
    pub fn with_low_delay_b(mut self, enabled: bool) -> Self {
        self.low_delay_b = enabled;
        self
    }

    /// Set the usage scenario.
    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    /// Set the temporal layer scales.
    pub fn with_temporal_layers(mut self, scales: Vec<u32>) -> Self {
        self.temporal_layers = scales;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_async_depth(mut self, depth: u32) -> Self {
        self.async_depth = depth;
        self
    }

    /// Set the tile layout.
    pub fn with_tiles(mut self, columns: u32, rows: u32) -> Self {
        self.num_tile_columns = columns;
        self.num_tile_rows = rows;
        self
    }

    /// Route look-ahead and rate control through an EncTools engine.
    pub fn with_enc_tools(mut self, enabled: bool) -> Self {
        self.enc_tools = enabled;
        self
    }

    /// Enable or disable IVF container headers.
    pub fn with_ivf(mut self, enabled: bool) -> Self {
        self.ivf = enabled;
        self
    }

    /// Pack frame headers into OBU_FRAME units.
    pub fn with_obu_frame(mut self, enabled: bool) -> Self {
        self.pack_obu_frame = enabled;
        self
    }

    /// Attach HDR metadata.
    pub fn with_hdr(mut self, hdr: HdrMetadata) -> Self {
        self.hdr = Some(hdr);
        self
    }

    /// Set the CDEF mode.
    pub fn with_cdef(mut self, cdef: CdefMode) -> Self {
        self.cdef = cdef;
        self
    }

    /// Frame rate as a float, for logging and level derivation.
    pub fn frame_rate(&self) -> f64 {
        if self.frame_rate_denominator == 0 {
            return 0.0;
        }
        self.frame_rate_numerator as f64 / self.frame_rate_denominator as f64
    }

    /// True when the low-delay video-conference reference heuristics apply.
    pub fn is_conference_low_delay(&self) -> bool {
        self.scenario == Scenario::VideoConference && self.gop_ref_dist <= 1
    }
}

/// Application override of one reference frame, by display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefListEntry {
    pub frame_order: u32,
    pub long_term_idx: u16,
}

/// Application control of reference selection for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefListCtrl {
    /// Forward references to use (zero: encoder default).
    pub num_ref_idx_l0_active: u32,
    /// Backward references to use (zero: encoder default).
    pub num_ref_idx_l1_active: u32,
    /// Long-term references this frame should prefer (empty: every LTR).
    pub preferred: Vec<RefListEntry>,
    /// Frames that must not be referenced.
    pub rejected: Vec<RefListEntry>,
    /// Mark the current frame as long-term; the first entry's index is used.
    pub long_term: Vec<RefListEntry>,
}

/// Per-frame control supplied with a surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameCtrl {
    /// Forced frame type.
    pub frame_type: Option<FrameType>,
    /// Forced base quantizer index; zero requests lossless coding.
    pub qp: Option<u8>,
    /// Reference list control.
    pub ref_list: Option<RefListCtrl>,
}

/// Raw input picture. Shared with the task that encodes it.
#[derive(Debug, Clone, Default)]
pub struct RawSurface {
    pub data: Vec<u8>,
    pub timestamp: u64,
}

/// Encoded temporal unit.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Encoded bitstream data, including IVF framing when enabled.
    pub data: Vec<u8>,
    /// Type of the frame shown by this temporal unit.
    pub frame_type: FrameType,
    /// Whether this is a keyframe.
    pub is_key_frame: bool,
    /// Presentation timestamp.
    pub pts: u64,
    /// Encode order of the shown frame.
    pub dts: u64,
    /// Display order of the shown frame.
    pub display_order: u32,
    /// The temporal unit only re-shows an already decoded frame.
    pub show_existing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pixel_format_tests {
        use super::*;

        #[test]
        fn test_yuv420_frame_size() {
            let size = PixelFormat::Yuv420.frame_size(1920, 1080);
            assert_eq!(size, (1920 * 1080) * 3 / 2);
        }

        #[test]
        fn test_seq_profile() {
            assert_eq!(PixelFormat::Yuv420.seq_profile(), 0);
            assert_eq!(PixelFormat::Yuv444.seq_profile(), 1);
            assert_eq!(PixelFormat::Yuv422.seq_profile(), 2);
        }

        #[test]
        fn test_subsampling() {
            assert_eq!(PixelFormat::Yuv420.subsampling(), (true, true));
            assert_eq!(PixelFormat::Yuv444.subsampling(), (false, false));
        }
    }

    mod frame_type_tests {
        use super::*;

        #[test]
        fn test_flags() {
            let t = FrameType::I | FrameType::REF | FrameType::IDR;
            assert!(t.is_i());
            assert!(t.is_ref());
            assert!(t.is_idr());
            assert!(!t.is_b());

            let b = FrameType::B;
            assert!(b.is_b());
            assert!(!b.is_ref());
        }
    }

    mod encode_config_tests {
        use super::*;

        #[test]
        fn test_av1_defaults() {
            let config = EncodeConfig::av1(1920, 1080);

            assert_eq!(config.dimensions.width, 1920);
            assert_eq!(config.dimensions.height, 1080);
            assert_eq!(config.pixel_format, PixelFormat::Yuv420);
            assert_eq!(config.rate_control_mode, RateControlMode::Cqp);
            assert_eq!(config.gop_ref_dist, 0);
            assert!(config.ivf);
        }

        #[test]
        fn test_builder_chaining() {
            let config = EncodeConfig::av1(1280, 720)
                .with_rate_control(RateControlMode::Vbr, 3_000)
                .with_max_kbps(6_000)
                .with_gop(60, 4)
                .with_b_ref_type(BRefType::Pyramid)
                .with_frame_rate(60, 1)
                .with_bit_depth(BitDepth::Ten)
                .with_obu_frame(true);

            assert_eq!(config.rate_control_mode, RateControlMode::Vbr);
            assert_eq!(config.target_kbps, 3_000);
            assert_eq!(config.max_kbps, 6_000);
            assert_eq!(config.gop_pic_size, 60);
            assert_eq!(config.gop_ref_dist, 4);
            assert_eq!(config.bit_depth.bits(), 10);
            assert!(config.pack_obu_frame);
            assert_eq!(config.frame_rate(), 60.0);
        }

        #[test]
        fn test_conference_low_delay() {
            let config = EncodeConfig::av1(640, 360)
                .with_gop(INFINITE_GOP, 1)
                .with_scenario(Scenario::VideoConference);
            assert!(config.is_conference_low_delay());

            let config = config.with_gop(INFINITE_GOP, 4);
            assert!(!config.is_conference_low_delay());
        }
    }
}
