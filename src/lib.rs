//! AV1 hardware encode session layer.
//!
//! The crate drives an encode device through an asynchronous task pipeline:
//! input frames are tagged with a GOP position, reordered for B-frame
//! pyramids, given reference lists and DPB refresh decisions, packed into
//! OBU headers, submitted, and assembled into temporal units, optionally
//! framed as IVF.
//!
//! The device itself sits behind [`EncodeDevice`]. [`SyntheticDevice`] is a
//! software stand-in that produces deterministic tile data.
//!
//! ```no_run
//! use av1_hwenc::{Av1Encoder, EncodeConfig, RawSurface, SyntheticDevice};
//!
//! # fn main() -> av1_hwenc::Result<()> {
//! let config = EncodeConfig::av1(320, 240).with_gop(30, 1);
//! let device = Box::new(SyntheticDevice::new(320, 240));
//! let mut encoder = Av1Encoder::new(config, device, None)?;
//!
//! let frame = RawSurface {
//!     data: vec![0u8; 320 * 240 * 3 / 2],
//!     timestamp: 0,
//! };
//! let mut packets = encoder.encode(frame, None)?;
//! packets.extend(encoder.flush()?);
//! # Ok(())
//! # }
//! ```

pub mod encoder;
pub mod error;

pub use encoder::av1::Av1Encoder;
pub use encoder::device::{DeviceFrame, DeviceOutput, EncodeDevice, SyntheticDevice};
pub use encoder::enctools::{EncToolsConfig, EncToolsEngine};
pub use encoder::{
    BRefType, BitDepth, CdefMode, Dimensions, EncodeConfig, EncodedPacket, FrameCtrl, FrameType,
    HdrMetadata, PixelFormat, RateControlMode, RawSurface, Scenario,
};
pub use error::{EncodeError, Result, Status};
