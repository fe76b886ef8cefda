//! Shared encoder state and output assembly.
//!
//! [`EncoderCore`] is everything the pipeline blocks work on besides the task
//! itself. [`OutputCache`] turns finished frames into temporal units: hidden
//! frames wait for the next shown frame, show-existing units follow the frame
//! that made them due, and nothing leaves before every earlier frame did.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::encoder::device::EncodeDevice;
use crate::encoder::dpb::FramePool;
use crate::encoder::enctools::Av1EncTools;
use crate::encoder::general::{EncoderSessionState, General};
use crate::encoder::gop::GopStructure;
use crate::encoder::ivf::patch_ivf_frame_info;
use crate::encoder::packer::{ivf_payload_size, Packer};
use crate::encoder::reorder::{ReorderStrategy, Reorderer};
use crate::encoder::task::{RepeatedFrame, Task};
use crate::encoder::{EncodeConfig, EncodedPacket, FrameType, NUM_REF_FRAMES};
use crate::error::{EncodeError, Result};

/// One frame's finished bitstream, waiting for its turn in the output.
#[derive(Debug, Clone, Default)]
pub struct FrameOutput {
    pub encoded_order: u32,
    pub display_order: u32,
    pub timestamp: u64,
    pub frame_type: FrameType,
    pub shown: bool,
    /// Rate control dropped the frame; only its temporal unit bookkeeping remains.
    pub skipped: bool,
    pub data: Vec<u8>,
    pub ivf_frame_header: Option<usize>,
    pub repeated: Vec<RepeatedFrame>,
}

impl FrameOutput {
    /// Collects the output of a queried task, leaving the task's buffers empty.
    pub fn from_task(task: &mut Task, data: Vec<u8>) -> Self {
        Self {
            encoded_order: task.encoded_order,
            display_order: task.display_order,
            timestamp: task.timestamp,
            frame_type: task.frame_type,
            shown: task.is_shown(),
            skipped: task.skip,
            ivf_frame_header: task.headers.ivf_frame_header,
            data,
            repeated: std::mem::take(&mut task.repeated),
        }
    }

    /// Placeholder for a configured task that was cancelled.
    pub fn cancelled(encoded_order: u32) -> Self {
        Self {
            encoded_order,
            skipped: true,
            ..Default::default()
        }
    }
}

/// Reorders finished frames back into bitstream order and builds packets.
#[derive(Debug, Default)]
pub struct OutputCache {
    next_encoded: u32,
    ready: BTreeMap<u32, FrameOutput>,
    /// Temporal unit under construction.
    tu: Vec<u8>,
    tu_ivf: Option<usize>,
    /// Timestamps of hidden frames, for their show-existing units.
    hidden_pts: BTreeMap<u32, u64>,
    emitted: u64,
    packets: VecDeque<EncodedPacket>,
}

impl OutputCache {
    /// Starts expecting frames from `next_encoded` on.
    pub fn new(next_encoded: u32) -> Self {
        Self {
            next_encoded,
            ..Default::default()
        }
    }

    /// Adds a finished frame and releases every temporal unit that is complete.
    pub fn push(&mut self, out: FrameOutput) -> Result<()> {
        trace!(
            encoded_order = out.encoded_order,
            bytes = out.data.len(),
            shown = out.shown,
            "output cached"
        );
        self.ready.insert(out.encoded_order, out);
        while let Some(out) = self.ready.remove(&self.next_encoded) {
            self.next_encoded += 1;
            self.emit(out)?;
        }
        Ok(())
    }

    /// Takes a frame rate control dropped after it was configured.
    ///
    /// Every earlier frame must already be out; the dropped frame's encode
    /// order is not consumed and goes to the next frame.
    pub fn drop_frame(&mut self, out: FrameOutput) -> Result<()> {
        if out.encoded_order != self.next_encoded || !self.ready.is_empty() {
            return Err(EncodeError::InvalidDpbState(format!(
                "dropped frame {} at encode order {} while order {} is still expected",
                out.display_order, out.encoded_order, self.next_encoded
            )));
        }
        debug!("Output: display {} dropped by rate control", out.display_order);
        self.emit(FrameOutput {
            skipped: true,
            ..out
        })
    }

    fn emit(&mut self, out: FrameOutput) -> Result<()> {
        if out.skipped {
            if out.shown && !self.tu.is_empty() {
                self.finish_tu(out.display_order, out.timestamp, out.frame_type)?;
            }
        } else {
            if self.tu.is_empty() {
                self.tu_ivf = out.ivf_frame_header;
            }
            self.tu.extend_from_slice(&out.data);
            if !out.shown {
                self.hidden_pts.insert(out.display_order, out.timestamp);
                return Ok(());
            }
            self.finish_tu(out.display_order, out.timestamp, out.frame_type)?;
        }
        for repeated in out.repeated {
            self.emit_repeated(repeated)?;
        }
        Ok(())
    }

    fn finish_tu(&mut self, display_order: u32, pts: u64, frame_type: FrameType) -> Result<()> {
        let mut data = std::mem::take(&mut self.tu);
        if let Some(off) = self.tu_ivf.take() {
            let size = ivf_payload_size(data.len() - off);
            patch_ivf_frame_info(&mut data[off..], size, pts)?;
        }
        self.push_packet(EncodedPacket {
            data,
            frame_type,
            is_key_frame: frame_type.is_i(),
            pts,
            dts: 0,
            display_order,
            show_existing: false,
        });
        Ok(())
    }

    fn emit_repeated(&mut self, repeated: RepeatedFrame) -> Result<()> {
        let RepeatedFrame {
            show,
            mut data,
            ivf_frame_header,
        } = repeated;
        let pts = self
            .hidden_pts
            .remove(&show.display_order)
            .unwrap_or(show.display_order as u64);
        if let Some(off) = ivf_frame_header {
            let size = ivf_payload_size(data.len() - off);
            patch_ivf_frame_info(&mut data[off..], size, pts)?;
        }
        self.push_packet(EncodedPacket {
            data,
            frame_type: show.frame_type,
            is_key_frame: false,
            pts,
            dts: 0,
            display_order: show.display_order,
            show_existing: true,
        });
        Ok(())
    }

    fn push_packet(&mut self, mut packet: EncodedPacket) {
        packet.dts = self.emitted;
        self.emitted += 1;
        debug!(
            "Output TU: display={} bytes={} key={} show_existing={}",
            packet.display_order,
            packet.data.len(),
            packet.is_key_frame,
            packet.show_existing
        );
        self.packets.push_back(packet);
    }

    /// Drops a half-built temporal unit whose shown frame will never arrive.
    pub fn discard_pending(&mut self) {
        self.tu.clear();
        self.tu_ivf = None;
        self.hidden_pts.clear();
        self.ready.clear();
    }

    pub fn next_encoded(&self) -> u32 {
        self.next_encoded
    }

    /// Re-aligns the expected encode order, e.g. after cancelled tasks.
    pub fn set_next_encoded(&mut self, next_encoded: u32) {
        self.next_encoded = next_encoded;
    }

    pub fn take_packets(&mut self) -> Vec<EncodedPacket> {
        self.packets.drain(..).collect()
    }

    pub fn has_packets(&self) -> bool {
        !self.packets.is_empty()
    }
}

/// Size of the reconstructed-surface arena for `num_task` tasks.
///
/// Besides the session DPB and one target per task, every task in flight may
/// still pin a frame the session DPB already dropped.
pub fn rec_pool_size(num_task: usize) -> usize {
    2 * num_task + NUM_REF_FRAMES + 1
}

/// Bytes of one input surface; samples above 8 bits take two bytes.
pub fn input_frame_size(config: &EncodeConfig) -> usize {
    let samples = config
        .pixel_format
        .frame_size(config.dimensions.width, config.dimensions.height);
    if config.bit_depth.bits() > 8 {
        samples * 2
    } else {
        samples
    }
}

/// Everything the pipeline blocks share.
pub struct EncoderCore {
    pub general: General,
    pub packer: Packer,
    pub gop: GopStructure,
    pub reorderer: Box<dyn ReorderStrategy>,
    pub state: EncoderSessionState,
    pub pool: FramePool,
    pub enc_tools: Option<Av1EncTools>,
    pub device: Box<dyn EncodeDevice>,
    pub output: OutputCache,
    /// Display order of the next input frame.
    pub next_display_order: u32,
    /// Size in bytes every input surface must have.
    pub frame_size: usize,
}

impl EncoderCore {
    pub fn new(
        general: General,
        device: Box<dyn EncodeDevice>,
        enc_tools: Option<Av1EncTools>,
        num_task: usize,
    ) -> Result<Self> {
        let config = &general.config;
        let packer = Packer::new(&general.sh, config)?;
        let frame_size = input_frame_size(config);
        Ok(Self {
            packer,
            gop: GopStructure::new(config),
            reorderer: Box::new(Reorderer::new(config.b_ref_type)),
            state: EncoderSessionState::default(),
            pool: FramePool::new(rec_pool_size(num_task)),
            enc_tools,
            device,
            output: OutputCache::new(0),
            next_display_order: 0,
            frame_size,
            general,
        })
    }

    /// Look-ahead depth in frames, zero without look-ahead.
    pub fn la_delay(&self) -> u32 {
        self.enc_tools.as_ref().map_or(0, |e| e.delay())
    }

    /// True when rate control decides quantizers and may ask for a recode.
    pub fn brc_active(&self) -> bool {
        self.enc_tools.as_ref().is_some_and(|e| e.active_config().brc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::task::ShowFrame;
    use crate::encoder::ivf::IVF_PIC_HEADER_SIZE;

    fn with_ivf(order: u32, shown: bool, payload: &[u8]) -> FrameOutput {
        let mut data = vec![0u8; IVF_PIC_HEADER_SIZE];
        data.extend_from_slice(payload);
        FrameOutput {
            encoded_order: order,
            display_order: order,
            timestamp: 1000 + order as u64,
            frame_type: FrameType::P | FrameType::REF,
            shown,
            data,
            ivf_frame_header: Some(0),
            ..Default::default()
        }
    }

    fn plain(order: u32, display: u32, shown: bool, payload: &[u8]) -> FrameOutput {
        FrameOutput {
            encoded_order: order,
            display_order: display,
            timestamp: 1000 + display as u64,
            frame_type: FrameType::B,
            shown,
            data: payload.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ivf_size_patched() {
        let mut cache = OutputCache::new(0);
        cache.push(with_ivf(0, true, &[1, 2, 3])).unwrap();
        let packets = cache.take_packets();
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(&data[0..4], &3u32.to_le_bytes());
        assert_eq!(&data[4..12], &1000u64.to_le_bytes());
        assert_eq!(packets[0].dts, 0);
    }

    #[test]
    fn test_hidden_frame_joins_next_tu() {
        let mut cache = OutputCache::new(0);
        let mut hidden = with_ivf(0, false, &[9, 9]);
        hidden.display_order = 4;
        cache.push(hidden).unwrap();
        assert!(!cache.has_packets());
        let mut shown = plain(1, 1, true, &[7]);
        shown.repeated.push(RepeatedFrame {
            show: ShowFrame {
                slot: 2,
                display_order: 4,
                encoded_order: 0,
                frame_type: FrameType::P | FrameType::REF,
            },
            data: vec![0; IVF_PIC_HEADER_SIZE + 2],
            ivf_frame_header: Some(0),
        });
        cache.push(shown).unwrap();

        let packets = cache.take_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].data[0..4], &3u32.to_le_bytes());
        assert_eq!(&packets[0].data[IVF_PIC_HEADER_SIZE..], &[9, 9, 7]);
        assert_eq!(packets[0].display_order, 1);
        assert!(packets[1].show_existing);
        assert_eq!(packets[1].pts, 1004);
        assert_eq!(&packets[1].data[0..4], &2u32.to_le_bytes());
        assert_eq!(packets[1].dts, 1);
    }

    #[test]
    fn test_out_of_order_completion_waits() {
        let mut cache = OutputCache::new(5);
        cache.push(plain(6, 6, true, &[2])).unwrap();
        assert!(!cache.has_packets());
        cache.push(plain(5, 5, true, &[1])).unwrap();
        let orders: Vec<u32> = cache.take_packets().iter().map(|p| p.display_order).collect();
        assert_eq!(orders, vec![5, 6]);
    }

    #[test]
    fn test_skipped_frame_emits_nothing() {
        let mut cache = OutputCache::new(0);
        let mut skipped = plain(0, 0, true, &[1, 2]);
        skipped.skipped = true;
        cache.push(skipped).unwrap();
        cache.push(plain(1, 1, true, &[3])).unwrap();
        let packets = cache.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![3]);
        assert_eq!(packets[0].dts, 0);
    }

    #[test]
    fn test_dropped_frame_hands_on_encode_order() {
        let mut cache = OutputCache::new(0);
        cache.push(plain(0, 0, true, &[1])).unwrap();
        cache.drop_frame(plain(1, 1, true, &[2, 2])).unwrap();
        assert_eq!(cache.next_encoded(), 1);
        cache.push(plain(1, 2, true, &[3])).unwrap();

        let packets = cache.take_packets();
        let shown: Vec<(u32, u64)> = packets.iter().map(|p| (p.display_order, p.dts)).collect();
        assert_eq!(shown, vec![(0, 0), (2, 1)]);
        assert_eq!(packets[1].data, vec![3]);

        // Only the frame the cache waits for can be dropped.
        assert!(cache.drop_frame(plain(5, 5, true, &[])).is_err());
    }

    #[test]
    fn test_pool_size_covers_dpb() {
        assert!(rec_pool_size(1) > NUM_REF_FRAMES + 1);
    }
}
