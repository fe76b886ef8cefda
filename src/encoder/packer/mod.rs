//! OBU packing: sequence header, frame header, temporal delimiter, HDR
//! metadata, padding and the fix-ups applied after the device ran.
//!
//! Every OBU is assembled in two passes. The payload is written into a
//! scratch writer first so its size is known, then the OBU header and the
//! LEB128 size are written to the real stream and the payload bits are
//! copied behind them.

pub mod frame;
pub mod hdr;
pub mod sequence;

use tracing::trace;

use crate::encoder::bitwriter::{encode_leb128, leb128_size, BitstreamWriter};
use crate::encoder::ivf::{write_ivf_frame_header, write_ivf_header, IVF_PIC_HEADER_SIZE, IVF_SEQ_HEADER_SIZE};
use crate::encoder::task::InsertHeaders;
use crate::encoder::EncodeConfig;
use crate::error::{EncodeError, Result};

pub use frame::{BitOffsets, FrameHeader};
pub use sequence::SequenceHeader;

/// Width of the OBU size field of an OBU_FRAME, patched once the tile data size is known.
pub const OBU_FRAME_SIZE_FIELD_BYTES: usize = 4;

/// OBU types used by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObuType {
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    Padding = 15,
}

/// Optional OBU extension carrying the scalability layer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObuExtension {
    pub temporal_id: u8,
    pub spatial_id: u8,
}

/// Writes an OBU header with `obu_has_size_field` set.
pub fn write_obu_header(w: &mut BitstreamWriter, obu_type: ObuType, ext: Option<ObuExtension>) {
    w.put_bit(false); // obu_forbidden_bit
    w.put_bits(obu_type as u64, 4);
    w.put_bit(ext.is_some());
    w.put_bit(true); // obu_has_size_field
    w.put_bit(false); // obu_reserved_1bit
    if let Some(ext) = ext {
        w.put_bits(ext.temporal_id as u64, 3);
        w.put_bits(ext.spatial_id as u64, 2);
        w.put_bits(0, 3);
    }
}

/// Wraps a finished, byte aligned payload into an OBU on `out`.
pub fn write_obu(
    out: &mut BitstreamWriter,
    obu_type: ObuType,
    ext: Option<ObuExtension>,
    mut payload: BitstreamWriter,
) -> Result<()> {
    debug_assert!(payload.is_byte_aligned(), "{obu_type:?} payload must end aligned");
    payload.byte_align();
    let bits = payload.bit_offset();
    let bytes = payload.finish();
    write_obu_header(out, obu_type, ext);
    out.put_leb128(bytes.len() as u64, None)?;
    out.put_bits_buffer(&bytes, bits);
    Ok(())
}

/// Temporal delimiter OBU.
pub fn temporal_delimiter() -> [u8; 2] {
    [(ObuType::TemporalDelimiter as u8) << 3 | 0x02, 0x00]
}

/// Padding OBU whose total size is at least `min_total` bytes.
pub fn pack_padding(min_total: usize) -> Result<Vec<u8>> {
    // header byte plus a size field of at least one byte
    let mut payload = min_total.saturating_sub(2);
    while 1 + leb128_size(payload as u64) + payload < min_total {
        payload += 1;
    }
    let mut w = BitstreamWriter::with_capacity(min_total);
    write_obu_header(&mut w, ObuType::Padding, None);
    w.put_leb128(payload as u64, None)?;
    let mut out = w.finish();
    out.resize(out.len() + payload, 0);
    Ok(out)
}

/// Headers packed in front of a frame's tile data.
#[derive(Debug, Clone, Default)]
pub struct PackedHeaders {
    pub data: Vec<u8>,
    pub offsets: BitOffsets,
    /// Byte offset of the IVF frame header placeholder, when present.
    pub ivf_frame_header: Option<usize>,
    /// Length of the temporal-unit prefix (IVF headers and delimiter).
    pub tu_prefix_len: usize,
}

/// Packs all per-frame headers. Holds the sequence-level OBUs that do not
/// change between frames.
pub struct Packer {
    sequence_obu: Vec<u8>,
    hdr_obus: Vec<u8>,
    ivf_header: Vec<u8>,
    layered: bool,
}

impl Packer {
    pub fn new(sh: &SequenceHeader, config: &EncodeConfig) -> Result<Self> {
        let sequence_obu = Self::pack_sps(sh)?;
        let hdr_obus = match &config.hdr {
            Some(hdr) => hdr::pack_hdr_metadata(hdr)?,
            None => Vec::new(),
        };
        let mut ivf_header = Vec::with_capacity(IVF_SEQ_HEADER_SIZE);
        write_ivf_header(
            &mut ivf_header,
            config.dimensions.width as u16,
            config.dimensions.height as u16,
            config.frame_rate_numerator,
            config.frame_rate_denominator,
            0,
        )?;
        Ok(Self {
            sequence_obu,
            hdr_obus,
            ivf_header,
            layered: sh.num_temporal_layers() > 1,
        })
    }

    /// Packs the sequence header OBU.
    pub fn pack_sps(sh: &SequenceHeader) -> Result<Vec<u8>> {
        let mut payload = BitstreamWriter::with_capacity(32);
        sh.write(&mut payload);
        payload.put_trailing_bits();

        let mut out = BitstreamWriter::with_capacity(34);
        write_obu(&mut out, ObuType::SequenceHeader, None, payload)?;
        Ok(out.finish())
    }

    /// Packs the frame header as OBU_FRAME_HEADER, or as the header part of
    /// an OBU_FRAME whose size field is left for [`patch_obu_frame_size`].
    ///
    /// Offsets are returned relative to the start of `out`.
    pub fn pack_pps(
        sh: &SequenceHeader,
        fh: &FrameHeader,
        ext: Option<ObuExtension>,
        obu_frame: bool,
        out: &mut BitstreamWriter,
    ) -> Result<BitOffsets> {
        let mut offsets = BitOffsets::default();
        let mut payload = BitstreamWriter::with_capacity(64);
        fh.write(sh, &mut payload, &mut offsets);

        let obu_frame = obu_frame && !fh.show_existing_frame;
        if obu_frame {
            payload.byte_align();
        } else {
            payload.put_trailing_bits();
        }
        let payload_bits = payload.bit_offset();
        let bytes = payload.finish();

        if obu_frame {
            write_obu_header(out, ObuType::Frame, ext);
            offsets.obu_size_byte_offset = Some(out.byte_offset() as u32);
            out.put_leb128(bytes.len() as u64, Some(OBU_FRAME_SIZE_FIELD_BYTES))?;
        } else {
            write_obu_header(out, ObuType::FrameHeader, ext);
            out.put_leb128(bytes.len() as u64, None)?;
        }

        let base = out.bit_offset();
        out.put_bits_buffer(&bytes, payload_bits);
        offsets.q_index += base;
        offsets.segmentation += base;
        offsets.loop_filter += base;
        offsets.cdef += base;
        offsets.loop_restoration += base;
        Ok(offsets)
    }

    fn extension(&self, temporal_id: u8) -> Option<ObuExtension> {
        self.layered.then_some(ObuExtension {
            temporal_id,
            spatial_id: 0,
        })
    }

    /// Packs the headers placed in front of the frame's tile data, in
    /// bitstream order: IVF stream header, IVF frame header, temporal
    /// delimiter, sequence header, HDR metadata, frame header.
    pub fn pack_headers(
        &self,
        sh: &SequenceHeader,
        fh: &FrameHeader,
        insert: InsertHeaders,
        temporal_id: u8,
    ) -> Result<PackedHeaders> {
        let mut prefix = Vec::new();
        let mut ivf_frame_header = None;
        if insert.contains(InsertHeaders::IVF_SEQ) {
            prefix.extend_from_slice(&self.ivf_header);
        }
        if insert.contains(InsertHeaders::IVF_FRAME) {
            ivf_frame_header = Some(prefix.len());
            write_ivf_frame_header(&mut prefix, 0, 0)?;
        }
        if insert.contains(InsertHeaders::TD) {
            prefix.extend_from_slice(&temporal_delimiter());
        }
        let tu_prefix_len = prefix.len();

        let mut w = BitstreamWriter::with_capacity(prefix.len() + 128);
        w.put_bits_buffer(&prefix, prefix.len() as u32 * 8);
        if insert.contains(InsertHeaders::SPS) {
            w.put_bits_buffer(&self.sequence_obu, self.sequence_obu.len() as u32 * 8);
        }
        if insert.contains(InsertHeaders::HDR) && !self.hdr_obus.is_empty() {
            w.put_bits_buffer(&self.hdr_obus, self.hdr_obus.len() as u32 * 8);
        }

        let mut offsets = BitOffsets::default();
        if insert.contains(InsertHeaders::PPS) {
            offsets = Self::pack_pps(
                sh,
                fh,
                self.extension(temporal_id),
                insert.contains(InsertHeaders::OBU_FRAME),
                &mut w,
            )?;
        }

        let data = w.finish();
        trace!(
            bytes = data.len(),
            ?insert,
            q_index_bit = offsets.q_index,
            "packed frame headers"
        );
        Ok(PackedHeaders {
            data,
            offsets,
            ivf_frame_header,
            tu_prefix_len,
        })
    }

    /// Packs a standalone temporal unit re-showing DPB slot `slot`.
    pub fn pack_show_existing(
        &self,
        sh: &SequenceHeader,
        slot: u8,
        temporal_id: u8,
        ivf: bool,
    ) -> Result<PackedHeaders> {
        let fh = FrameHeader {
            show_existing_frame: true,
            frame_to_show_map_idx: slot,
            ..Default::default()
        };
        let mut insert = InsertHeaders::TD | InsertHeaders::PPS;
        if ivf {
            insert |= InsertHeaders::IVF_FRAME;
        }
        self.pack_headers(sh, &fh, insert, temporal_id)
    }

    /// Wraps the device's tile data into an OBU_TILE_GROUP.
    pub fn pack_tile_group(&self, tile_data: &[u8], temporal_id: u8) -> Result<Vec<u8>> {
        let mut w = BitstreamWriter::with_capacity(tile_data.len() + 8);
        write_obu_header(&mut w, ObuType::TileGroup, self.extension(temporal_id));
        w.put_leb128(tile_data.len() as u64, None)?;
        let mut out = w.finish();
        out.extend_from_slice(tile_data);
        Ok(out)
    }
}

/// Rewrites the 8-bit `base_q_idx` at its recorded bit position.
pub fn patch_qindex(data: &mut [u8], offsets: &BitOffsets, q_index: u8) -> Result<()> {
    let bit = offsets.q_index as usize;
    let byte = bit / 8;
    let shift = bit % 8;
    let needed = byte + if shift == 0 { 1 } else { 2 };
    if data.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            available: data.len(),
        });
    }
    if shift == 0 {
        data[byte] = q_index;
    } else {
        let hi_mask = 0xFFu8 << (8 - shift);
        data[byte] = (data[byte] & hi_mask) | (q_index >> shift);
        let lo_mask = 0xFFu8 >> shift;
        data[byte + 1] = (data[byte + 1] & lo_mask) | (q_index << (8 - shift));
    }
    Ok(())
}

/// Rewrites the fixed-width OBU_FRAME size once the tile data size is known.
pub fn patch_obu_frame_size(data: &mut [u8], offsets: &BitOffsets, tile_data_len: usize) -> Result<()> {
    let Some(pos) = offsets.obu_size_byte_offset else {
        return Ok(());
    };
    let pos = pos as usize;
    let end = pos + OBU_FRAME_SIZE_FIELD_BYTES;
    if data.len() < end {
        return Err(EncodeError::BufferTooSmall {
            needed: end,
            available: data.len(),
        });
    }
    let header_bytes = (offsets.frame_header_size as usize).div_ceil(8);
    let size = (header_bytes + tile_data_len) as u64;
    encode_leb128(size, Some(OBU_FRAME_SIZE_FIELD_BYTES), &mut data[pos..end])?;
    Ok(())
}

/// Total size of a temporal unit prefixed by an IVF frame header.
pub fn ivf_payload_size(tu_len: usize) -> u32 {
    tu_len.saturating_sub(IVF_PIC_HEADER_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::bitwriter::decode_leb128;
    use crate::encoder::general::templates::{make_frame_header_template, make_sequence_header};
    use crate::encoder::general::defaults::set_defaults;
    use crate::encoder::packer::frame::{Av1FrameType, ALL_REF_FRAMES_MASK};

    fn setup() -> (EncodeConfig, SequenceHeader, FrameHeader) {
        let mut config = EncodeConfig::av1(640, 480);
        set_defaults(&mut config);
        let sh = make_sequence_header(&config);
        let mut fh = make_frame_header_template(&sh, &config);
        fh.frame_type = Av1FrameType::Key;
        fh.show_frame = true;
        fh.refresh_frame_flags = ALL_REF_FRAMES_MASK;
        fh.quantization.base_q_idx = 120;
        (config, sh, fh)
    }

    #[test]
    fn test_temporal_delimiter() {
        assert_eq!(temporal_delimiter(), [0x12, 0x00]);
    }

    #[test]
    fn test_sequence_header_obu() {
        let (_, sh, _) = setup();
        let obu = Packer::pack_sps(&sh).unwrap();
        assert_eq!(obu[0], 0x0A);
        let (size, n) = decode_leb128(&obu[1..]).unwrap();
        assert_eq!(obu.len(), 1 + n + size as usize);
    }

    #[test]
    fn test_frame_header_obu_size_matches() {
        let (_, sh, fh) = setup();
        let mut w = BitstreamWriter::new();
        Packer::pack_pps(&sh, &fh, None, false, &mut w).unwrap();
        let obu = w.finish();
        assert_eq!(obu[0], 0x1A);
        let (size, n) = decode_leb128(&obu[1..]).unwrap();
        assert_eq!(obu.len(), 1 + n + size as usize);
    }

    #[test]
    fn test_obu_frame_size_patch() {
        let (_, sh, fh) = setup();
        let mut w = BitstreamWriter::new();
        let offsets = Packer::pack_pps(&sh, &fh, None, true, &mut w).unwrap();
        let mut obu = w.finish();
        assert_eq!(obu[0], 0x32);
        assert_eq!(offsets.obu_size_byte_offset, Some(1));

        let header_len = obu.len() - 1 - OBU_FRAME_SIZE_FIELD_BYTES;
        patch_obu_frame_size(&mut obu, &offsets, 1000).unwrap();
        let (size, n) = decode_leb128(&obu[1..]).unwrap();
        assert_eq!(n, OBU_FRAME_SIZE_FIELD_BYTES);
        assert_eq!(size as usize, header_len + 1000);
    }

    #[test]
    fn test_patch_qindex_in_packed_headers() {
        let (config, sh, fh) = setup();
        let packer = Packer::new(&sh, &config).unwrap();
        let insert = InsertHeaders::IVF_SEQ
            | InsertHeaders::IVF_FRAME
            | InsertHeaders::TD
            | InsertHeaders::SPS
            | InsertHeaders::PPS;
        let mut packed = packer.pack_headers(&sh, &fh, insert, 0).unwrap();
        assert_eq!(packed.ivf_frame_header, Some(IVF_SEQ_HEADER_SIZE));
        assert_eq!(packed.tu_prefix_len, IVF_SEQ_HEADER_SIZE + IVF_PIC_HEADER_SIZE + 2);

        patch_qindex(&mut packed.data, &packed.offsets, 77).unwrap();

        let mut refh = fh.clone();
        refh.quantization.base_q_idx = 77;
        let expected = packer.pack_headers(&sh, &refh, insert, 0).unwrap();
        assert_eq!(packed.data, expected.data);
    }

    #[test]
    fn test_show_existing_unit() {
        let (config, sh, _) = setup();
        let packer = Packer::new(&sh, &config).unwrap();
        let unit = packer.pack_show_existing(&sh, 3, 0, true).unwrap();
        assert_eq!(unit.ivf_frame_header, Some(0));
        // IVF frame header, TD, OBU header, size 1, payload 1 | 011 | 1000
        assert_eq!(unit.data.len(), IVF_PIC_HEADER_SIZE + 2 + 3);
        assert_eq!(&unit.data[12..], &[0x12, 0x00, 0x1A, 0x01, 0b1011_1000]);
    }

    #[test]
    fn test_tile_group_wrap() {
        let (config, sh, _) = setup();
        let packer = Packer::new(&sh, &config).unwrap();
        let tiles = vec![0xAB; 200];
        let obu = packer.pack_tile_group(&tiles, 0).unwrap();
        assert_eq!(obu[0], 0x22);
        assert_eq!(decode_leb128(&obu[1..]), Some((200, 2)));
        assert_eq!(&obu[3..], &tiles[..]);
    }

    #[test]
    fn test_padding_size() {
        for min in [2usize, 3, 100, 129, 130, 131, 1000] {
            let pad = pack_padding(min).unwrap();
            assert!(pad.len() >= min, "padding {} < {}", pad.len(), min);
            assert!(pad.len() <= min + 1);
            assert_eq!(pad[0], 0x7A);
        }
    }

    #[test]
    fn test_obu_extension() {
        let mut w = BitstreamWriter::new();
        write_obu_header(
            &mut w,
            ObuType::FrameHeader,
            Some(ObuExtension {
                temporal_id: 2,
                spatial_id: 0,
            }),
        );
        assert_eq!(w.finish(), vec![0x1E, 0b0100_0000]);
    }
}
