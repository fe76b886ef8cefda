//! IVF container framing.
//!
//! The stream header is written once, before the first temporal unit. Each
//! temporal unit gets a 12-byte frame header whose size and timestamp are
//! only known after the device finished, so it is emitted as a placeholder
//! and patched in place.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{EncodeError, Result};

/// Size of the IVF stream header.
pub const IVF_SEQ_HEADER_SIZE: usize = 32;

/// Size of the IVF frame header.
pub const IVF_PIC_HEADER_SIZE: usize = 12;

/// Writes the 32-byte IVF stream header.
pub fn write_ivf_header(
    out: &mut Vec<u8>,
    width: u16,
    height: u16,
    frame_rate_num: u32,
    frame_rate_den: u32,
    frame_count: u32,
) -> Result<()> {
    out.extend_from_slice(b"DKIF");
    out.write_u16::<LittleEndian>(0)?; // version
    out.write_u16::<LittleEndian>(IVF_SEQ_HEADER_SIZE as u16)?;
    out.extend_from_slice(b"AV01");
    out.write_u16::<LittleEndian>(width)?;
    out.write_u16::<LittleEndian>(height)?;
    out.write_u32::<LittleEndian>(frame_rate_num)?;
    out.write_u32::<LittleEndian>(frame_rate_den)?;
    out.write_u32::<LittleEndian>(frame_count)?;
    out.write_u32::<LittleEndian>(0)?; // unused
    Ok(())
}

/// Writes a 12-byte IVF frame header.
pub fn write_ivf_frame_header(out: &mut Vec<u8>, frame_size: u32, pts: u64) -> Result<()> {
    out.write_u32::<LittleEndian>(frame_size)?;
    out.write_u64::<LittleEndian>(pts)?;
    Ok(())
}

/// Overwrites a previously written IVF frame header in place.
pub fn patch_ivf_frame_info(header: &mut [u8], frame_size: u32, pts: u64) -> Result<()> {
    if header.len() < IVF_PIC_HEADER_SIZE {
        return Err(EncodeError::BufferTooSmall {
            needed: IVF_PIC_HEADER_SIZE,
            available: header.len(),
        });
    }
    LittleEndian::write_u32(&mut header[0..4], frame_size);
    LittleEndian::write_u64(&mut header[4..12], pts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_layout() {
        let mut out = Vec::new();
        write_ivf_header(&mut out, 1920, 1080, 30, 1, 0).unwrap();

        assert_eq!(out.len(), IVF_SEQ_HEADER_SIZE);
        assert_eq!(&out[0..4], b"DKIF");
        assert_eq!(LittleEndian::read_u16(&out[6..8]), 32);
        assert_eq!(&out[8..12], b"AV01");
        assert_eq!(LittleEndian::read_u16(&out[12..14]), 1920);
        assert_eq!(LittleEndian::read_u16(&out[14..16]), 1080);
        assert_eq!(LittleEndian::read_u32(&out[16..20]), 30);
        assert_eq!(LittleEndian::read_u32(&out[20..24]), 1);
    }

    #[test]
    fn test_patch_frame_header() {
        let mut out = Vec::new();
        write_ivf_frame_header(&mut out, 0, 0).unwrap();
        out.extend_from_slice(&[0x12, 0x00]);

        patch_ivf_frame_info(&mut out, 2, 7).unwrap();
        assert_eq!(LittleEndian::read_u32(&out[0..4]), 2);
        assert_eq!(LittleEndian::read_u64(&out[4..12]), 7);
        assert_eq!(&out[12..], &[0x12, 0x00]);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let mut once = Vec::new();
        write_ivf_frame_header(&mut once, 0, 0).unwrap();
        patch_ivf_frame_info(&mut once, 1234, 99).unwrap();

        let mut twice = once.clone();
        patch_ivf_frame_info(&mut twice, 1234, 99).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_patch_short_buffer() {
        let mut short = [0u8; 8];
        let err = patch_ivf_frame_info(&mut short, 1, 1).unwrap_err();
        assert!(matches!(err, EncodeError::BufferTooSmall { needed: 12, .. }));
    }
}
