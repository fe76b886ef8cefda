//! HDR metadata OBUs (mastering display colour volume, content light level).

use crate::encoder::bitwriter::BitstreamWriter;
use crate::encoder::{ContentLightLevel, HdrMetadata, MasteringDisplay};
use crate::error::Result;

use super::{write_obu, ObuType};

const METADATA_TYPE_HDR_CLL: u64 = 1;
const METADATA_TYPE_HDR_MDCV: u64 = 2;

fn content_light_payload(cll: &ContentLightLevel) -> Result<BitstreamWriter> {
    let mut w = BitstreamWriter::with_capacity(6);
    w.put_leb128(METADATA_TYPE_HDR_CLL, None)?;
    w.put_bits(cll.max_cll as u64, 16);
    w.put_bits(cll.max_fall as u64, 16);
    w.put_trailing_bits();
    Ok(w)
}

fn mastering_display_payload(mdcv: &MasteringDisplay) -> Result<BitstreamWriter> {
    let mut w = BitstreamWriter::with_capacity(26);
    w.put_leb128(METADATA_TYPE_HDR_MDCV, None)?;
    for (x, y) in &mdcv.primaries {
        w.put_bits(*x as u64, 16);
        w.put_bits(*y as u64, 16);
    }
    w.put_bits(mdcv.white_point.0 as u64, 16);
    w.put_bits(mdcv.white_point.1 as u64, 16);
    w.put_bits(mdcv.luminance_max as u64, 32);
    w.put_bits(mdcv.luminance_min as u64, 32);
    w.put_trailing_bits();
    Ok(w)
}

/// Packs the metadata OBUs for `hdr`, mastering display first.
pub fn pack_hdr_metadata(hdr: &HdrMetadata) -> Result<Vec<u8>> {
    let mut out = BitstreamWriter::new();
    if let Some(mdcv) = &hdr.mastering_display {
        let payload = mastering_display_payload(mdcv)?;
        write_obu(&mut out, ObuType::Metadata, None, payload)?;
    }
    if let Some(cll) = &hdr.content_light {
        let payload = content_light_payload(cll)?;
        write_obu(&mut out, ObuType::Metadata, None, payload)?;
    }
    Ok(out.finish())
}
