//! Annex-B byte-stream helpers shared by the depacketizers and decoders.

use super::CodecKind;

/// Canonical 4-byte start code placed before every access unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NalClass {
    ParameterSet,
    Picture,
    Other,
}

/// NAL unit type from the first header byte(s).
pub fn nal_type(codec: CodecKind, nal: &[u8]) -> Option<u8> {
    let header = *nal.first()?;
    Some(match codec {
        CodecKind::H264 => header & 0x1f,
        CodecKind::H265 => (header >> 1) & 0x3f,
    })
}

pub fn classify(codec: CodecKind, nal: &[u8]) -> NalClass {
    let Some(kind) = nal_type(codec, nal) else {
        return NalClass::Other;
    };
    match codec {
        // 1..=5 coded slices, 7 SPS, 8 PPS
        CodecKind::H264 => match kind {
            1..=5 => NalClass::Picture,
            7 | 8 => NalClass::ParameterSet,
            _ => NalClass::Other,
        },
        // 0..=31 VCL, 32 VPS, 33 SPS, 34 PPS
        CodecKind::H265 => match kind {
            0..=31 => NalClass::Picture,
            32..=34 => NalClass::ParameterSet,
            _ => NalClass::Other,
        },
    }
}

/// Header length in bytes for the codec's NAL units.
pub fn header_len(codec: CodecKind) -> usize {
    match codec {
        CodecKind::H264 => 1,
        CodecKind::H265 => 2,
    }
}

/// Split an Annex-B stream into NAL units (start codes removed).
///
/// Accepts both 3- and 4-byte start codes; data before the first start code
/// is treated as a NAL unit so raw (unprefixed) input still splits sensibly.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let mut end = i;
            // A 4-byte start code leaves one extra zero before the 3-byte pattern.
            if end > start && data[end - 1] == 0 {
                end -= 1;
            }
            if end > start {
                units.push(&data[start..end]);
            }
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    if start < data.len() {
        units.push(&data[start..]);
    }
    units
}

/// Join NAL units with start codes, omitting the leading one.
pub fn join_without_leading_start_code<'a>(units: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, unit) in units.into_iter().enumerate() {
        if index > 0 {
            out.extend_from_slice(&START_CODE);
        }
        out.extend_from_slice(unit);
    }
    out
}
