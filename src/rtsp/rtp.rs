use crate::error::{CaptureError, CaptureResult};

/// Fields of an RTP fixed header that depacketisation needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
}

/// Split an RTP packet into its header and payload.
pub fn parse_packet(packet: &[u8]) -> CaptureResult<(RtpHeader, &[u8])> {
    if packet.len() < 12 {
        return Err(CaptureError::protocol("rtp packet too small"));
    }
    let b0 = packet[0];
    let b1 = packet[1];
    let version = b0 >> 6;
    if version != 2 {
        return Err(CaptureError::protocol(format!(
            "unsupported rtp version {}",
            version
        )));
    }
    let padding = (b0 & 0x20) != 0;
    let extension = (b0 & 0x10) != 0;
    let csrc_count = (b0 & 0x0F) as usize;
    let header = RtpHeader {
        marker: (b1 & 0x80) != 0,
        payload_type: b1 & 0x7F,
        sequence: u16::from_be_bytes([packet[2], packet[3]]),
        timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
    };

    let mut offset = 12 + csrc_count * 4;
    if packet.len() < offset {
        return Err(CaptureError::protocol("rtp packet missing csrc entries"));
    }
    if extension {
        if packet.len() < offset + 4 {
            return Err(CaptureError::protocol("rtp extension header truncated"));
        }
        let ext_len = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + ext_len * 4;
    }
    if packet.len() < offset {
        return Err(CaptureError::protocol("rtp packet truncated"));
    }

    let mut payload_end = packet.len();
    if padding {
        let pad_len = *packet.last().unwrap_or(&0) as usize;
        if pad_len > payload_end - offset {
            return Err(CaptureError::protocol("invalid rtp padding"));
        }
        payload_end -= pad_len;
    }
    Ok((header, &packet[offset..payload_end]))
}
