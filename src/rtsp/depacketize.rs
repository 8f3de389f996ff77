//! RTP payload to access unit reassembly for H.264 (RFC 6184) and H.265 (RFC 7798).

use std::collections::VecDeque;

use super::rtp::RtpHeader;
use super::AccessUnit;
use crate::decode::nal;
use crate::decode::CodecKind;

const H264_STAP_A: u8 = 24;
const H264_FU_A: u8 = 28;
const H265_AP: u8 = 48;
const H265_FU: u8 = 49;
const H265_PACI: u8 = 50;

/// Upper bound for one reassembled access unit.
const MAX_ACCESS_UNIT_BYTES: usize = 8 * 1024 * 1024;

pub struct Depacketizer {
    codec: CodecKind,
    /// Out-of-band parameter sets, placed ahead of the first emitted unit.
    parameter_sets: Vec<Vec<u8>>,
    nals: Vec<Vec<u8>>,
    pending_bytes: usize,
    unit_limit: usize,
    /// Set once the current unit overflowed; cleared when it ends.
    discarding: bool,
    fragment: Option<Vec<u8>>,
    timestamp: Option<u32>,
    last_sequence: Option<u16>,
    ready: VecDeque<AccessUnit>,
    emitted: u64,
    dropped_fragments: u64,
}

impl Depacketizer {
    pub fn new(codec: CodecKind) -> Self {
        Self {
            codec,
            parameter_sets: Vec::new(),
            nals: Vec::new(),
            pending_bytes: 0,
            unit_limit: MAX_ACCESS_UNIT_BYTES,
            discarding: false,
            fragment: None,
            timestamp: None,
            last_sequence: None,
            ready: VecDeque::new(),
            emitted: 0,
            dropped_fragments: 0,
        }
    }

    pub fn with_parameter_sets(mut self, parameter_sets: Vec<Vec<u8>>) -> Self {
        self.parameter_sets = parameter_sets;
        self
    }

    /// Lower the per-unit size cap (default 8 MiB).
    pub fn with_unit_limit(mut self, bytes: usize) -> Self {
        self.unit_limit = bytes;
        self
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn dropped_fragments(&self) -> u64 {
        self.dropped_fragments
    }

    /// Bytes held for the unit under assembly, including a partial fragment.
    pub fn buffered_bytes(&self) -> usize {
        self.pending_bytes + self.fragment.as_ref().map_or(0, Vec::len)
    }

    /// Consume one RTP packet. Completed units are queued for [`Self::next_ready`].
    pub fn push(&mut self, header: &RtpHeader, payload: &[u8]) {
        if let Some(last) = self.last_sequence {
            if header.sequence != last.wrapping_add(1) && self.fragment.take().is_some() {
                self.dropped_fragments += 1;
                log::trace!(
                    "rtp sequence gap {} -> {}, fragment dropped",
                    last,
                    header.sequence
                );
            }
        }
        self.last_sequence = Some(header.sequence);

        if self.timestamp.is_some_and(|ts| ts != header.timestamp) {
            if self.fragment.take().is_some() {
                self.dropped_fragments += 1;
            }
            self.finish_unit();
        }
        self.timestamp = Some(header.timestamp);

        match self.codec {
            CodecKind::H264 => self.push_h264(payload),
            CodecKind::H265 => self.push_h265(payload),
        }

        if header.marker {
            self.finish_unit();
        }
    }

    pub fn next_ready(&mut self) -> Option<AccessUnit> {
        self.ready.pop_front()
    }

    fn push_h264(&mut self, payload: &[u8]) {
        let Some(&indicator) = payload.first() else {
            return;
        };
        match indicator & 0x1F {
            1..=23 => self.push_nal(payload.to_vec()),
            H264_STAP_A => self.push_aggregate(&payload[1..]),
            H264_FU_A => {
                let Some(&fu_header) = payload.get(1) else {
                    return;
                };
                let nal_header = (indicator & 0xE0) | (fu_header & 0x1F);
                self.push_fragment(fu_header, &[nal_header], &payload[2..]);
            }
            other => log::trace!("ignoring h264 packetization type {}", other),
        }
    }

    fn push_h265(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }
        match (payload[0] >> 1) & 0x3F {
            H265_AP => self.push_aggregate(&payload[2..]),
            H265_FU => {
                let Some(&fu_header) = payload.get(2) else {
                    return;
                };
                let nal_header = [
                    (payload[0] & 0x81) | ((fu_header & 0x3F) << 1),
                    payload[1],
                ];
                self.push_fragment(fu_header, &nal_header, &payload[3..]);
            }
            H265_PACI => log::trace!("dropping h265 PACI packet"),
            _ => self.push_nal(payload.to_vec()),
        }
    }

    /// STAP-A / AP body: repeated 16-bit size followed by a NAL unit.
    fn push_aggregate(&mut self, mut body: &[u8]) {
        while body.len() >= 2 {
            let size = u16::from_be_bytes([body[0], body[1]]) as usize;
            body = &body[2..];
            if size == 0 || size > body.len() {
                log::trace!("truncated aggregation packet");
                return;
            }
            self.push_nal(body[..size].to_vec());
            body = &body[size..];
        }
    }

    fn push_fragment(&mut self, fu_header: u8, nal_header: &[u8], data: &[u8]) {
        if self.discarding {
            return;
        }
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        if start {
            if self.fragment.take().is_some() {
                self.dropped_fragments += 1;
            }
            if self.pending_bytes + nal_header.len() + data.len() > self.unit_limit {
                self.discard_unit();
                return;
            }
            let mut nal = nal_header.to_vec();
            nal.extend_from_slice(data);
            self.fragment = Some(nal);
        } else if let Some(fragment) = self.fragment.as_mut() {
            if self.pending_bytes + fragment.len() + data.len() > self.unit_limit {
                self.discard_unit();
                return;
            }
            fragment.extend_from_slice(data);
        }
        if end {
            if let Some(nal) = self.fragment.take() {
                self.push_nal(nal);
            }
        }
    }

    fn push_nal(&mut self, nal: Vec<u8>) {
        if nal.is_empty() || self.discarding {
            return;
        }
        if self.pending_bytes + nal.len() > self.unit_limit {
            self.discard_unit();
            return;
        }
        self.pending_bytes += nal.len();
        self.nals.push(nal);
    }

    /// Drop everything collected for the current unit and ignore the rest of
    /// it until the marker bit or the next timestamp.
    fn discard_unit(&mut self) {
        log::warn!("access unit exceeds {} bytes, discarding", self.unit_limit);
        if self.fragment.take().is_some() {
            self.dropped_fragments += 1;
        }
        self.nals.clear();
        self.pending_bytes = 0;
        self.discarding = true;
    }

    fn finish_unit(&mut self) {
        if std::mem::take(&mut self.discarding) {
            return;
        }
        if self.nals.is_empty() {
            return;
        }
        let nals = std::mem::take(&mut self.nals);
        self.pending_bytes = 0;
        let parameter_sets = if self.emitted == 0 {
            std::mem::take(&mut self.parameter_sets)
        } else {
            Vec::new()
        };
        let data = nal::join_without_leading_start_code(
            parameter_sets
                .iter()
                .chain(nals.iter())
                .map(|nal| nal.as_slice()),
        );
        self.emitted += 1;
        self.ready.push_back(AccessUnit {
            codec: self.codec,
            rtp_timestamp: self.timestamp.unwrap_or_default(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u16, timestamp: u32, marker: bool) -> RtpHeader {
        RtpHeader {
            marker,
            payload_type: 96,
            sequence,
            timestamp,
        }
    }

    #[test]
    fn h264_fu_a_is_reassembled() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264);
        depacketizer.push(&header(1, 90, false), &[0x7C, 0x85, 1, 2]);
        depacketizer.push(&header(2, 90, false), &[0x7C, 0x05, 3]);
        depacketizer.push(&header(3, 90, true), &[0x7C, 0x45, 4]);
        let unit = depacketizer.next_ready().expect("access unit");
        assert_eq!(unit.data, vec![0x65, 1, 2, 3, 4]);
        assert_eq!(unit.rtp_timestamp, 90);
        assert!(depacketizer.next_ready().is_none());
    }

    #[test]
    fn h264_stap_a_nals_are_joined_with_start_codes() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264);
        depacketizer.push(
            &header(7, 0, true),
            &[0x18, 0, 2, 0x67, 0x42, 0, 1, 0x68],
        );
        let unit = depacketizer.next_ready().expect("access unit");
        assert_eq!(unit.data, vec![0x67, 0x42, 0, 0, 0, 1, 0x68]);
    }

    #[test]
    fn sequence_gap_drops_fragment() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264);
        depacketizer.push(&header(1, 90, false), &[0x7C, 0x85, 1]);
        depacketizer.push(&header(3, 90, true), &[0x7C, 0x45, 2]);
        assert!(depacketizer.next_ready().is_none());
        assert_eq!(depacketizer.dropped_fragments(), 1);
    }

    #[test]
    fn timestamp_change_closes_unit_without_marker() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264);
        depacketizer.push(&header(1, 100, false), &[0x41, 9]);
        depacketizer.push(&header(2, 200, true), &[0x41, 8]);
        let first = depacketizer.next_ready().expect("first unit");
        let second = depacketizer.next_ready().expect("second unit");
        assert_eq!((first.rtp_timestamp, first.data), (100, vec![0x41, 9]));
        assert_eq!((second.rtp_timestamp, second.data), (200, vec![0x41, 8]));
    }

    #[test]
    fn parameter_sets_precede_only_the_first_unit() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264)
            .with_parameter_sets(vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
        depacketizer.push(&header(1, 1, true), &[0x65, 0x88]);
        depacketizer.push(&header(2, 2, true), &[0x41, 0x9A]);
        let first = depacketizer.next_ready().expect("first unit");
        assert_eq!(
            first.data,
            vec![0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88]
        );
        let second = depacketizer.next_ready().expect("second unit");
        assert_eq!(second.data, vec![0x41, 0x9A]);
    }

    #[test]
    fn h265_fu_restores_nal_header() {
        let mut depacketizer = Depacketizer::new(CodecKind::H265);
        // FU indicator type 49, FU header start + IDR_W_RADL (19).
        depacketizer.push(&header(1, 5, false), &[0x62, 0x01, 0x93, 0xAA]);
        depacketizer.push(&header(2, 5, true), &[0x62, 0x01, 0x53, 0xBB]);
        let unit = depacketizer.next_ready().expect("access unit");
        assert_eq!(unit.data, vec![0x26, 0x01, 0xAA, 0xBB]);
        assert_eq!(unit.codec, CodecKind::H265);
    }

    #[test]
    fn endless_fragment_is_capped_and_dropped() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264).with_unit_limit(4096);
        let chunk = [0xAB; 1000];
        let mut packet = vec![0x7C, 0x85];
        packet.extend_from_slice(&chunk);
        depacketizer.push(&header(1, 90, false), &packet);
        packet[1] = 0x05;
        for sequence in 2..200 {
            depacketizer.push(&header(sequence, 90, false), &packet);
            assert!(depacketizer.buffered_bytes() <= 4096);
        }
        packet[1] = 0x45;
        depacketizer.push(&header(200, 90, true), &packet);

        assert!(depacketizer.next_ready().is_none());
        assert_eq!(depacketizer.dropped_fragments(), 1);
        assert_eq!(depacketizer.buffered_bytes(), 0);
    }

    #[test]
    fn oversized_unit_is_dropped_whole() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264).with_unit_limit(64);
        depacketizer.push(&header(1, 10, false), &[0x41; 40]);
        depacketizer.push(&header(2, 10, false), &[0x41; 40]);
        // Fits on its own, but belongs to the overflowed unit.
        depacketizer.push(&header(3, 10, true), &[0x41, 1, 2]);
        assert!(depacketizer.next_ready().is_none());

        depacketizer.push(&header(4, 20, true), &[0x41, 7]);
        let unit = depacketizer.next_ready().expect("next unit");
        assert_eq!((unit.rtp_timestamp, unit.data), (20, vec![0x41, 7]));
    }

    #[test]
    fn oversized_unit_ended_by_timestamp_change() {
        let mut depacketizer = Depacketizer::new(CodecKind::H264).with_unit_limit(64);
        depacketizer.push(&header(1, 10, false), &[0x41; 70]);
        depacketizer.push(&header(2, 10, false), &[0x41, 1]);
        depacketizer.push(&header(3, 20, true), &[0x41, 2]);
        let unit = depacketizer.next_ready().expect("unit after overflow");
        assert_eq!((unit.rtp_timestamp, unit.data), (20, vec![0x41, 2]));
        assert!(depacketizer.next_ready().is_none());
    }

    #[test]
    fn h265_paci_is_dropped() {
        let mut depacketizer = Depacketizer::new(CodecKind::H265);
        depacketizer.push(&header(1, 5, true), &[0x64, 0x01, 0, 0]);
        assert!(depacketizer.next_ready().is_none());
    }
}
