use std::collections::VecDeque;

use crate::decode::backend::{DecodeBackend, DecodeContext, PacketStatus};
use crate::decode::nal::{self, NalClass};
use crate::decode::{CodecKind, DecodedFrame};
use crate::error::{CaptureError, CaptureResult};

/// Synthetic backend for tests and `stub://` deployments.
///
/// Follows the send/receive shape of a real decoder without native
/// libraries: parameter sets are swallowed, a picture NAL seen after them
/// produces one flat frame whose luma level comes from the slice payload,
/// and picture data before any parameter set is rejected.
#[derive(Clone, Debug)]
pub struct SyntheticBackend {
    width: u32,
    height: u32,
    fail_open: bool,
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_open: false,
        }
    }

    /// Every `open` fails, for exercising init error paths.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(320, 240)
    }
}

impl DecodeBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn supports(&self, _codec: CodecKind) -> bool {
        true
    }

    fn open(&self, codec: CodecKind) -> CaptureResult<Box<dyn DecodeContext>> {
        if self.fail_open {
            return Err(CaptureError::DecodeInit(
                "synthetic backend configured to fail".to_string(),
            ));
        }
        Ok(Box::new(SyntheticContext {
            codec,
            width: self.width,
            height: self.height,
            has_parameters: false,
            pending: VecDeque::new(),
            closed: false,
        }))
    }
}

struct SyntheticContext {
    codec: CodecKind,
    width: u32,
    height: u32,
    has_parameters: bool,
    pending: VecDeque<DecodedFrame>,
    closed: bool,
}

impl DecodeContext for SyntheticContext {
    fn send_packet(&mut self, packet: &[u8]) -> CaptureResult<PacketStatus> {
        if self.closed {
            return Err(CaptureError::Decode("context closed".to_string()));
        }
        for unit in nal::split_annex_b(packet) {
            match nal::classify(self.codec, unit) {
                NalClass::ParameterSet => self.has_parameters = true,
                NalClass::Picture if !self.has_parameters => {
                    return Ok(PacketStatus::Rejected(
                        "picture before parameter sets".to_string(),
                    ));
                }
                NalClass::Picture => {
                    let level = unit
                        .get(nal::header_len(self.codec))
                        .copied()
                        .unwrap_or(128);
                    self.pending.push_back(DecodedFrame::filled(
                        self.width,
                        self.height,
                        level,
                        128,
                        128,
                    ));
                }
                NalClass::Other => {}
            }
        }
        Ok(PacketStatus::Accepted)
    }

    fn receive_frame(&mut self) -> CaptureResult<Option<DecodedFrame>> {
        Ok(self.pending.pop_front())
    }

    fn close(&mut self) {
        self.pending.clear();
        self.closed = true;
    }
}
