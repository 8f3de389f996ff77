use crate::error::CaptureResult;

use super::{CodecKind, DecodedFrame};

/// Result of handing one packet to a decode context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketStatus {
    Accepted,
    /// The context must be drained before it accepts more input.
    Again,
    /// The backend refused the packet (e.g. slice data before parameter sets).
    Rejected(String),
}

/// Decoder backend trait.
///
/// A backend is a factory shared across cameras. Contexts it opens belong to
/// exactly one capture attempt and never leave the attempt's thread, which is
/// why `DecodeContext` is not required to be `Send`.
pub trait DecodeBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend can decode the codec.
    fn supports(&self, codec: CodecKind) -> bool;

    /// Allocate and open a decode context.
    ///
    /// Implementations must release any partially allocated state before
    /// returning an error.
    fn open(&self, codec: CodecKind) -> CaptureResult<Box<dyn DecodeContext>>;
}

/// Per-attempt decode state owned by one `VideoDecoder`.
pub trait DecodeContext {
    /// Feed one Annex-B framed packet.
    fn send_packet(&mut self, packet: &[u8]) -> CaptureResult<PacketStatus>;

    /// Pull one decoded picture if the backend has one ready.
    fn receive_frame(&mut self) -> CaptureResult<Option<DecodedFrame>>;

    /// Release backend resources. Must be idempotent.
    fn close(&mut self);
}
