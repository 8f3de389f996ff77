//! Codec decoder.
//!
//! `VideoDecoder` drives one backend decode context through
//! `Uninitialized -> Initialized -> Decoding -> Closed` and hands every
//! decoded picture straight to the frame converter and image encoder.
//!
//! Backends sit behind [`DecodeBackend`]; the state machine and the
//! distinction between "not ready yet" and failure live here, not in the
//! backends.

mod backend;
pub mod backends;
pub mod nal;
mod registry;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub use backend::{DecodeBackend, DecodeContext, PacketStatus};
pub use nal::START_CODE;
pub use registry::BackendRegistry;

use crate::convert::{ConvertedFrame, FrameConverter};
use crate::encode::{EncodeOutcome, SnapshotEncoder};
use crate::error::{CaptureError, CaptureResult};
use crate::rtsp::AccessUnit;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    H264,
    H265,
}

impl CodecKind {
    /// Order in which a session's video tracks are considered.
    pub const PREFERENCE: [CodecKind; 2] = [CodecKind::H264, CodecKind::H265];

    /// Resolve an SDP encoding name (`a=rtpmap`) or config value.
    pub fn from_name(name: &str) -> CaptureResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "H264" | "H.264" | "AVC" => Ok(Self::H264),
            "H265" | "H.265" | "HEVC" => Ok(Self::H265),
            other => Err(CaptureError::CodecNotFound(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorRange {
    /// Studio swing (16..=235 luma).
    Limited,
    /// Full swing (0..=255), a.k.a. JPEG range.
    Full,
}

#[derive(Clone, Debug)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// Planar 4:2:0 picture: one luma plane followed by two quarter-size chroma planes.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub range: ColorRange,
    pub planes: [Plane; 3],
}

impl DecodedFrame {
    pub fn chroma_width(&self) -> usize {
        (self.width as usize + 1) / 2
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize + 1) / 2
    }

    /// Tightly packed frame filled with a single colour.
    pub fn filled(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let luma = width as usize;
        let chroma = (width as usize + 1) / 2;
        let chroma_rows = (height as usize + 1) / 2;
        Self {
            width,
            height,
            range: ColorRange::Limited,
            planes: [
                Plane {
                    data: vec![y; luma * height as usize],
                    stride: luma,
                },
                Plane {
                    data: vec![u; chroma * chroma_rows],
                    stride: chroma,
                },
                Plane {
                    data: vec![v; chroma * chroma_rows],
                    stride: chroma,
                },
            ],
        }
    }
}

/// Result of one `decode` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A picture was decoded, converted and encoded.
    Image(Vec<u8>),
    /// Decoder or encoder needs more input before producing output.
    NeedMoreInput,
    /// The backend refused this access unit; the stream continues.
    Rejected(String),
}

/// Counts live decode contexts. Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct ContextGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    live: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ContextGauge {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_open(&self) {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(live, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn record_close(&self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live contexts observed.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Uninitialized,
    Initialized,
    Decoding,
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub access_units: u64,
    pub rejected: u64,
    pub pictures: u64,
}

/// Per-attempt decoder. Owns one decode context and one conversion context.
pub struct VideoDecoder {
    backend: Arc<dyn DecodeBackend>,
    encoder: Box<dyn SnapshotEncoder>,
    gauge: ContextGauge,
    state: DecoderState,
    codec: Option<CodecKind>,
    context: Option<Box<dyn DecodeContext>>,
    converter: Option<FrameConverter>,
    stats: DecodeStats,
}

impl VideoDecoder {
    pub fn new(
        backend: Arc<dyn DecodeBackend>,
        encoder: Box<dyn SnapshotEncoder>,
        gauge: ContextGauge,
    ) -> Self {
        Self {
            backend,
            encoder,
            gauge,
            state: DecoderState::Uninitialized,
            codec: None,
            context: None,
            converter: None,
            stats: DecodeStats::default(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn codec(&self) -> Option<CodecKind> {
        self.codec
    }

    /// Resolve and open a backend context for `codec`.
    pub fn initialize(&mut self, codec: CodecKind) -> CaptureResult<()> {
        if self.state != DecoderState::Uninitialized {
            return Err(CaptureError::DecodeInit(format!(
                "decoder is {:?}, expected Uninitialized",
                self.state
            )));
        }
        if !self.backend.supports(codec) {
            return Err(CaptureError::CodecNotFound(format!(
                "{} backend cannot decode {}",
                self.backend.name(),
                codec.name()
            )));
        }
        let context = self.backend.open(codec)?;
        self.gauge.record_open();
        self.context = Some(context);
        self.codec = Some(codec);
        self.state = DecoderState::Initialized;
        log::debug!("{} decoder opened for {}", self.backend.name(), codec.name());
        Ok(())
    }

    /// Resolve the codec by name first; unknown names fail with `CodecNotFound`.
    pub fn initialize_named(&mut self, codec: &str) -> CaptureResult<()> {
        let codec = CodecKind::from_name(codec)?;
        self.initialize(codec)
    }

    /// Feed one access unit and try to produce one encoded image.
    pub fn decode(&mut self, unit: &AccessUnit) -> CaptureResult<DecodeOutcome> {
        let context = match (self.state, self.context.as_mut()) {
            (DecoderState::Initialized | DecoderState::Decoding, Some(context)) => context,
            (state, _) => {
                return Err(CaptureError::Decode(format!(
                    "decode called while decoder is {:?}",
                    state
                )))
            }
        };
        self.state = DecoderState::Decoding;
        self.stats.access_units += 1;

        let mut packet = Vec::with_capacity(START_CODE.len() + unit.data.len());
        packet.extend_from_slice(&START_CODE);
        packet.extend_from_slice(&unit.data);

        match context.send_packet(&packet)? {
            PacketStatus::Accepted | PacketStatus::Again => {}
            PacketStatus::Rejected(reason) => {
                self.stats.rejected += 1;
                log::trace!("access unit rejected by decoder: {}", reason);
                return Ok(DecodeOutcome::Rejected(reason));
            }
        }

        let Some(frame) = context.receive_frame()? else {
            return Ok(DecodeOutcome::NeedMoreInput);
        };
        self.stats.pictures += 1;

        let converted = self.convert(&frame)?;
        drop(frame);
        match self.encoder.encode(&converted)? {
            EncodeOutcome::Image(bytes) => Ok(DecodeOutcome::Image(bytes)),
            EncodeOutcome::NeedMoreInput => Ok(DecodeOutcome::NeedMoreInput),
        }
    }

    fn convert(&mut self, frame: &DecodedFrame) -> CaptureResult<ConvertedFrame> {
        let reusable = self
            .converter
            .as_ref()
            .is_some_and(|converter| converter.source_size() == (frame.width, frame.height));
        if !reusable {
            self.converter = Some(FrameConverter::new(
                frame.width,
                frame.height,
                frame.width,
                frame.height,
            )?);
        }
        match self.converter.as_ref() {
            Some(converter) => converter.convert(frame),
            None => Err(CaptureError::Conversion(
                "conversion context unavailable".to_string(),
            )),
        }
    }

    /// Release the decode and conversion contexts. Idempotent.
    pub fn close(&mut self) {
        self.converter = None;
        if let Some(mut context) = self.context.take() {
            context.close();
            self.gauge.record_close();
            log::debug!(
                "{} decoder closed (units={} rejected={} pictures={})",
                self.backend.name(),
                self.stats.access_units,
                self.stats.rejected,
                self.stats.pictures
            );
        }
        if self.state != DecoderState::Uninitialized {
            self.state = DecoderState::Closed;
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.close();
    }
}
