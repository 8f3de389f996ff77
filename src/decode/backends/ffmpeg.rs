//! FFmpeg (libavcodec) decoder backend.

use anyhow::Context as _;
use ffmpeg_next as ffmpeg;

use ffmpeg::codec::Id;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as Scaler, flag::Flags};

use crate::decode::backend::{DecodeBackend, DecodeContext, PacketStatus};
use crate::decode::{CodecKind, ColorRange, DecodedFrame, Plane};
use crate::error::{CaptureError, CaptureResult};

pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> anyhow::Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self)
    }
}

fn codec_id(codec: CodecKind) -> Id {
    match codec {
        CodecKind::H264 => Id::H264,
        CodecKind::H265 => Id::HEVC,
    }
}

impl DecodeBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn supports(&self, codec: CodecKind) -> bool {
        ffmpeg::decoder::find(codec_id(codec)).is_some()
    }

    fn open(&self, codec: CodecKind) -> CaptureResult<Box<dyn DecodeContext>> {
        let found = ffmpeg::decoder::find(codec_id(codec)).ok_or_else(|| {
            CaptureError::CodecNotFound(format!("ffmpeg has no {} decoder", codec.name()))
        })?;
        // An unopened codec context is freed on drop, so a failed open leaks nothing.
        let decoder = ffmpeg::codec::context::Context::new()
            .decoder()
            .open_as(found)
            .and_then(|opened| opened.video())
            .map_err(|e| {
                CaptureError::DecodeInit(format!("open {} decoder: {}", codec.name(), e))
            })?;
        Ok(Box::new(FfmpegContext {
            decoder: Some(decoder),
            normalizer: None,
        }))
    }
}

struct FfmpegContext {
    decoder: Option<ffmpeg::decoder::Video>,
    /// Only created when the decoder emits something other than 4:2:0 planar.
    normalizer: Option<Scaler>,
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

impl DecodeContext for FfmpegContext {
    fn send_packet(&mut self, packet: &[u8]) -> CaptureResult<PacketStatus> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| CaptureError::Decode("decoder closed".to_string()))?;
        match decoder.send_packet(&ffmpeg::Packet::copy(packet)) {
            Ok(()) => Ok(PacketStatus::Accepted),
            Err(err) if is_again(&err) => Ok(PacketStatus::Again),
            Err(err) => Ok(PacketStatus::Rejected(err.to_string())),
        }
    }

    fn receive_frame(&mut self) -> CaptureResult<Option<DecodedFrame>> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| CaptureError::Decode("decoder closed".to_string()))?;
        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => self.to_planar(&frame).map(Some),
            Err(err) if is_again(&err) => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(err) => Err(CaptureError::Decode(format!("receive frame: {}", err))),
        }
    }

    fn close(&mut self) {
        self.normalizer = None;
        self.decoder = None;
    }
}

impl FfmpegContext {
    fn to_planar(&mut self, frame: &ffmpeg::frame::Video) -> CaptureResult<DecodedFrame> {
        let range = if frame.format() == Pixel::YUVJ420P
            || frame.color_range() == ffmpeg::color::Range::JPEG
        {
            ColorRange::Full
        } else {
            ColorRange::Limited
        };
        if matches!(frame.format(), Pixel::YUV420P | Pixel::YUVJ420P) {
            return Ok(copy_planes(frame, range));
        }

        let stale = self.normalizer.as_ref().map_or(true, |scaler| {
            let input = scaler.input();
            input.format != frame.format()
                || input.width != frame.width()
                || input.height != frame.height()
        });
        if stale {
            let scaler = Scaler::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::YUV420P,
                frame.width(),
                frame.height(),
                Flags::BILINEAR,
            )
            .map_err(|e| CaptureError::Conversion(format!("create planar scaler: {}", e)))?;
            self.normalizer = Some(scaler);
        }

        let mut planar = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.normalizer.as_mut() {
            scaler
                .run(frame, &mut planar)
                .map_err(|e| CaptureError::Conversion(format!("normalize to yuv420p: {}", e)))?;
        }
        Ok(copy_planes(&planar, range))
    }
}

fn copy_planes(frame: &ffmpeg::frame::Video, range: ColorRange) -> DecodedFrame {
    let rows = frame.height() as usize;
    let chroma_rows = (rows + 1) / 2;
    let plane = |index: usize, rows: usize| {
        let stride = frame.stride(index);
        let data = frame.data(index);
        let len = (stride * rows).min(data.len());
        Plane {
            data: data[..len].to_vec(),
            stride,
        }
    };
    DecodedFrame {
        width: frame.width(),
        height: frame.height(),
        range,
        planes: [plane(0, rows), plane(1, chroma_rows), plane(2, chroma_rows)],
    }
}
