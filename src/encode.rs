//! Image encoder: one RGBA frame in, one still-image container out.
//!
//! Encoders follow a send-frame / receive-chunk contract. An encoder that
//! needs more buffering returns [`EncodeOutcome::NeedMoreInput`]; callers
//! treat that as "not ready", never as failure.

use image::codecs::png::PngEncoder as ImagePngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::convert::ConvertedFrame;
use crate::error::{CaptureError, CaptureResult};

/// First eight bytes of every PNG file.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Frame-rate metadata handed to container encoders that require one.
/// Meaningless for a single image.
pub const STILL_FRAME_RATE: i32 = 25;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodeOutcome {
    Image(Vec<u8>),
    NeedMoreInput,
}

pub trait SnapshotEncoder {
    fn name(&self) -> &'static str;

    fn encode(&mut self, frame: &ConvertedFrame) -> CaptureResult<EncodeOutcome>;
}

/// PNG via the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct PngEncoder;

impl SnapshotEncoder for PngEncoder {
    fn name(&self) -> &'static str {
        "png"
    }

    fn encode(&mut self, frame: &ConvertedFrame) -> CaptureResult<EncodeOutcome> {
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.rgba.len() != expected {
            return Err(CaptureError::Encode(format!(
                "rgba buffer is {} bytes, expected {}",
                frame.rgba.len(),
                expected
            )));
        }
        let mut bytes = Vec::new();
        ImagePngEncoder::new(&mut bytes)
            .write_image(
                &frame.rgba,
                frame.width,
                frame.height,
                ExtendedColorType::Rgba8,
            )
            .map_err(|e| CaptureError::Encode(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(EncodeOutcome::NeedMoreInput);
        }
        Ok(EncodeOutcome::Image(bytes))
    }
}

/// Which encoder a capture pipeline builds for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderKind {
    Png,
    #[cfg(feature = "decode-ffmpeg")]
    FfmpegPng,
}

impl EncoderKind {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "png" => Ok(Self::Png),
            #[cfg(feature = "decode-ffmpeg")]
            "ffmpeg-png" => Ok(Self::FfmpegPng),
            other => Err(anyhow::anyhow!("unknown image encoder '{}'", other)),
        }
    }

    pub fn build(&self) -> Box<dyn SnapshotEncoder> {
        match self {
            Self::Png => Box::new(PngEncoder),
            #[cfg(feature = "decode-ffmpeg")]
            Self::FfmpegPng => Box::new(ffmpeg_png::FfmpegPngEncoder),
        }
    }
}

#[cfg(feature = "decode-ffmpeg")]
mod ffmpeg_png {
    use ffmpeg_next as ffmpeg;

    use super::{EncodeOutcome, SnapshotEncoder, STILL_FRAME_RATE};
    use crate::convert::ConvertedFrame;
    use crate::error::{CaptureError, CaptureResult};

    /// PNG through libavcodec, for parity with the decoder backend.
    pub struct FfmpegPngEncoder;

    fn is_again(err: &ffmpeg::Error) -> bool {
        matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
    }

    impl SnapshotEncoder for FfmpegPngEncoder {
        fn name(&self) -> &'static str {
            "ffmpeg-png"
        }

        fn encode(&mut self, frame: &ConvertedFrame) -> CaptureResult<EncodeOutcome> {
            let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::PNG)
                .ok_or_else(|| CaptureError::Encode("png encoder not found".to_string()))?;
            let mut settings = ffmpeg::codec::context::Context::new()
                .encoder()
                .video()
                .map_err(|e| CaptureError::Encode(format!("alloc png encoder: {}", e)))?;
            settings.set_width(frame.width);
            settings.set_height(frame.height);
            settings.set_format(ffmpeg::format::Pixel::RGBA);
            settings.set_time_base(ffmpeg::Rational::new(1, STILL_FRAME_RATE));
            let mut encoder = settings
                .open_as(codec)
                .map_err(|e| CaptureError::Encode(format!("open png encoder: {}", e)))?;

            let mut video =
                ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGBA, frame.width, frame.height);
            video.set_color_range(ffmpeg::color::Range::JPEG);
            let row = frame.width as usize * 4;
            let stride = video.stride(0);
            let data = video.data_mut(0);
            for (y, source) in frame.rgba.chunks_exact(row).enumerate() {
                data[y * stride..y * stride + row].copy_from_slice(source);
            }

            match encoder.send_frame(&video) {
                Ok(()) => {}
                Err(err) if is_again(&err) => return Ok(EncodeOutcome::NeedMoreInput),
                Err(err) => return Err(CaptureError::Encode(format!("send frame: {}", err))),
            }
            let mut packet = ffmpeg::Packet::empty();
            match encoder.receive_packet(&mut packet) {
                Ok(()) => match packet.data() {
                    Some(bytes) if !bytes.is_empty() => Ok(EncodeOutcome::Image(bytes.to_vec())),
                    _ => Ok(EncodeOutcome::NeedMoreInput),
                },
                Err(err) if is_again(&err) => Ok(EncodeOutcome::NeedMoreInput),
                Err(err) => Err(CaptureError::Encode(format!("receive packet: {}", err))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> ConvertedFrame {
        ConvertedFrame {
            width,
            height,
            rgba: vec![0x7f; width as usize * height as usize * 4],
            full_range: true,
        }
    }

    #[test]
    fn png_output_carries_signature() -> CaptureResult<()> {
        let EncodeOutcome::Image(bytes) = PngEncoder.encode(&frame(6, 4))? else {
            panic!("png encoder never buffers");
        };
        assert_eq!(&bytes[..8], &PNG_SIGNATURE);
        Ok(())
    }

    #[test]
    fn png_round_trips_dimensions() -> anyhow::Result<()> {
        let EncodeOutcome::Image(bytes) = PngEncoder.encode(&frame(5, 3))? else {
            panic!("png encoder never buffers");
        };
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (5, 3));
        Ok(())
    }

    #[test]
    fn short_buffer_is_an_encode_error() {
        let mut bad = frame(4, 4);
        bad.rgba.truncate(10);
        assert!(matches!(PngEncoder.encode(&bad), Err(CaptureError::Encode(_))));
    }

    #[test]
    fn encoder_kind_parses_known_names() {
        assert_eq!(EncoderKind::from_name("png").ok(), Some(EncoderKind::Png));
        assert!(EncoderKind::from_name("webp").is_err());
    }
}
