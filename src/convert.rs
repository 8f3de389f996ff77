//! Frame converter: planar 4:2:0 to packed full-range RGBA.
//!
//! Resampling is always bilinear, including the equal-size case where it
//! degenerates to a copy for luma and a bilinear upsample for chroma.
//! Colour matrix is BT.601.

use crate::decode::{ColorRange, DecodedFrame};
use crate::error::{CaptureError, CaptureResult};

/// Largest edge accepted for a conversion context.
pub const MAX_DIMENSION: u32 = 16_384;

/// Packed RGBA picture, always tagged full range.
#[derive(Clone, Debug)]
pub struct ConvertedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub full_range: bool,
}

/// Source index pair and 8-bit fixed-point weight of the second sample.
#[derive(Clone, Copy, Debug)]
struct Tap {
    first: usize,
    second: usize,
    weight: u32,
}

fn taps(source: usize, destination: usize) -> Vec<Tap> {
    let scale = source as f64 / destination as f64;
    (0..destination)
        .map(|d| {
            let position = ((d as f64 + 0.5) * scale - 0.5).max(0.0);
            let first = (position.floor() as usize).min(source - 1);
            let second = (first + 1).min(source - 1);
            let weight = ((position - first as f64) * 256.0).round().clamp(0.0, 256.0) as u32;
            Tap {
                first,
                second,
                weight,
            }
        })
        .collect()
}

/// Conversion context for one source/destination geometry.
pub struct FrameConverter {
    source: (u32, u32),
    destination: (u32, u32),
    luma_x: Vec<Tap>,
    luma_y: Vec<Tap>,
    chroma_x: Vec<Tap>,
    chroma_y: Vec<Tap>,
}

impl FrameConverter {
    pub fn new(
        source_width: u32,
        source_height: u32,
        destination_width: u32,
        destination_height: u32,
    ) -> CaptureResult<Self> {
        for (label, value) in [
            ("source width", source_width),
            ("source height", source_height),
            ("destination width", destination_width),
            ("destination height", destination_height),
        ] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(CaptureError::Conversion(format!(
                    "{} {} outside 1..={}",
                    label, value, MAX_DIMENSION
                )));
            }
        }
        let chroma_width = (source_width as usize + 1) / 2;
        let chroma_height = (source_height as usize + 1) / 2;
        Ok(Self {
            source: (source_width, source_height),
            destination: (destination_width, destination_height),
            luma_x: taps(source_width as usize, destination_width as usize),
            luma_y: taps(source_height as usize, destination_height as usize),
            chroma_x: taps(chroma_width, destination_width as usize),
            chroma_y: taps(chroma_height, destination_height as usize),
        })
    }

    pub fn source_size(&self) -> (u32, u32) {
        self.source
    }

    pub fn destination_size(&self) -> (u32, u32) {
        self.destination
    }

    pub fn convert(&self, frame: &DecodedFrame) -> CaptureResult<ConvertedFrame> {
        if (frame.width, frame.height) != self.source {
            return Err(CaptureError::Conversion(format!(
                "frame is {}x{}, context expects {}x{}",
                frame.width, frame.height, self.source.0, self.source.1
            )));
        }
        let geometry = [
            (frame.width as usize, frame.height as usize),
            (frame.chroma_width(), frame.chroma_height()),
            (frame.chroma_width(), frame.chroma_height()),
        ];
        for (index, (plane, (columns, rows))) in frame.planes.iter().zip(geometry).enumerate() {
            let needed = plane.stride * (rows - 1) + columns;
            if plane.stride < columns || plane.data.len() < needed {
                return Err(CaptureError::Conversion(format!(
                    "plane {} too small: stride {} len {} for {}x{}",
                    index,
                    plane.stride,
                    plane.data.len(),
                    columns,
                    rows
                )));
            }
        }

        let (width, height) = self.destination;
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height as usize {
            for x in 0..width as usize {
                let luma = sample(&frame.planes[0], self.luma_x[x], self.luma_y[y]);
                let cb = sample(&frame.planes[1], self.chroma_x[x], self.chroma_y[y]);
                let cr = sample(&frame.planes[2], self.chroma_x[x], self.chroma_y[y]);
                let [r, g, b] = yuv_to_rgb(luma, cb, cr, frame.range);
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
        }
        Ok(ConvertedFrame {
            width,
            height,
            rgba,
            full_range: true,
        })
    }
}

fn sample(plane: &crate::decode::Plane, x: Tap, y: Tap) -> i32 {
    let at = |row: usize, column: usize| plane.data[row * plane.stride + column] as u32;
    let top = at(y.first, x.first) * (256 - x.weight) + at(y.first, x.second) * x.weight;
    let bottom = at(y.second, x.first) * (256 - x.weight) + at(y.second, x.second) * x.weight;
    ((top * (256 - y.weight) + bottom * y.weight + (1 << 15)) >> 16) as i32
}

fn yuv_to_rgb(y: i32, cb: i32, cr: i32, range: ColorRange) -> [u8; 3] {
    let d = cb - 128;
    let e = cr - 128;
    let (r, g, b) = match range {
        ColorRange::Limited => {
            let c = 298 * (y - 16);
            (
                (c + 409 * e + 128) >> 8,
                (c - 100 * d - 208 * e + 128) >> 8,
                (c + 516 * d + 128) >> 8,
            )
        }
        ColorRange::Full => {
            let c = y << 8;
            (
                (c + 359 * e + 128) >> 8,
                (c - 88 * d - 183 * e + 128) >> 8,
                (c + 454 * d + 128) >> 8,
            )
        }
    };
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Plane;

    #[test]
    fn limited_range_black_and_white() -> CaptureResult<()> {
        let converter = FrameConverter::new(4, 2, 4, 2)?;
        let white = converter.convert(&DecodedFrame::filled(4, 2, 235, 128, 128))?;
        assert_eq!(white.rgba.len(), 4 * 2 * 4);
        assert!(white.rgba.chunks(4).all(|px| px == [255, 255, 255, 255]));
        let black = converter.convert(&DecodedFrame::filled(4, 2, 16, 128, 128))?;
        assert!(black.rgba.chunks(4).all(|px| px == [0, 0, 0, 255]));
        assert!(black.full_range);
        Ok(())
    }

    #[test]
    fn full_range_grey_is_preserved() -> CaptureResult<()> {
        let mut frame = DecodedFrame::filled(2, 2, 200, 128, 128);
        frame.range = ColorRange::Full;
        let converted = FrameConverter::new(2, 2, 2, 2)?.convert(&frame)?;
        assert!(converted.rgba.chunks(4).all(|px| px == [200, 200, 200, 255]));
        Ok(())
    }

    #[test]
    fn equal_size_luma_is_sampled_exactly() -> CaptureResult<()> {
        let mut frame = DecodedFrame::filled(3, 1, 0, 128, 128);
        frame.range = ColorRange::Full;
        frame.planes[0].data = vec![10, 20, 30];
        let converted = FrameConverter::new(3, 1, 3, 1)?.convert(&frame)?;
        let reds: Vec<u8> = converted.rgba.chunks(4).map(|px| px[0]).collect();
        assert_eq!(reds, vec![10, 20, 30]);
        Ok(())
    }

    #[test]
    fn padded_strides_are_honoured() -> CaptureResult<()> {
        let mut frame = DecodedFrame::filled(2, 2, 235, 128, 128);
        frame.planes[0] = Plane {
            data: vec![235, 235, 0, 0, 235, 235, 0, 0],
            stride: 4,
        };
        let converted = FrameConverter::new(2, 2, 2, 2)?.convert(&frame)?;
        assert!(converted.rgba.chunks(4).all(|px| px == [255, 255, 255, 255]));
        Ok(())
    }

    #[test]
    fn zero_sized_context_is_rejected() {
        assert!(matches!(
            FrameConverter::new(0, 10, 0, 10),
            Err(CaptureError::Conversion(_))
        ));
    }

    #[test]
    fn short_plane_is_a_conversion_error() -> CaptureResult<()> {
        let mut frame = DecodedFrame::filled(4, 4, 100, 128, 128);
        frame.planes[2].data.truncate(1);
        let converter = FrameConverter::new(4, 4, 4, 4)?;
        assert!(matches!(
            converter.convert(&frame),
            Err(CaptureError::Conversion(_))
        ));
        Ok(())
    }

    #[test]
    fn mismatched_geometry_is_a_conversion_error() -> CaptureResult<()> {
        let converter = FrameConverter::new(4, 4, 4, 4)?;
        let frame = DecodedFrame::filled(8, 8, 100, 128, 128);
        assert!(converter.convert(&frame).is_err());
        Ok(())
    }
}
