//! Decoded grayscale frames — image decoding, brightness and orientation.

use crate::types::ImageBounds;
use image::{GrayImage, ImageReader};
use std::io::Cursor;
use thiserror::Error;

/// Share of pixels in the darkest bucket above which a frame counts as dark.
const DARK_FRAME_PCT: f32 = 0.95;
const DIM_BRIGHTNESS: f32 = 70.0;
const BRIGHT_BRIGHTNESS: f32 = 180.0;
/// Aspect ratios within this distance of 1.0 are reported as square.
const SQUARE_TOLERANCE: f32 = 0.05;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("buffer length mismatch: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A decoded grayscale image.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Pixel dimensions from the image header, without decoding pixel data.
///
/// `None` when the bytes are not in a recognised image format.
pub fn probe_bounds(bytes: &[u8]) -> Option<ImageBounds> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()?;
    Some(ImageBounds { width, height })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brightness {
    Dark,
    Dim,
    Normal,
    Bright,
}

impl Brightness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Brightness::Dark => "dark",
            Brightness::Dim => "dim",
            Brightness::Normal => "well-lit",
            Brightness::Bright => "bright",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
    Square,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::Square => "square",
        }
    }
}

impl Frame {
    /// Decode any format the `image` crate recognises and convert to 8-bit luma.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let decoded = image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
        let gray = decoded.to_luma8();
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        Ok(Self {
            data: gray.into_raw(),
            width,
            height,
        })
    }

    pub fn from_gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    pub fn bounds(&self) -> ImageBounds {
        ImageBounds {
            width: self.width,
            height: self.height,
        }
    }

    pub fn into_gray_image(self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// True if more than 95% of pixels fall in the darkest bucket (0–31).
    pub fn is_dark(&self) -> bool {
        if self.data.is_empty() {
            return true;
        }
        let dark_count = self.data.iter().filter(|&&p| p < 32).count();
        (dark_count as f32 / self.data.len() as f32) > DARK_FRAME_PCT
    }

    pub fn brightness(&self) -> Brightness {
        if self.is_dark() {
            return Brightness::Dark;
        }
        match self.avg_brightness() {
            b if b < DIM_BRIGHTNESS => Brightness::Dim,
            b if b > BRIGHT_BRIGHTNESS => Brightness::Bright,
            _ => Brightness::Normal,
        }
    }

    pub fn orientation(&self) -> Orientation {
        let aspect = self.width as f32 / self.height as f32;
        if (aspect - 1.0).abs() <= SQUARE_TOLERANCE {
            Orientation::Square
        } else if aspect > 1.0 {
            Orientation::Landscape
        } else {
            Orientation::Portrait
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};

    fn png_bytes(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img = GrayImage::from_pixel(width, height, Luma([value]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let frame = Frame::decode(&png_bytes(8, 4, 200)).unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.data.len(), 32);
        assert!((frame.avg_brightness() - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_probe_bounds() {
        assert_eq!(
            probe_bounds(&png_bytes(12, 7, 0)),
            Some(ImageBounds { width: 12, height: 7 })
        );
        assert_eq!(probe_bounds(b"FACE123"), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Frame::decode(b"FACE123"), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_from_gray_checks_length() {
        assert!(matches!(
            Frame::from_gray(vec![0; 5], 2, 2),
            Err(FrameError::InvalidLength { expected: 4, actual: 5 })
        ));
        assert!(matches!(
            Frame::from_gray(vec![], 0, 2),
            Err(FrameError::Empty { .. })
        ));
    }

    #[test]
    fn test_brightness_classes() {
        let dark = Frame::from_gray(vec![5; 100], 10, 10).unwrap();
        assert_eq!(dark.brightness(), Brightness::Dark);

        let dim = Frame::from_gray(vec![50; 100], 10, 10).unwrap();
        assert_eq!(dim.brightness(), Brightness::Dim);

        let normal = Frame::from_gray(vec![128; 100], 10, 10).unwrap();
        assert_eq!(normal.brightness(), Brightness::Normal);

        let bright = Frame::from_gray(vec![240; 100], 10, 10).unwrap();
        assert_eq!(bright.brightness(), Brightness::Bright);
    }

    #[test]
    fn test_orientation() {
        assert_eq!(Frame::from_gray(vec![0; 20], 5, 4).unwrap().orientation(), Orientation::Landscape);
        assert_eq!(Frame::from_gray(vec![0; 20], 4, 5).unwrap().orientation(), Orientation::Portrait);
        assert_eq!(Frame::from_gray(vec![0; 16], 4, 4).unwrap().orientation(), Orientation::Square);
    }
}
