use serde::Deserialize;
use std::fmt;

/// Pixel layout of a frame as delivered by the camera driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Already JPEG-compressed by the sensor.
    Jpeg,
    /// 16-bit 5-6-5, high byte first (sensor byte order).
    Rgb565,
    /// 24-bit truecolor, R G B.
    Rgb888,
    /// 8-bit luma.
    Grayscale,
    /// Packed YUYV 4:2:2, two pixels per four bytes.
    Yuv422,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats, `None` for JPEG.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Grayscale => Some(1),
        }
    }

    /// Exact buffer length a raw frame of this size must have.
    pub fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
    }

    pub fn is_jpeg(self) -> bool {
        self == PixelFormat::Jpeg
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Rgb888 => "rgb888",
            PixelFormat::Grayscale => "grayscale",
            PixelFormat::Yuv422 => "yuv422",
        };
        f.write_str(name)
    }
}

/// Metadata of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub len: usize,
}

impl FrameInfo {
    /// Size of the width×height×3 truecolor intermediate.
    pub fn truecolor_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Checks the buffer length against the declared geometry.
    /// JPEG frames only need to be non-empty.
    pub fn check_len(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyGeometry);
        }
        match self.format.expected_len(self.width, self.height) {
            Some(expected) if expected != self.len => Err(FrameError::LengthMismatch {
                format: self.format,
                got: self.len,
                expected,
            }),
            None if self.len == 0 => Err(FrameError::LengthMismatch {
                format: self.format,
                got: 0,
                expected: 1,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has zero width or height")]
    EmptyGeometry,
    #[error("{format} frame has {got} bytes, expected {expected}")]
    LengthMismatch {
        format: PixelFormat,
        got: usize,
        expected: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qvga_rgb565_length() {
        assert_eq!(PixelFormat::Rgb565.expected_len(320, 240), Some(153_600));
        assert_eq!(PixelFormat::Jpeg.expected_len(320, 240), None);
    }

    #[test]
    fn truecolor_len_is_three_bytes_per_pixel() {
        let info = FrameInfo {
            width: 320,
            height: 240,
            format: PixelFormat::Grayscale,
            len: 76_800,
        };
        assert_eq!(info.truecolor_len(), 230_400);
        assert!(info.check_len().is_ok());
    }

    #[test]
    fn short_raw_frame_rejected() {
        let info = FrameInfo {
            width: 4,
            height: 4,
            format: PixelFormat::Rgb565,
            len: 31,
        };
        assert!(matches!(
            info.check_len(),
            Err(FrameError::LengthMismatch { expected: 32, .. })
        ));
    }

    #[test]
    fn empty_jpeg_rejected() {
        let info = FrameInfo {
            width: 4,
            height: 4,
            format: PixelFormat::Jpeg,
            len: 0,
        };
        assert!(info.check_len().is_err());
    }
}
