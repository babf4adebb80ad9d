use beecam_common::frame::{FrameInfo, PixelFormat};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageReader};
use std::io::Cursor;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to allocate {0} bytes for truecolor buffer")]
    Allocation(usize),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("failed to decode JPEG frame: {0}")]
    Decode(String),
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

/// Allocate the width×height×3 intermediate without aborting on OOM.
pub fn alloc_truecolor(width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
        .ok_or(ConvertError::Allocation(usize::MAX))?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ConvertError::Allocation(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Convert a native frame into RGB888, writing into `out`.
///
/// `out` must be exactly `info.truecolor_len()` bytes long.
pub fn to_rgb888(data: &[u8], info: &FrameInfo, out: &mut [u8]) -> Result<(), ConvertError> {
    info.check_len()
        .map_err(|e| ConvertError::InvalidFrame(e.to_string()))?;
    if data.len() != info.len {
        return Err(ConvertError::InvalidFrame(format!(
            "buffer holds {} bytes but frame declares {}",
            data.len(),
            info.len
        )));
    }
    if out.len() != info.truecolor_len() {
        return Err(ConvertError::InvalidFrame(format!(
            "output buffer is {} bytes, expected {}",
            out.len(),
            info.truecolor_len()
        )));
    }

    match info.format {
        PixelFormat::Rgb888 => out.copy_from_slice(data),
        PixelFormat::Rgb565 => {
            for (px, rgb) in data.chunks_exact(2).zip(out.chunks_exact_mut(3)) {
                let v = u16::from_be_bytes([px[0], px[1]]);
                let r = ((v >> 11) & 0x1F) as u8;
                let g = ((v >> 5) & 0x3F) as u8;
                let b = (v & 0x1F) as u8;
                rgb[0] = (r << 3) | (r >> 2);
                rgb[1] = (g << 2) | (g >> 4);
                rgb[2] = (b << 3) | (b >> 2);
            }
        }
        PixelFormat::Grayscale => {
            for (&y, rgb) in data.iter().zip(out.chunks_exact_mut(3)) {
                rgb.fill(y);
            }
        }
        PixelFormat::Yuv422 => {
            if info.width % 2 != 0 {
                return Err(ConvertError::InvalidFrame(
                    "YUV422 frames need an even width".into(),
                ));
            }
            for (yuyv, rgb) in data.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
                let (y0, u, y1, v) = (yuyv[0], yuyv[1], yuyv[2], yuyv[3]);
                rgb[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
                rgb[3..].copy_from_slice(&yuv_to_rgb(y1, u, v));
            }
        }
        PixelFormat::Jpeg => {
            let img = ImageReader::new(Cursor::new(data))
                .with_guessed_format()
                .map_err(|e| ConvertError::Decode(e.to_string()))?
                .decode()
                .map_err(|e| ConvertError::Decode(e.to_string()))?
                .to_rgb8();
            if img.width() != info.width || img.height() != info.height {
                return Err(ConvertError::InvalidFrame(format!(
                    "JPEG is {}x{}, frame declares {}x{}",
                    img.width(),
                    img.height(),
                    info.width,
                    info.height
                )));
            }
            out.copy_from_slice(img.as_raw());
        }
    }
    Ok(())
}

// BT.601 integer approximation
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Encode an RGB888 buffer to a freshly allocated JPEG.
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, ConvertError> {
    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| ConvertError::Encode(e.to_string()))?;
    debug!(width, height, quality, bytes = out.len(), "encoded JPEG");
    Ok(out)
}

/// Convert any non-JPEG frame straight to JPEG.
pub fn frame_to_jpeg(data: &[u8], info: &FrameInfo, quality: u8) -> Result<Vec<u8>, ConvertError> {
    let mut rgb = alloc_truecolor(info.width, info.height)?;
    to_rgb888(data, info, &mut rgb)?;
    encode_jpeg(&rgb, info.width, info.height, quality)
}
