//! Image operations backing tile encoding, merging and resampling.
//!
//! Thin wrappers over the `image` crate. The cache stores encoded bytes;
//! everything here converts between those bytes and `RgbaImage` buffers for
//! the few operations the core needs: decode, encode with a configured
//! format, alpha-composite merging, nearest/bilinear resampling, blank tile
//! detection, and magic-byte sniffing for Content-Type fallback.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("merge size mismatch: base {base_w}x{base_h}, overlay {overlay_w}x{overlay_h}")]
    MergeSizeMismatch {
        base_w: u32,
        base_h: u32,
        overlay_w: u32,
        overlay_h: u32,
    },
}

/// PNG compression effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PngCompression {
    Fast,
    #[default]
    Default,
    Best,
}

/// Encoded image format configured per tileset (or per request).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Png {
        #[serde(default)]
        compression: PngCompression,
    },
    Jpeg {
        #[serde(default = "default_jpeg_quality")]
        quality: u8,
    },
}

fn default_jpeg_quality() -> u8 {
    85
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Png {
            compression: PngCompression::Default,
        }
    }
}

/// Format recovered from a buffer's leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Png,
    Jpeg,
}

impl SniffedFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            SniffedFormat::Png => "image/png",
            SniffedFormat::Jpeg => "image/jpeg",
        }
    }
}

impl ImageFormat {
    /// File extension used in cache keys.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png { .. } => "png",
            ImageFormat::Jpeg { .. } => "jpg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png { .. } => "image/png",
            ImageFormat::Jpeg { .. } => "image/jpeg",
        }
    }

    /// Encode a raw image into this format.
    pub fn encode(&self, raw: &RgbaImage) -> Result<Bytes, RasterError> {
        let mut out = Vec::new();
        match self {
            ImageFormat::Png { compression } => {
                let compression = match compression {
                    PngCompression::Fast => CompressionType::Fast,
                    PngCompression::Default => CompressionType::Default,
                    PngCompression::Best => CompressionType::Best,
                };
                let encoder =
                    PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive);
                encoder
                    .write_image(
                        raw.as_raw(),
                        raw.width(),
                        raw.height(),
                        ExtendedColorType::Rgba8,
                    )
                    .map_err(RasterError::Encode)?;
            }
            ImageFormat::Jpeg { quality } => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgba8(raw.clone()).to_rgb8();
                let encoder = JpegEncoder::new_with_quality(&mut out, *quality);
                encoder
                    .write_image(
                        rgb.as_raw(),
                        rgb.width(),
                        rgb.height(),
                        ExtendedColorType::Rgb8,
                    )
                    .map_err(RasterError::Encode)?;
            }
        }
        Ok(Bytes::from(out))
    }
}

/// Decode encoded bytes into a raw RGBA image.
pub fn decode(data: &[u8]) -> Result<RgbaImage, RasterError> {
    Ok(image::load_from_memory(data)
        .map_err(RasterError::Decode)?
        .to_rgba8())
}

/// Identify PNG or JPEG data from its magic bytes.
pub fn sniff(data: &[u8]) -> Option<SniffedFormat> {
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(SniffedFormat::Png)
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(SniffedFormat::Jpeg)
    } else {
        None
    }
}

/// Alpha-composite `overlay` onto `base` in place (standard "over"
/// operator). Both images must have the same dimensions.
pub fn merge(base: &mut RgbaImage, overlay: &RgbaImage) -> Result<(), RasterError> {
    if base.dimensions() != overlay.dimensions() {
        let (base_w, base_h) = base.dimensions();
        let (overlay_w, overlay_h) = overlay.dimensions();
        return Err(RasterError::MergeSizeMismatch {
            base_w,
            base_h,
            overlay_w,
            overlay_h,
        });
    }
    for (bp, op) in base.pixels_mut().zip(overlay.pixels()) {
        let oa = op.0[3] as u32;
        if oa == 255 {
            *bp = *op;
            continue;
        }
        if oa == 0 {
            continue;
        }
        let ba = bp.0[3] as u32;
        let out_a = oa + ba * (255 - oa) / 255;
        for c in 0..3 {
            let oc = op.0[c] as u32;
            let bc = bp.0[c] as u32;
            let blended = (oc * oa + bc * ba * (255 - oa) / 255) / out_a.max(1);
            bp.0[c] = blended.min(255) as u8;
        }
        bp.0[3] = out_a.min(255) as u8;
    }
    Ok(())
}

/// Whether the image is a single solid color; returns that color if so.
pub fn solid_color(raw: &RgbaImage) -> Option<Rgba<u8>> {
    let mut pixels = raw.pixels();
    let first = *pixels.next()?;
    if pixels.all(|p| *p == first) {
        Some(first)
    } else {
        None
    }
}

/// Copy `src` into `dst`, scaled by `(hf, vf)` and positioned so that the
/// top-left corner of `src` lands at `(off_x, off_y)` in `dst`, taking the
/// nearest source pixel.
pub fn copy_resampled_nearest(src: &RgbaImage, dst: &mut RgbaImage, off_x: f64, off_y: f64, hf: f64, vf: f64) {
    let (sw, sh) = src.dimensions();
    let (dw, dh) = dst.dimensions();
    for dy in 0..dh {
        let sy = (dy as f64 - off_y) / vf;
        if sy < 0.0 || sy >= sh as f64 {
            continue;
        }
        for dx in 0..dw {
            let sx = (dx as f64 - off_x) / hf;
            if sx < 0.0 || sx >= sw as f64 {
                continue;
            }
            dst.put_pixel(dx, dy, *src.get_pixel(sx as u32, sy as u32));
        }
    }
}

/// Like [`copy_resampled_nearest`] but with bilinear interpolation between
/// the four neighboring source pixels.
pub fn copy_resampled_bilinear(src: &RgbaImage, dst: &mut RgbaImage, off_x: f64, off_y: f64, hf: f64, vf: f64) {
    let (sw, sh) = src.dimensions();
    let (dw, dh) = dst.dimensions();
    for dy in 0..dh {
        let sy = ((dy as f64 - off_y) / vf - 0.5).max(0.0);
        if sy >= sh as f64 {
            continue;
        }
        let y0 = sy.floor() as u32;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = sy - y0 as f64;
        for dx in 0..dw {
            let sx = ((dx as f64 - off_x) / hf - 0.5).max(0.0);
            if sx >= sw as f64 {
                continue;
            }
            let x0 = sx.floor() as u32;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = sx - x0 as f64;

            let p00 = src.get_pixel(x0, y0);
            let p10 = src.get_pixel(x1, y0);
            let p01 = src.get_pixel(x0, y1);
            let p11 = src.get_pixel(x1, y1);
            let mut out = [0u8; 4];
            for c in 0..4 {
                let top = p00.0[c] as f64 * (1.0 - fx) + p10.0[c] as f64 * fx;
                let bottom = p01.0[c] as f64 * (1.0 - fx) + p11.0[c] as f64 * fx;
                out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
            dst.put_pixel(dx, dy, Rgba(out));
        }
    }
}

/// Extract a `width`x`height` sub-image starting at `(x, y)`.
pub fn crop(src: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
    image::imageops::crop_imm(src, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(rgba))
    }

    #[test]
    fn test_png_roundtrip() {
        let img = solid(4, 4, [10, 20, 30, 255]);
        let format = ImageFormat::default();
        let encoded = format.encode(&img).unwrap();
        assert_eq!(sniff(&encoded), Some(SniffedFormat::Png));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_jpeg_encode_sniffs_as_jpeg() {
        let img = solid(8, 8, [200, 100, 50, 255]);
        let encoded = ImageFormat::Jpeg { quality: 90 }.encode(&img).unwrap();
        assert_eq!(sniff(&encoded), Some(SniffedFormat::Jpeg));
    }

    #[test]
    fn test_sniff_rejects_garbage() {
        assert_eq!(sniff(b"not an image"), None);
        assert_eq!(sniff(&[]), None);
    }

    #[test]
    fn test_format_metadata() {
        assert_eq!(ImageFormat::default().extension(), "png");
        assert_eq!(ImageFormat::default().mime_type(), "image/png");
        assert_eq!(ImageFormat::Jpeg { quality: 85 }.extension(), "jpg");
        assert_eq!(ImageFormat::Jpeg { quality: 85 }.mime_type(), "image/jpeg");
    }

    #[test]
    fn test_merge_opaque_overlay_replaces_base() {
        let mut base = solid(4, 4, [255, 0, 0, 255]);
        let overlay = solid(4, 4, [0, 0, 255, 255]);
        merge(&mut base, &overlay).unwrap();
        assert_eq!(*base.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_merge_transparent_overlay_keeps_base() {
        let mut base = solid(4, 4, [255, 0, 0, 255]);
        let overlay = solid(4, 4, [0, 0, 255, 0]);
        merge(&mut base, &overlay).unwrap();
        assert_eq!(*base.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_merge_semi_transparent_blend() {
        // blue at ~50% alpha over opaque red lands between the two
        let mut base = solid(2, 2, [255, 0, 0, 255]);
        let overlay = solid(2, 2, [0, 0, 255, 128]);
        merge(&mut base, &overlay).unwrap();
        let p = base.get_pixel(0, 0);
        assert!(p.0[0] > 100 && p.0[0] < 140, "red channel {}", p.0[0]);
        assert!(p.0[2] > 100 && p.0[2] < 140, "blue channel {}", p.0[2]);
        assert_eq!(p.0[3], 255);
    }

    #[test]
    fn test_merge_size_mismatch() {
        let mut base = solid(4, 4, [0, 0, 0, 255]);
        let overlay = solid(2, 2, [0, 0, 0, 255]);
        assert!(matches!(
            merge(&mut base, &overlay),
            Err(RasterError::MergeSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_solid_color_detection() {
        assert_eq!(
            solid_color(&solid(8, 8, [1, 2, 3, 4])),
            Some(Rgba([1, 2, 3, 4]))
        );
        let mut img = solid(8, 8, [1, 2, 3, 4]);
        img.put_pixel(7, 7, Rgba([9, 9, 9, 9]));
        assert_eq!(solid_color(&img), None);
    }

    #[test]
    fn test_crop_extracts_sub_image() {
        let mut img = solid(4, 4, [0, 0, 0, 255]);
        img.put_pixel(2, 1, Rgba([7, 7, 7, 255]));
        let sub = crop(&img, 2, 1, 2, 2);
        assert_eq!(sub.dimensions(), (2, 2));
        assert_eq!(*sub.get_pixel(0, 0), Rgba([7, 7, 7, 255]));
    }

    #[test]
    fn test_nearest_identity_copy() {
        let mut src = solid(4, 4, [0, 0, 0, 255]);
        src.put_pixel(1, 2, Rgba([5, 6, 7, 255]));
        let mut dst = solid(4, 4, [255, 255, 255, 255]);
        copy_resampled_nearest(&src, &mut dst, 0.0, 0.0, 1.0, 1.0);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_nearest_offset_leaves_margin() {
        let src = solid(2, 2, [9, 9, 9, 255]);
        let mut dst = solid(4, 4, [0, 0, 0, 0]);
        copy_resampled_nearest(&src, &mut dst, 2.0, 2.0, 1.0, 1.0);
        assert_eq!(*dst.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
        assert_eq!(*dst.get_pixel(2, 2), Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn test_nearest_upscale() {
        let mut src = solid(2, 2, [0, 0, 0, 255]);
        src.put_pixel(1, 1, Rgba([8, 8, 8, 255]));
        let mut dst = solid(4, 4, [0, 0, 0, 0]);
        copy_resampled_nearest(&src, &mut dst, 0.0, 0.0, 2.0, 2.0);
        // the bottom-right source pixel covers the bottom-right 2x2 block
        assert_eq!(*dst.get_pixel(3, 3), Rgba([8, 8, 8, 255]));
        assert_eq!(*dst.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_bilinear_uniform_stays_uniform() {
        let src = solid(4, 4, [100, 100, 100, 255]);
        let mut dst = solid(8, 8, [0, 0, 0, 0]);
        copy_resampled_bilinear(&src, &mut dst, 0.0, 0.0, 2.0, 2.0);
        assert_eq!(*dst.get_pixel(4, 4), Rgba([100, 100, 100, 255]));
    }
}
