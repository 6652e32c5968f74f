//! Image transformation pipeline.
//!
//! A pure function over bytes: decode, apply the validated operations in
//! order, re-encode. PNG input stays PNG; everything else is encoded as
//! JPEG at quality 90. No I/O happens here; the worker owns downloads,
//! uploads and state transitions.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::models::operation::{FlipDirection, Operation};

const JPEG_QUALITY: u8 = 90;

/// Result of running the pipeline.
#[derive(Debug)]
pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(image::ImageError),
}

/// Apply `operations` to `data` and re-encode.
pub fn process(
    data: &[u8],
    content_type: &str,
    operations: &[Operation],
) -> Result<ProcessedImage, ProcessError> {
    let format = image::guess_format(data).map_err(ProcessError::Decode)?;
    let mut img = image::load_from_memory(data).map_err(ProcessError::Decode)?;

    for op in operations {
        img = apply_operation(img, op);
    }

    let keep_png = format == ImageFormat::Png || content_type.contains("png");
    let (output_format, output_content_type) = if keep_png {
        (ImageFormat::Png, "image/png")
    } else {
        (ImageFormat::Jpeg, "image/jpeg")
    };

    let mut out = Vec::new();
    match output_format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel; also lets us pin the quality.
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(ProcessError::Encode)?;
        }
        _ => {
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(ProcessError::Encode)?;
        }
    }

    Ok(ProcessedImage {
        data: out,
        content_type: output_content_type.to_string(),
        width: img.width(),
        height: img.height(),
    })
}

fn apply_operation(img: DynamicImage, op: &Operation) -> DynamicImage {
    match *op {
        Operation::Resize { width, height } => resize(img, width, height),
        Operation::Thumbnail { size } => img.resize_to_fill(size, size, FilterType::Lanczos3),
        Operation::Blur { sigma } => img.blur(sigma),
        Operation::Sharpen { sigma } => img.unsharpen(sigma, 1),
        Operation::Grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
        Operation::Sepia => sepia(img),
        Operation::Rotate { degrees } => match degrees {
            90 => img.rotate90(),
            180 => img.rotate180(),
            _ => img.rotate270(),
        },
        Operation::Flip { direction } => match direction {
            FlipDirection::Horizontal => img.fliph(),
            FlipDirection::Vertical => img.flipv(),
        },
        Operation::Brightness { amount } => {
            // Percentage of full scale, matching the upstream semantics.
            img.brighten((amount / 100.0 * 255.0) as i32)
        }
        Operation::Contrast { amount } => img.adjust_contrast(amount),
        Operation::Saturation { amount } => saturate(img, amount),
    }
}

/// A zero dimension preserves aspect ratio; both zero is a no-op.
fn resize(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    match (width, height) {
        (0, 0) => img,
        (w, 0) => {
            let h = scaled_dimension(img.height(), img.width(), w);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        (0, h) => {
            let w = scaled_dimension(img.width(), img.height(), h);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        (w, h) => img.resize_exact(w, h, FilterType::Lanczos3),
    }
}

fn scaled_dimension(other: u32, reference: u32, target: u32) -> u32 {
    let scaled = (other as u64 * target as u64) / reference.max(1) as u64;
    (scaled as u32).max(1)
}

fn sepia(img: DynamicImage) -> DynamicImage {
    let mut rgba: RgbaImage = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let (rf, gf, bf) = (r as f32, g as f32, b as f32);
        let sr = (0.393 * rf + 0.769 * gf + 0.189 * bf).min(255.0);
        let sg = (0.349 * rf + 0.686 * gf + 0.168 * bf).min(255.0);
        let sb = (0.272 * rf + 0.534 * gf + 0.131 * bf).min(255.0);
        *pixel = Rgba([sr as u8, sg as u8, sb as u8, a]);
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Scale each channel's distance from its luminance. -100 is grayscale,
/// +100 doubles the saturation.
fn saturate(img: DynamicImage, amount: f32) -> DynamicImage {
    let factor = 1.0 + amount / 100.0;
    let mut rgba: RgbaImage = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let luma = 0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32;
        let adjust = |c: u8| (luma + (c as f32 - luma) * factor).clamp(0.0, 255.0) as u8;
        *pixel = Rgba([adjust(r), adjust(g), adjust(b), a]);
    }
    DynamicImage::ImageRgba8(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("encode fixture");
        out
    }

    #[test]
    fn resize_with_one_zero_dimension_preserves_aspect_ratio() {
        let data = png_fixture(64, 48);
        let result = process(
            &data,
            "image/png",
            &[Operation::Resize {
                width: 32,
                height: 0,
            }],
        )
        .expect("process");
        assert_eq!((result.width, result.height), (32, 24));
    }

    #[test]
    fn resize_with_both_zero_is_a_no_op() {
        let data = png_fixture(64, 48);
        let result = process(
            &data,
            "image/png",
            &[Operation::Resize {
                width: 0,
                height: 0,
            }],
        )
        .expect("process");
        assert_eq!((result.width, result.height), (64, 48));
    }

    #[test]
    fn thumbnail_is_square() {
        let data = png_fixture(120, 48);
        let result = process(&data, "image/png", &[Operation::Thumbnail { size: 16 }])
            .expect("process");
        assert_eq!((result.width, result.height), (16, 16));
    }

    #[test]
    fn rotate_quarter_turn_swaps_dimensions() {
        let data = png_fixture(64, 48);
        let result = process(&data, "image/png", &[Operation::Rotate { degrees: 90 }])
            .expect("process");
        assert_eq!((result.width, result.height), (48, 64));

        let result = process(&data, "image/png", &[Operation::Rotate { degrees: 180 }])
            .expect("process");
        assert_eq!((result.width, result.height), (64, 48));
    }

    #[test]
    fn grayscale_flattens_channels() {
        let data = png_fixture(8, 8);
        let result =
            process(&data, "image/png", &[Operation::Grayscale]).expect("process");
        let decoded = image::load_from_memory(&result.data).expect("decode").to_rgb8();
        for pixel in decoded.pixels() {
            assert_eq!(pixel[0], pixel[1]);
            assert_eq!(pixel[1], pixel[2]);
        }
    }

    #[test]
    fn full_desaturation_matches_grayscale_shape() {
        let data = png_fixture(8, 8);
        let result = process(
            &data,
            "image/png",
            &[Operation::Saturation { amount: -100.0 }],
        )
        .expect("process");
        let decoded = image::load_from_memory(&result.data).expect("decode").to_rgb8();
        for pixel in decoded.pixels() {
            let max = pixel.0.iter().max().unwrap();
            let min = pixel.0.iter().min().unwrap();
            assert!(max - min <= 1, "expected near-gray pixel, got {:?}", pixel);
        }
    }

    #[test]
    fn png_input_stays_png() {
        let data = png_fixture(8, 8);
        let result = process(&data, "image/png", &[]).expect("process");
        assert_eq!(result.content_type, "image/png");
        assert_eq!(image::guess_format(&result.data).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn jpeg_input_encodes_jpeg() {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([200, 100, 50]));
        let mut data = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Jpeg)
            .expect("encode fixture");

        let result = process(&data, "image/jpeg", &[Operation::Thumbnail { size: 8 }])
            .expect("process");
        assert_eq!(result.content_type, "image/jpeg");
        assert_eq!(
            image::guess_format(&result.data).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn operations_apply_in_order() {
        let data = png_fixture(64, 48);
        let result = process(
            &data,
            "image/png",
            &[
                Operation::Resize {
                    width: 32,
                    height: 0,
                },
                Operation::Rotate { degrees: 90 },
            ],
        )
        .expect("process");
        assert_eq!((result.width, result.height), (24, 32));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = process(b"definitely not an image", "image/jpeg", &[]).unwrap_err();
        assert!(matches!(err, ProcessError::Decode(_)));
    }
}
