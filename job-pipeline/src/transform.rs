use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::{error::AppError, storage::types::job::JobType};
use image::{DynamicImage, GrayImage, Luma};

const SHIFT_DEGREES: i32 = 120;
const CLAMP_MIN: u8 = 32;
const CLAMP_MAX: u8 = 223;

/// Loads `source`, applies the transform for `kind` and writes `destination`.
#[async_trait]
pub trait ImageTransformer: Send + Sync {
    async fn transform(
        &self,
        kind: JobType,
        source: &Path,
        destination: &Path,
    ) -> Result<(), AppError>;
}

/// Default transformer backed by the `image` crate. Work runs on the blocking
/// pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterTransformer;

#[async_trait]
impl ImageTransformer for RasterTransformer {
    async fn transform(
        &self,
        kind: JobType,
        source: &Path,
        destination: &Path,
    ) -> Result<(), AppError> {
        let source: PathBuf = source.to_path_buf();
        let destination: PathBuf = destination.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(), AppError> {
            let input = image::open(&source)?;
            let output = apply(kind, &input)?;
            output.save(&destination)?;
            Ok(())
        })
        .await?
    }
}

pub fn apply(kind: JobType, input: &DynamicImage) -> Result<DynamicImage, AppError> {
    match kind {
        JobType::Grayscale => Ok(input.grayscale()),
        JobType::Shift => Ok(input.huerotate(SHIFT_DEGREES)),
        JobType::Clamp => Ok(clamp(input)),
        JobType::RgbToHue => Ok(hue_map(input)),
        JobType::None => Err(AppError::Transform(
            "Job has no transform type".to_string(),
        )),
    }
}

fn clamp(input: &DynamicImage) -> DynamicImage {
    if input.color().has_alpha() {
        let mut buffer = input.to_rgba8();
        for pixel in buffer.pixels_mut() {
            for channel in pixel.0.iter_mut().take(3) {
                *channel = (*channel).clamp(CLAMP_MIN, CLAMP_MAX);
            }
        }
        DynamicImage::ImageRgba8(buffer)
    } else {
        let mut buffer = input.to_rgb8();
        for pixel in buffer.pixels_mut() {
            for channel in &mut pixel.0 {
                *channel = (*channel).clamp(CLAMP_MIN, CLAMP_MAX);
            }
        }
        DynamicImage::ImageRgb8(buffer)
    }
}

fn hue_map(input: &DynamicImage) -> DynamicImage {
    let rgb = input.to_rgb8();
    let gray = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Luma([hue_to_level(hue_degrees(r, g, b))])
    });
    DynamicImage::ImageLuma8(gray)
}

/// Hue in degrees, `[0, 360)`. Achromatic pixels have hue 0.
fn hue_degrees(r: u8, g: u8, b: u8) -> f32 {
    let (r, g, b) = (
        f32::from(r) / 255.0,
        f32::from(g) / 255.0,
        f32::from(b) / 255.0,
    );
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if delta <= f32::EPSILON {
        return 0.0;
    }

    let hue = if (max - r).abs() <= f32::EPSILON {
        60.0 * (((g - b) / delta) % 6.0)
    } else if (max - g).abs() <= f32::EPSILON {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    if hue < 0.0 {
        hue + 360.0
    } else {
        hue
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hue_to_level(hue: f32) -> u8 {
    (hue / 360.0 * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample() -> DynamicImage {
        let mut buffer = RgbImage::new(3, 1);
        buffer.put_pixel(0, 0, Rgb([255, 0, 0]));
        buffer.put_pixel(1, 0, Rgb([0, 255, 0]));
        buffer.put_pixel(2, 0, Rgb([0, 0, 255]));
        DynamicImage::ImageRgb8(buffer)
    }

    #[test]
    fn test_hue_degrees() {
        assert!(hue_degrees(255, 0, 0).abs() < 0.01);
        assert!((hue_degrees(0, 255, 0) - 120.0).abs() < 0.01);
        assert!((hue_degrees(0, 0, 255) - 240.0).abs() < 0.01);
        assert!((hue_degrees(255, 0, 255) - 300.0).abs() < 0.01);
        assert!(hue_degrees(90, 90, 90).abs() < 0.01);
    }

    #[test]
    fn test_rgb_to_hue_levels() {
        let output = apply(JobType::RgbToHue, &sample()).expect("transform");
        let gray = output.to_luma8();

        assert_eq!(gray.get_pixel(0, 0).0, [0]);
        assert_eq!(gray.get_pixel(1, 0).0, [85]);
        assert_eq!(gray.get_pixel(2, 0).0, [170]);
    }

    #[test]
    fn test_clamp_limits_channels() {
        let output = apply(JobType::Clamp, &sample()).expect("transform");
        let rgb = output.to_rgb8();

        assert_eq!(rgb.get_pixel(0, 0).0, [223, 32, 32]);
        assert_eq!(rgb.get_pixel(1, 0).0, [32, 223, 32]);
        assert_eq!(rgb.get_pixel(2, 0).0, [32, 32, 223]);
    }

    #[test]
    fn test_clamp_keeps_alpha() {
        let mut buffer = image::RgbaImage::new(1, 1);
        buffer.put_pixel(0, 0, image::Rgba([0, 255, 100, 7]));
        let output = apply(JobType::Clamp, &DynamicImage::ImageRgba8(buffer)).expect("transform");

        assert_eq!(output.to_rgba8().get_pixel(0, 0).0, [32, 223, 100, 7]);
    }

    #[test]
    fn test_grayscale_and_shift_keep_dimensions() {
        let gray = apply(JobType::Grayscale, &sample()).expect("transform");
        assert_eq!((gray.width(), gray.height()), (3, 1));
        let rgb = gray.to_rgb8();
        for pixel in rgb.pixels() {
            assert_eq!(pixel.0[0], pixel.0[1]);
            assert_eq!(pixel.0[1], pixel.0[2]);
        }

        let shifted = apply(JobType::Shift, &sample()).expect("transform");
        assert_eq!((shifted.width(), shifted.height()), (3, 1));
        assert_ne!(shifted.to_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_none_is_rejected() {
        assert!(matches!(
            apply(JobType::None, &sample()),
            Err(AppError::Transform(_))
        ));
    }

    #[tokio::test]
    async fn test_raster_transformer_round_trips_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("in.png");
        let destination = dir.path().join("in_result.png");
        sample().save(&source).expect("write source");

        RasterTransformer
            .transform(JobType::RgbToHue, &source, &destination)
            .await
            .expect("transform");

        let written = image::open(&destination).expect("read result").to_luma8();
        assert_eq!(written.get_pixel(1, 0).0, [85]);

        let missing = RasterTransformer
            .transform(JobType::Grayscale, &dir.path().join("nope.png"), &destination)
            .await;
        assert!(missing.is_err());
    }
}
