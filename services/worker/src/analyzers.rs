//! Analyzers that ship with the worker.

use crate::analyzer::{AnalysisContext, AnalysisError, Analyzer, AnalyzerRegistry};
use crate::metadata::CameraMetadata;
use crate::sink::ResultValue;
use async_trait::async_trait;
use image::{GrayImage, ImageFormat, Luma};
use std::io::Cursor;
use tracing::debug;

/// Luma difference above which a pixel counts as changed.
const MOTION_THRESHOLD: u8 = 25;

pub fn register_builtins(registry: &mut AnalyzerRegistry) {
    registry.register("snapshot", |_camera: &CameraMetadata| -> Box<dyn Analyzer> {
        Box::new(SnapshotAnalyzer)
    });
    registry.register("motion", |_camera: &CameraMetadata| -> Box<dyn Analyzer> {
        Box::new(MotionAnalyzer::default())
    });
}

/// File extension matching the encoded payload, falling back to `jpg`.
fn image_extension(data: &[u8]) -> &'static str {
    image::guess_format(data)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("jpg")
}

/// Stores every captured frame unchanged.
#[derive(Debug, Default)]
pub struct SnapshotAnalyzer;

#[async_trait]
impl Analyzer for SnapshotAnalyzer {
    async fn on_new_frame(&mut self, ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
        let metadata = ctx.frame_metadata(0)?;
        let frame = ctx.frame(0)?;

        let name = format!(
            "{}_input.{}",
            metadata.file_stem(),
            image_extension(&frame.data)
        );
        ctx.save(name, ResultValue::Image(frame.data.clone())).await
    }
}

/// Frame-differencing motion estimate.
///
/// For every frame it stores the input image, a mask of the pixels that
/// changed since the previous frame and the changed fraction. The first frame
/// has no reference and reports zero motion. On finalize it stores the mean
/// over all frames.
#[derive(Debug, Default)]
pub struct MotionAnalyzer {
    previous: Option<GrayImage>,
    frames: u64,
    total_motion: f64,
}

impl MotionAnalyzer {
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn average_motion(&self) -> Option<f64> {
        (self.frames > 0).then(|| self.total_motion / self.frames as f64)
    }
}

/// Mask of changed pixels and the fraction of the frame they cover.
fn motion_mask(previous: &GrayImage, current: &GrayImage) -> (GrayImage, f64) {
    let mut changed = 0u64;
    let mask = GrayImage::from_fn(current.width(), current.height(), |x, y| {
        let before = previous.get_pixel(x, y)[0];
        let after = current.get_pixel(x, y)[0];
        if before.abs_diff(after) > MOTION_THRESHOLD {
            changed += 1;
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let total = u64::from(current.width()) * u64::from(current.height());
    let fraction = if total == 0 {
        0.0
    } else {
        changed as f64 / total as f64
    };
    (mask, fraction)
}

fn encode_png(image: &GrayImage) -> Result<bytes::Bytes, AnalysisError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(bytes::Bytes::from(out.into_inner()))
}

#[async_trait]
impl Analyzer for MotionAnalyzer {
    async fn on_new_frame(&mut self, ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
        let metadata = ctx.frame_metadata(0)?;
        let frame = ctx.frame(0)?;
        let stem = metadata.file_stem();

        ctx.save(
            format!("{}_input.{}", stem, image_extension(&frame.data)),
            ResultValue::Image(frame.data.clone()),
        )
        .await?;

        let current = frame.decode()?.to_luma8();
        let (mask, motion) = match &self.previous {
            Some(previous) if previous.dimensions() == current.dimensions() => {
                motion_mask(previous, &current)
            }
            Some(previous) => {
                debug!(
                    camera_id = %ctx.camera().camera_id,
                    before = ?previous.dimensions(),
                    after = ?current.dimensions(),
                    "Frame size changed, resetting motion reference"
                );
                (GrayImage::new(current.width(), current.height()), 0.0)
            }
            None => (GrayImage::new(current.width(), current.height()), 0.0),
        };

        ctx.save(format!("{}_mask.png", stem), encode_png(&mask)?).await?;
        ctx.save(format!("{}_motion.txt", stem), motion.to_string())
            .await?;

        self.previous = Some(current);
        self.frames += 1;
        self.total_motion += motion;
        Ok(())
    }

    async fn finalize(&mut self, ctx: &AnalysisContext<'_>) -> Result<(), AnalysisError> {
        match self.average_motion() {
            Some(average) => ctx.save("average_motion.txt", average.to_string()).await,
            None => Ok(()),
        }
    }
}
