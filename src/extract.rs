use ndarray::prelude::*;

use crate::errors::{Result, TileSegError};
use crate::tiling::TilePlan;

/// Per-channel standardisation applied after scaling samples to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// The statistics the segmentation models are trained with.
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Leaves `x / 255` untouched.
    pub const IDENTITY: Self = Self {
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };

    #[inline]
    pub fn apply(&self, channel: usize, sample: u8) -> f32 {
        (sample as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }

    #[inline]
    pub fn invert(&self, channel: usize, value: f32) -> f32 {
        (value * self.std[channel] + self.mean[channel]) * 255.0
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Rejects anything that is not a non-empty `(height, width, 3)` array.
pub fn validate_image(image: &ArrayView3<u8>) -> Result<()> {
    let shape = image.shape();
    if shape[2] != 3 {
        return Err(TileSegError::InvalidImage {
            reason: format!("expected 3 channels, got {}", shape[2]),
            shape: shape.to_vec(),
        });
    }
    if shape[0] == 0 || shape[1] == 0 {
        return Err(TileSegError::InvalidImage {
            reason: "image has no pixels".to_string(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Cuts every tile of `plan` out of an HWC image into a normalised NCHW batch.
///
/// Tiles overhanging the bottom/right edge are zero-padded. The padding is
/// applied to raw samples, so padded positions hold `normalization(0)` rather
/// than `0.0` after standardisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileExtractor {
    normalization: Normalization,
}

impl TileExtractor {
    pub const fn new(normalization: Normalization) -> Self {
        Self { normalization }
    }

    pub const fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn extract(&self, image: ArrayView3<u8>, plan: &TilePlan) -> Result<Array4<f32>> {
        validate_image(&image)?;
        let (height, width, _) = image.dim();
        if (height, width) != (plan.image_height, plan.image_width) {
            return Err(TileSegError::InvalidImage {
                reason: format!(
                    "plan was computed for {}x{}",
                    plan.image_height, plan.image_width
                ),
                shape: image.shape().to_vec(),
            });
        }

        let crop = plan.crop_size;
        let mut batch = Array4::<f32>::zeros((plan.len(), 3, crop, crop));
        let padded: [f32; 3] = std::array::from_fn(|c| self.normalization.apply(c, 0));

        for (mut tile, interval) in batch.outer_iter_mut().zip(plan) {
            for (c, &fill) in padded.iter().enumerate() {
                tile.index_axis_mut(Axis(0), c).fill(fill);
            }

            let valid_h = interval.valid_height(height);
            let valid_w = interval.valid_width(width);
            let source = image.slice(s![
                interval.rows.start..interval.rows.start + valid_h,
                interval.cols.start..interval.cols.start + valid_w,
                ..
            ]);
            // HWC -> CHW
            let source = source.permuted_axes([2, 0, 1]);

            let mut target = tile.slice_mut(s![.., ..valid_h, ..valid_w]);
            for (c, (mut dst, src)) in target
                .outer_iter_mut()
                .zip(source.outer_iter())
                .enumerate()
            {
                let norm = self.normalization;
                dst.zip_mut_with(&src, |d, &v| *d = norm.apply(c, v));
            }
        }

        Ok(batch)
    }
}

impl Default for TileExtractor {
    fn default() -> Self {
        Self::new(Normalization::IMAGENET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::plan;

    fn gradient_image(height: usize, width: usize) -> Array3<u8> {
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            ((y * 31 + x * 7 + c * 50) % 256) as u8
        })
    }

    #[test]
    fn test_imagenet_normalization() {
        let norm = Normalization::IMAGENET;
        let expected = (1.0 - 0.485) / 0.229;
        assert!((norm.apply(0, 255) - expected).abs() < 1e-6);
        assert!((norm.apply(2, 0) + 0.406 / 0.225).abs() < 1e-6);
    }

    #[test]
    fn test_extract_shape_and_layout() -> Result<()> {
        let image = gradient_image(10, 10);
        let plan = plan(10, 10, 6, 1.0 / 3.0)?;
        let batch = TileExtractor::new(Normalization::IDENTITY).extract(image.view(), &plan)?;

        assert_eq!(batch.shape(), &[9, 3, 6, 6]);
        // tile (4, 4): channel 1, local (2, 3) -> image (6, 7, 1)
        let value = batch[[4, 1, 2, 3]];
        assert!((value - image[[6, 7, 1]] as f32 / 255.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_overhang_is_zero_padded() -> Result<()> {
        let image = Array3::<u8>::from_elem((10, 10, 3), 200);
        let plan = plan(10, 10, 6, 1.0 / 3.0)?;
        let batch = TileExtractor::new(Normalization::IDENTITY).extract(image.view(), &plan)?;

        let last = batch.index_axis(Axis(0), 8);
        for c in 0..3 {
            for y in 0..6 {
                for x in 0..6 {
                    let expected = if y < 2 && x < 2 { 200.0 / 255.0 } else { 0.0 };
                    assert!((last[[c, y, x]] - expected).abs() < 1e-6);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_inner_tile_round_trip() -> Result<()> {
        let image = gradient_image(20, 20);
        let plan = plan(20, 20, 8, 0.25)?;
        let extractor = TileExtractor::default();
        let batch = extractor.extract(image.view(), &plan)?;

        for (tile, interval) in batch.outer_iter().zip(&plan) {
            if interval.overhangs(20, 20) {
                continue;
            }
            for ((c, y, x), &v) in tile.indexed_iter() {
                let restored = extractor.normalization().invert(c, v).round() as u8;
                assert_eq!(
                    restored,
                    image[[interval.rows.start + y, interval.cols.start + x, c]]
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_channel_count() -> Result<()> {
        let image = Array3::<u8>::zeros((4, 4, 4));
        let plan = plan(4, 4, 4, 0.0)?;
        let result = TileExtractor::default().extract(image.view(), &plan);
        assert!(matches!(result, Err(TileSegError::InvalidImage { .. })));
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_plan() -> Result<()> {
        let image = Array3::<u8>::zeros((4, 4, 3));
        let plan = plan(8, 8, 4, 0.0)?;
        assert!(TileExtractor::default().extract(image.view(), &plan).is_err());
        Ok(())
    }
}
