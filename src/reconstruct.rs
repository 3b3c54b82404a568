use ndarray::prelude::*;

use crate::errors::{Result, TileSegError};
use crate::tiling::TilePlan;

/// Scatters per-tile class scores back onto the full image.
///
/// Overlapping contributions are summed, not averaged, so the accumulated
/// values are unnormalised scores: only their per-pixel argmax is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskReconstructor {
    num_classes: usize,
}

impl MaskReconstructor {
    pub const fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Summed scores of shape `(height, width, num_classes)`.
    ///
    /// `probs` is `(tile_count, num_classes, crop, crop)` in plan order.
    pub fn accumulate(&self, probs: ArrayView4<f32>, plan: &TilePlan) -> Result<Array3<f32>> {
        let expected = [plan.len(), self.num_classes, plan.crop_size, plan.crop_size];
        if probs.shape() != expected {
            return Err(TileSegError::inference(
                format!(
                    "reconstruction expected probabilities of shape {:?}, got {:?}",
                    expected,
                    probs.shape()
                ),
                0,
                ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape),
            ));
        }

        let (height, width) = (plan.image_height, plan.image_width);
        let mut accumulator = Array3::<f32>::zeros((height, width, self.num_classes));

        for (tile, interval) in probs.outer_iter().zip(plan) {
            // CHW -> HWC
            let tile = tile.permuted_axes([1, 2, 0]);
            let valid_h = interval.valid_height(height);
            let valid_w = interval.valid_width(width);

            let mut region = accumulator.slice_mut(s![
                interval.rows.start..interval.rows.start + valid_h,
                interval.cols.start..interval.cols.start + valid_w,
                ..
            ]);
            region += &tile.slice(s![..valid_h, ..valid_w, ..]);
        }

        Ok(accumulator)
    }

    pub fn reconstruct(&self, probs: ArrayView4<f32>, plan: &TilePlan) -> Result<Array2<usize>> {
        let accumulator = self.accumulate(probs, plan)?;
        Ok(argmax_last_axis(accumulator.view()))
    }
}

/// Index of the first maximum along the class axis; ties go to the lowest index.
pub fn argmax_last_axis(scores: ArrayView3<f32>) -> Array2<usize> {
    scores.map_axis(Axis(2), |classes| {
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for (class, &value) in classes.iter().enumerate() {
            if value > best_value {
                best = class;
                best_value = value;
            }
        }
        best
    })
}
