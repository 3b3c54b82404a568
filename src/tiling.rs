//! Tile geometry: which square crops cover an image.
//!
//! The same planner serves inference (overlapping tiles) and dataset slicing
//! (`overlap_ratio = 0`).

use std::ops::Range;

use crate::errors::{Result, TileSegError};

/// A `crop_size x crop_size` window in original-image coordinates.
///
/// `rows.end` / `cols.end` may exceed the image bounds; the overhang is
/// zero-padded on extraction and discarded on reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileInterval {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl TileInterval {
    pub const fn new(row_start: usize, col_start: usize, crop_size: usize) -> Self {
        Self {
            rows: row_start..row_start + crop_size,
            cols: col_start..col_start + crop_size,
        }
    }

    /// Height of the part of this tile that lies inside an image of `image_height` rows.
    pub fn valid_height(&self, image_height: usize) -> usize {
        self.rows.end.min(image_height).saturating_sub(self.rows.start)
    }

    pub fn valid_width(&self, image_width: usize) -> usize {
        self.cols.end.min(image_width).saturating_sub(self.cols.start)
    }

    pub fn overhangs(&self, image_height: usize, image_width: usize) -> bool {
        self.rows.end > image_height || self.cols.end > image_width
    }
}

/// Ordered tiles covering an image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub image_height: usize,
    pub image_width: usize,
    pub crop_size: usize,
    pub step_size: usize,
    intervals: Vec<TileInterval>,
}

impl TilePlan {
    pub fn intervals(&self) -> &[TileInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TileInterval> {
        self.intervals.iter()
    }
}

impl<'a> IntoIterator for &'a TilePlan {
    type Item = &'a TileInterval;
    type IntoIter = std::slice::Iter<'a, TileInterval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

/// Validated crop/overlap pair. Construction fails eagerly so a bad
/// configuration never reaches inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlanner {
    crop_size: usize,
    overlap_size: usize,
}

impl TilePlanner {
    pub fn new(crop_size: usize, overlap_ratio: f64) -> Result<Self> {
        if crop_size == 0 {
            return Err(TileSegError::invalid_config(
                "crop_size",
                crop_size,
                "must be positive",
            ));
        }
        if !overlap_ratio.is_finite() || overlap_ratio < 0.0 {
            return Err(TileSegError::invalid_config(
                "overlap_ratio",
                overlap_ratio,
                "must be a finite value >= 0",
            ));
        }

        let overlap_size = (crop_size as f64 * overlap_ratio).floor() as usize;
        if overlap_size >= crop_size {
            return Err(TileSegError::invalid_config(
                "overlap_ratio",
                overlap_ratio,
                format!("step size would be non-positive for crop_size {crop_size}"),
            ));
        }

        Ok(Self {
            crop_size,
            overlap_size,
        })
    }

    /// Non-overlapping slicer, used to cut fixed-size dataset crops.
    pub fn non_overlapping(crop_size: usize) -> Result<Self> {
        Self::new(crop_size, 0.0)
    }

    pub const fn crop_size(&self) -> usize {
        self.crop_size
    }

    pub const fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    pub const fn step_size(&self) -> usize {
        self.crop_size - self.overlap_size
    }

    pub fn plan(&self, image_height: usize, image_width: usize) -> TilePlan {
        let step_size = self.step_size();
        let intervals = (0..image_height)
            .step_by(step_size)
            .flat_map(|i| {
                (0..image_width)
                    .step_by(step_size)
                    .map(move |j| TileInterval::new(i, j, self.crop_size))
            })
            .collect();

        TilePlan {
            image_height,
            image_width,
            crop_size: self.crop_size,
            step_size,
            intervals,
        }
    }
}

/// One-shot form of [`TilePlanner::plan`].
pub fn plan(
    image_height: usize,
    image_width: usize,
    crop_size: usize,
    overlap_ratio: f64,
) -> Result<TilePlan> {
    Ok(TilePlanner::new(crop_size, overlap_ratio)?.plan(image_height, image_width))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(plan: &TilePlan) -> Vec<Vec<usize>> {
        let mut counts = vec![vec![0; plan.image_width]; plan.image_height];
        for tile in plan {
            for row in counts
                .iter_mut()
                .take(tile.rows.end.min(plan.image_height))
                .skip(tile.rows.start)
            {
                for count in row
                    .iter_mut()
                    .take(tile.cols.end.min(plan.image_width))
                    .skip(tile.cols.start)
                {
                    *count += 1;
                }
            }
        }
        counts
    }

    #[test]
    fn test_ten_by_ten_scenario() -> Result<()> {
        let plan = plan(10, 10, 6, 1.0 / 3.0)?;
        assert_eq!(plan.step_size, 4);
        assert_eq!(plan.len(), 9);

        let starts: Vec<_> = plan
            .iter()
            .map(|t| (t.rows.start, t.cols.start))
            .collect();
        assert_eq!(
            starts,
            vec![
                (0, 0),
                (0, 4),
                (0, 8),
                (4, 0),
                (4, 4),
                (4, 8),
                (8, 0),
                (8, 4),
                (8, 8)
            ]
        );

        let last = &plan.intervals()[8];
        assert_eq!(last.rows, 8..14);
        assert_eq!(last.cols, 8..14);
        assert_eq!(last.valid_height(10), 2);
        assert_eq!(last.valid_width(10), 2);
        assert!(last.overhangs(10, 10));
        assert!(!plan.intervals()[0].overhangs(10, 10));
        Ok(())
    }

    #[test]
    fn test_every_pixel_is_covered() -> Result<()> {
        for &(height, width) in &[(1, 1), (7, 13), (32, 32), (33, 65), (100, 3)] {
            for &crop in &[1, 4, 8, 16] {
                for &ratio in &[0.0, 0.1, 0.25, 0.5, 0.9] {
                    let plan = plan(height, width, crop, ratio)?;
                    let counts = coverage(&plan);
                    assert!(
                        counts.iter().flatten().all(|&c| c >= 1),
                        "gap for {height}x{width} crop {crop} ratio {ratio}"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_no_overlap_covers_each_pixel_once() -> Result<()> {
        let plan = plan(37, 50, 8, 0.0)?;
        assert!(coverage(&plan).iter().flatten().all(|&c| c == 1));
        Ok(())
    }

    #[test]
    fn test_tiles_never_start_outside_image() -> Result<()> {
        let plan = plan(9, 17, 4, 0.5)?;
        assert!(plan
            .iter()
            .all(|t| t.rows.start < 9 && t.cols.start < 17));
        Ok(())
    }

    #[test]
    fn test_more_overlap_never_fewer_tiles() -> Result<()> {
        let ratios = [0.0, 0.1, 0.2, 0.3, 0.5, 0.7, 0.9, 0.95];
        for &(height, width) in &[(50, 50), (224, 1000), (17, 3)] {
            let counts: Vec<_> = ratios
                .iter()
                .map(|&r| plan(height, width, 16, r).map(|p| p.len()))
                .collect::<Result<_>>()?;
            assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
        }
        Ok(())
    }

    #[test]
    fn test_plan_is_deterministic() -> Result<()> {
        assert_eq!(plan(123, 77, 32, 0.25)?, plan(123, 77, 32, 0.25)?);
        Ok(())
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            TilePlanner::new(0, 0.2),
            Err(TileSegError::InvalidConfiguration { ref field, .. }) if field == "crop_size"
        ));
        assert!(matches!(
            TilePlanner::new(16, 1.0),
            Err(TileSegError::InvalidConfiguration { ref field, .. }) if field == "overlap_ratio"
        ));
        assert!(TilePlanner::new(16, -0.1).is_err());
        assert!(TilePlanner::new(16, f64::NAN).is_err());
        // floor(4 * 0.99) = 3 still leaves a step of 1
        assert_eq!(TilePlanner::new(4, 0.99).map(|p| p.step_size()).ok(), Some(1));
    }

    #[test]
    fn test_empty_image_yields_empty_plan() -> Result<()> {
        assert!(plan(0, 10, 4, 0.0)?.is_empty());
        Ok(())
    }
}
