//! Deterministic in-process backends for tests and examples.

use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{Result, TileSegError};
use crate::traits::SegmentationBackend;

/// Writes the same score map into every tile.
#[derive(Debug, Clone)]
pub struct ConstantBackend {
    /// `(num_classes, h, w)`
    pub scores: Array3<f32>,
}

impl ConstantBackend {
    pub const fn new(scores: Array3<f32>) -> Self {
        Self { scores }
    }

    /// Every pixel votes `1.0` for `class` and `0.0` for the rest.
    pub fn one_hot(class: usize, num_classes: usize, crop_size: usize) -> Self {
        let mut scores = Array3::<f32>::zeros((num_classes, crop_size, crop_size));
        scores.index_axis_mut(Axis(0), class).fill(1.0);
        Self::new(scores)
    }
}

impl SegmentationBackend for ConstantBackend {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn forward(&self, _chunk: ArrayView4<f32>, mut output: ArrayViewMut4<f32>) -> Result<()> {
        for mut tile in output.outer_iter_mut() {
            tile.assign(&self.scores);
        }
        Ok(())
    }
}

/// Echoes the input channels as class scores (needs `num_classes == 3`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityBackend;

impl SegmentationBackend for IdentityBackend {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn forward(&self, chunk: ArrayView4<f32>, mut output: ArrayViewMut4<f32>) -> Result<()> {
        if chunk.shape() != output.shape() {
            return Err(TileSegError::inference(
                "identity backend needs as many classes as channels",
                0,
                ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape),
            ));
        }
        output.assign(&chunk);
        Ok(())
    }
}

/// Two classes: `1` where the normalised red channel exceeds `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdBackend {
    pub threshold: f32,
}

impl SegmentationBackend for ThresholdBackend {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn forward(&self, chunk: ArrayView4<f32>, mut output: ArrayViewMut4<f32>) -> Result<()> {
        for (tile, mut scores) in chunk.outer_iter().zip(output.outer_iter_mut()) {
            let red = tile.index_axis(Axis(0), 0);
            let foreground = red.mapv(|v| if v > self.threshold { 1.0 } else { 0.0 });
            scores
                .index_axis_mut(Axis(0), 0)
                .assign(&foreground.mapv(|v| 1.0 - v));
            scores.index_axis_mut(Axis(0), 1).assign(&foreground);
        }
        Ok(())
    }
}

/// Records chunk sizes and fills each tile's scores with its global index.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    chunks: Mutex<Vec<usize>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks.lock().clone()
    }
}

impl SegmentationBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn forward(&self, chunk: ArrayView4<f32>, mut output: ArrayViewMut4<f32>) -> Result<()> {
        let mut chunks = self.chunks.lock();
        let offset: usize = chunks.iter().sum();
        for (i, mut tile) in output.outer_iter_mut().enumerate() {
            tile.fill((offset + i) as f32);
        }
        chunks.push(chunk.len_of(Axis(0)));
        Ok(())
    }
}

/// Succeeds for `healthy_chunks` calls, then fails every call.
#[derive(Debug)]
pub struct FailingBackend {
    healthy_chunks: usize,
    calls: Mutex<usize>,
}

impl FailingBackend {
    pub const fn after(healthy_chunks: usize) -> Self {
        Self {
            healthy_chunks,
            calls: Mutex::new(0),
        }
    }
}

impl SegmentationBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn forward(&self, _chunk: ArrayView4<f32>, _output: ArrayViewMut4<f32>) -> Result<()> {
        let mut calls = self.calls.lock();
        *calls += 1;
        if *calls > self.healthy_chunks {
            return Err(TileSegError::inference(
                "simulated device failure",
                0,
                std::io::Error::other("device lost"),
            ));
        }
        Ok(())
    }
}
