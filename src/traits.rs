use ndarray::prelude::*;

use crate::errors::{Result, TileSegError};

/// Batched forward pass over normalised NCHW tiles.
///
/// Implementors only provide [`forward`](Self::forward) for one chunk; the
/// chunking over a full tile batch is shared by every backend through
/// [`run`](Self::run).
pub trait SegmentationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one chunk and writes `(chunk_len, num_classes, h, w)` scores into `output`.
    fn forward(&self, chunk: ArrayView4<f32>, output: ArrayViewMut4<f32>) -> Result<()>;

    /// Runs the full batch in chunks of at most `sub_batch_size` tiles.
    ///
    /// The output buffer is allocated once; each chunk's scores land at the
    /// chunk's offset. Any chunk failure fails the whole call.
    fn run(
        &self,
        batch: ArrayView4<f32>,
        sub_batch_size: usize,
        num_classes: usize,
    ) -> Result<Array4<f32>> {
        if sub_batch_size == 0 {
            return Err(TileSegError::invalid_config(
                "sub_batch_size",
                sub_batch_size,
                "must be positive",
            ));
        }

        let (tiles, _, height, width) = batch.dim();
        let mut output = Array4::<f32>::zeros((tiles, num_classes, height, width));

        for start in (0..tiles).step_by(sub_batch_size) {
            let end = (start + sub_batch_size).min(tiles);
            let chunk = batch.slice(s![start..end, .., .., ..]);
            let target = output.slice_mut(s![start..end, .., .., ..]);
            self.forward(chunk, target).map_err(|e| match e {
                TileSegError::InferenceExecution {
                    operation, source, ..
                } => TileSegError::InferenceExecution {
                    operation,
                    batch_offset: start,
                    source,
                },
                other => other,
            })?;
        }

        Ok(output)
    }
}

/// Copies a backend's raw output into the caller's slot, checking the shape first.
pub(crate) fn write_output<D: Dimension>(
    raw: ArrayView<f32, D>,
    mut output: ArrayViewMut4<f32>,
) -> Result<()> {
    if raw.shape() != output.shape() {
        return Err(TileSegError::inference(
            format!(
                "model produced shape {:?}, expected {:?}",
                raw.shape(),
                output.shape()
            ),
            0,
            ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape),
        ));
    }
    let raw = raw.into_dimensionality::<Ix4>()?;
    output.assign(&raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FailingBackend, RecordingBackend};

    #[test]
    fn test_run_chunks_respect_sub_batch_size() -> Result<()> {
        let backend = RecordingBackend::new();
        let batch = Array4::<f32>::zeros((7, 3, 4, 4));
        let output = backend.run(batch.view(), 3, 2)?;

        assert_eq!(output.shape(), &[7, 2, 4, 4]);
        assert_eq!(backend.chunk_sizes(), vec![3, 3, 1]);
        // RecordingBackend writes the global tile index into every score
        for t in 0..7 {
            assert!(output
                .index_axis(Axis(0), t)
                .iter()
                .all(|&v| v == t as f32));
        }
        Ok(())
    }

    #[test]
    fn test_run_reports_failing_chunk_offset() {
        let backend = FailingBackend::after(2);
        let batch = Array4::<f32>::zeros((6, 3, 2, 2));
        match backend.run(batch.view(), 2, 1) {
            Err(TileSegError::InferenceExecution { batch_offset, .. }) => {
                assert_eq!(batch_offset, 4)
            }
            other => panic!("expected inference error, got {other:?}"),
        }
    }

    #[test]
    fn test_run_rejects_zero_sub_batch() {
        let backend = RecordingBackend::new();
        let batch = Array4::<f32>::zeros((1, 3, 2, 2));
        assert!(backend.run(batch.view(), 0, 1).is_err());
    }

    #[test]
    fn test_write_output_shape_check() {
        let raw = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 3, 3]));
        let mut out = Array4::<f32>::zeros((1, 3, 3, 3));
        assert!(write_output(raw.view(), out.view_mut()).is_err());

        let mut out = Array4::<f32>::zeros((1, 2, 3, 3));
        assert!(write_output(raw.view(), out.view_mut()).is_ok());
    }
}
