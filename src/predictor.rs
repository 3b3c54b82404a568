use ndarray::prelude::*;
use tracing::debug;

use crate::backend::{Backend, BackendOptions};
use crate::config::PredictorConfig;
use crate::errors::Result;
use crate::extract::{validate_image, Normalization, TileExtractor};
use crate::reconstruct::{argmax_last_axis, MaskReconstructor};
use crate::tiling::TilePlanner;
use crate::traits::SegmentationBackend;

/// Segments images of any size with a model that only sees square crops.
///
/// Holds no per-image state: every tensor lives for one `predict` call and
/// the backend is the only shared resource.
pub struct TiledPredictor<B: SegmentationBackend> {
    backend: B,
    config: PredictorConfig,
    planner: TilePlanner,
    extractor: TileExtractor,
    reconstructor: MaskReconstructor,
}

impl<B: SegmentationBackend> TiledPredictor<B> {
    pub fn new(backend: B, config: PredictorConfig) -> Result<Self> {
        Self::with_normalization(backend, config, Normalization::IMAGENET)
    }

    pub fn with_normalization(
        backend: B,
        config: PredictorConfig,
        normalization: Normalization,
    ) -> Result<Self> {
        config.validate()?;
        let planner = TilePlanner::new(config.crop_size, config.overlap_ratio)?;

        Ok(Self {
            backend,
            planner,
            extractor: TileExtractor::new(normalization),
            reconstructor: MaskReconstructor::new(config.num_classes),
            config,
        })
    }

    pub const fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn planner(&self) -> &TilePlanner {
        &self.planner
    }

    /// Summed per-class scores, `(height, width, num_classes)`.
    ///
    /// Pixels under more tiles accumulate larger values; these are not
    /// probabilities.
    pub fn predict_scores(&self, image: ArrayView3<u8>) -> Result<Array3<f32>> {
        validate_image(&image)?;
        let (height, width, _) = image.dim();

        let plan = self.planner.plan(height, width);
        debug!(
            height,
            width,
            tiles = plan.len(),
            step = plan.step_size,
            backend = self.backend.name(),
            "predicting"
        );

        let batch = self.extractor.extract(image, &plan)?;
        let probs = self.backend.run(
            batch.view(),
            self.config.sub_batch_size,
            self.config.num_classes,
        )?;
        self.reconstructor.accumulate(probs.view(), &plan)
    }

    /// Class index per pixel, `(height, width)`.
    pub fn predict(&self, image: ArrayView3<u8>) -> Result<Array2<usize>> {
        let scores = self.predict_scores(image)?;
        Ok(argmax_last_axis(scores.view()))
    }
}

impl TiledPredictor<Backend> {
    /// Loads the model behind `source` (path or URL) and wraps it.
    pub fn from_source(
        source: &str,
        config: PredictorConfig,
        options: &BackendOptions,
    ) -> Result<Self> {
        config.validate()?;
        let options = BackendOptions {
            half: config.half,
            ..options.clone()
        };
        let backend = Backend::load(source, &options)?;
        Self::new(backend, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TileSegError;
    use crate::mocks::{ConstantBackend, FailingBackend, IdentityBackend, RecordingBackend};

    #[test]
    fn test_predict_shape_and_constant_class() -> Result<()> {
        let config = PredictorConfig::new(4, 6)
            .with_overlap_ratio(1.0 / 3.0)
            .with_sub_batch_size(4);
        let predictor = TiledPredictor::new(ConstantBackend::one_hot(3, 4, 6), config)?;

        let image = Array3::<u8>::from_elem((10, 10, 3), 17);
        let mask = predictor.predict(image.view())?;
        assert_eq!(mask.dim(), (10, 10));
        assert!(mask.iter().all(|&c| c == 3));
        Ok(())
    }

    #[test]
    fn test_sub_batches_cover_all_tiles() -> Result<()> {
        let config = PredictorConfig::new(1, 6)
            .with_overlap_ratio(1.0 / 3.0)
            .with_sub_batch_size(4);
        let predictor = TiledPredictor::new(RecordingBackend::new(), config)?;
        predictor.predict(Array3::<u8>::zeros((10, 10, 3)).view())?;
        assert_eq!(predictor.backend().chunk_sizes(), vec![4, 4, 1]);
        Ok(())
    }

    #[test]
    fn test_identity_round_trip_without_overlap() -> Result<()> {
        let config = PredictorConfig::new(3, 4).with_overlap_ratio(0.0);
        let predictor =
            TiledPredictor::with_normalization(IdentityBackend, config, Normalization::IDENTITY)?;
        let image = Array3::from_shape_fn((9, 7, 3), |(y, x, c)| (y * 20 + x * 3 + c) as u8);

        let scores = predictor.predict_scores(image.view())?;
        for ((y, x, c), &v) in scores.indexed_iter() {
            assert_eq!((v * 255.0).round() as u8, image[[y, x, c]]);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = PredictorConfig::new(2, 8).with_overlap_ratio(1.0);
        assert!(matches!(
            TiledPredictor::new(IdentityBackend, config),
            Err(TileSegError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_backend_failure_propagates() -> Result<()> {
        let config = PredictorConfig::new(2, 4).with_sub_batch_size(1);
        let predictor = TiledPredictor::new(FailingBackend::after(1), config)?;
        let result = predictor.predict(Array3::<u8>::zeros((8, 8, 3)).view());
        assert!(matches!(
            result,
            Err(TileSegError::InferenceExecution { batch_offset: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_image_rejected() -> Result<()> {
        let predictor = TiledPredictor::new(IdentityBackend, PredictorConfig::new(3, 4))?;
        assert!(matches!(
            predictor.predict(Array3::<u8>::zeros((8, 8, 1)).view()),
            Err(TileSegError::InvalidImage { .. })
        ));
        assert!(matches!(
            predictor.predict(Array3::<u8>::zeros((0, 8, 3)).view()),
            Err(TileSegError::InvalidImage { .. })
        ));
        Ok(())
    }
}
