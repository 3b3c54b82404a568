pub mod backend;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod extract;
pub mod predictor;
pub mod reconstruct;
pub mod source;
pub mod tiling;
pub mod traits;

pub mod mocks;

use image::ImageFormat;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use backend::{Backend, BackendOptions, ModelFormat, ModelSource};
pub use config::{Config, MaskEncoding, PredictorConfig};
pub use dataset::{ClassEncoding, CropDataset, ImageCache, LabeledImage};
pub use errors::{Result, TileSegError};
pub use extract::{Normalization, TileExtractor};
pub use predictor::TiledPredictor;
pub use reconstruct::MaskReconstructor;
pub use source::PredictionSource;
pub use tiling::{TileInterval, TilePlan, TilePlanner};
pub use traits::*;

/// Writes one mask per image of a [`PredictionSource`], mirroring the
/// source's directory layout under `output_dir`.
pub struct SegmentationRunner<B: SegmentationBackend> {
    predictor: TiledPredictor<B>,
    output_dir: PathBuf,
    format: ImageFormat,
    encoding: MaskEncoding,
    show_progress: bool,
}

impl<B: SegmentationBackend> SegmentationRunner<B> {
    pub fn new(predictor: TiledPredictor<B>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            predictor,
            output_dir: output_dir.into(),
            format: ImageFormat::Png,
            encoding: MaskEncoding::Index,
            show_progress: true,
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_encoding(mut self, encoding: MaskEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub const fn predictor(&self) -> &TiledPredictor<B> {
        &self.predictor
    }

    /// Segments every image in `source`; returns the written mask paths in
    /// source order. The first failure aborts the run.
    pub fn process_source(&self, source: &PredictionSource) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir).map_err(|e| TileSegError::FileSystem {
            path: self.output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let progress_bar = if self.show_progress {
            ProgressBar::new(source.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        progress_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let written = source
            .paths()
            .par_iter()
            .progress_with(progress_bar.clone())
            .map(|input_file| {
                let relative = source.relative_path(input_file)?;
                self.process_single_image(input_file, relative)
            })
            .collect::<Result<Vec<_>>>()?;

        progress_bar.finish();
        info!(
            images = written.len(),
            output_dir = %self.output_dir.display(),
            "segmentation finished"
        );
        Ok(written)
    }

    /// Segments `input_file` and writes its mask at `relative` under the output directory.
    pub fn process_single_image(&self, input_file: &Path, relative: &Path) -> Result<PathBuf> {
        let pixels = source::load_image(input_file)?;
        let mask = self.predictor.predict(pixels.view())?;
        let mask_image =
            source::mask_to_image(mask.view(), self.predictor.config().num_classes, self.encoding)?;

        let output_file = self.output_path(relative);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| TileSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        mask_image
            .save_with_format(&output_file, self.format)
            .map_err(|e| TileSegError::ImageProcessing {
                path: output_file.display().to_string(),
                operation: "mask saving".to_string(),
                source: Box::new(e),
            })?;

        debug!(input = %input_file.display(), output = %output_file.display(), "mask written");
        Ok(output_file)
    }

    pub fn output_path(&self, relative: &Path) -> PathBuf {
        let extension = self.format.extensions_str().first().copied().unwrap_or("png");
        self.output_dir.join(relative).with_extension(extension)
    }
}
