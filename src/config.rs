use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use image::ImageFormat;

use crate::backend::BackendOptions;
use crate::errors::{Result, TileSegError};

/// Engine parameters consumed by [`crate::TiledPredictor`].
///
/// All values are supplied externally and validated at construction; nothing
/// is re-checked mid-inference.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    pub num_classes: usize,
    /// Maximum number of tiles handed to the backend per forward pass.
    pub sub_batch_size: usize,
    pub crop_size: usize,
    /// Fraction of `crop_size` shared between neighbouring tiles, in `[0, 1)`.
    pub overlap_ratio: f64,
    /// Run the native backend in half precision.
    pub half: bool,
}

impl PredictorConfig {
    pub const fn new(num_classes: usize, crop_size: usize) -> Self {
        Self {
            num_classes,
            sub_batch_size: 8,
            crop_size,
            overlap_ratio: 0.2,
            half: false,
        }
    }

    pub const fn with_sub_batch_size(mut self, sub_batch_size: usize) -> Self {
        self.sub_batch_size = sub_batch_size;
        self
    }

    pub const fn with_overlap_ratio(mut self, overlap_ratio: f64) -> Self {
        self.overlap_ratio = overlap_ratio;
        self
    }

    pub const fn with_half(mut self, half: bool) -> Self {
        self.half = half;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(TileSegError::invalid_config(
                "num_classes",
                self.num_classes,
                "must be positive",
            ));
        }
        if self.sub_batch_size == 0 {
            return Err(TileSegError::invalid_config(
                "sub_batch_size",
                self.sub_batch_size,
                "must be positive",
            ));
        }
        crate::tiling::TilePlanner::new(self.crop_size, self.overlap_ratio)?;
        Ok(())
    }
}

/// How class indices are written to the output mask image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MaskEncoding {
    /// Raw class index per pixel.
    Index,
    /// `class * 255 / num_classes`, for eyeballing results.
    Scaled,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image file or directory of images.
    pub source: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Local path or http(s) URL of a `.onnx` graph or TorchScript module.
    #[arg(short, long)]
    pub model: String,

    #[arg(short = 'c', long)]
    pub num_classes: usize,

    #[arg(short, long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 224)]
    pub crop_size: usize,

    #[arg(long, default_value_t = 0.2, value_parser = check_ratio)]
    pub overlap_ratio: f64,

    #[arg(long, default_value_t = false)]
    pub half: bool,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(long, value_enum, default_value_t = MaskEncoding::Index)]
    pub mask_encoding: MaskEncoding,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Images segmented in parallel.
    #[arg(
        short, long, default_value_t = thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    )]
    pub num_threads: usize,

    /// ONNX Runtime intra-op threads per forward pass.
    #[arg(long, default_value_t = 1)]
    pub intra_threads: usize,
}

impl Config {
    pub fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig::new(self.num_classes, self.crop_size)
            .with_sub_batch_size(self.batch_size)
            .with_overlap_ratio(self.overlap_ratio)
            .with_half(self.half)
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            half: self.half,
            device_id: self.device_id,
            num_threads: self.intra_threads,
            ..BackendOptions::default()
        }
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }
    if matches!(format, ImageFormat::Jpeg) {
        return Err(format!("{} is lossy and would corrupt class indices", s));
    }

    Ok(s.to_string())
}

fn check_ratio(s: &str) -> std::result::Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|e| format!("{s}: {e}"))?;
    if !(0.0..1.0).contains(&ratio) {
        return Err(format!("{ratio} is outside [0, 1)"));
    }
    Ok(ratio)
}
