//! Model artifact resolution and the interchangeable inference backends.

pub mod onnx;
#[cfg(feature = "torch")]
pub mod torch;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use tracing::{info, warn};

use crate::errors::{Result, TileSegError};
use crate::traits::SegmentationBackend;

pub use onnx::{GraphDType, OnnxBackend};
#[cfg(feature = "torch")]
pub use torch::TorchBackend;

/// Where a model artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Remote(String),
}

impl ModelSource {
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            Self::Remote(source.to_string())
        } else {
            Self::Local(PathBuf::from(source))
        }
    }

    /// Local path of the artifact, downloading remote sources into `download_dir` first.
    pub fn fetch(&self, download_dir: &Path) -> Result<PathBuf> {
        match self {
            Self::Local(path) => Ok(path.clone()),
            Self::Remote(url) => download(url, download_dir),
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// Artifact kinds, told apart by file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// Portable inference graph (`.onnx`).
    Onnx,
    /// Serialized TorchScript module (`.pt`, `.ts`, `.ckpt`).
    TorchScript,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("onnx") => Ok(Self::Onnx),
            Some("pt" | "ts" | "ckpt") => Ok(Self::TorchScript),
            _ => Err(TileSegError::UnsupportedModelFormat {
                source_desc: path.display().to_string(),
                reason: "expected a .onnx graph or a .pt/.ts/.ckpt TorchScript module".to_string(),
            }),
        }
    }
}

/// Streams `url` into `dir/<last path segment>`. Not retried.
pub fn download(url: &str, dir: &Path) -> Result<PathBuf> {
    let file_name = reqwest::Url::parse(url)
        .map_err(|e| TileSegError::model_load(url, "URL parsing", e))?
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            TileSegError::model_load(url, "URL parsing", "URL path has no file name")
        })?;
    let path = dir.join(file_name);

    info!(%url, path = %path.display(), "downloading model");
    let mut response = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .map_err(|e| TileSegError::model_load(url, "download", e))?;

    let file = File::create(&path).map_err(|e| TileSegError::FileSystem {
        path: path.clone(),
        operation: "model download target creation".to_string(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    let streamed = response
        .copy_to(&mut writer)
        .map_err(|e| TileSegError::model_load(url, "download stream", e))
        .and_then(|bytes| {
            writer.flush().map_err(|e| TileSegError::FileSystem {
                path: path.clone(),
                operation: "model download flush".to_string(),
                source: e,
            })?;
            Ok(bytes)
        });
    drop(writer);

    match streamed {
        Ok(bytes) => {
            info!(bytes, path = %path.display(), "model downloaded");
            Ok(path)
        }
        Err(e) => {
            // never leave a truncated artifact behind
            if let Err(remove_error) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %remove_error, "failed to remove partial download");
            }
            Err(e)
        }
    }
}

/// Load-time options shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Half precision; only honoured by the TorchScript backend; graphs
    /// declare their own input type.
    pub half: bool,
    pub device_id: i32,
    pub num_threads: usize,
    pub download_dir: PathBuf,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            half: false,
            device_id: 0,
            num_threads: 1,
            download_dir: std::env::temp_dir(),
        }
    }
}

/// The backend picked for a model artifact.
pub enum Backend {
    Onnx(OnnxBackend),
    #[cfg(feature = "torch")]
    Torch(TorchBackend),
}

impl Backend {
    /// Resolves `source` (path or URL), then dispatches on its suffix.
    pub fn load(source: &str, options: &BackendOptions) -> Result<Self> {
        let source = ModelSource::parse(source);
        let path = source.fetch(&options.download_dir)?;
        let format = ModelFormat::from_path(&path)?;

        if !path.is_file() {
            return Err(TileSegError::model_load(
                path.display(),
                "artifact lookup",
                std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
            ));
        }

        match format {
            ModelFormat::Onnx => {
                if options.half {
                    info!("half precision is taken from the ONNX graph signature, flag ignored");
                }
                Ok(Self::Onnx(OnnxBackend::load(
                    &path,
                    options.device_id,
                    options.num_threads,
                )?))
            }
            #[cfg(feature = "torch")]
            ModelFormat::TorchScript => Ok(Self::Torch(TorchBackend::load(
                &path,
                options.half,
                options.device_id,
            )?)),
            #[cfg(not(feature = "torch"))]
            ModelFormat::TorchScript => Err(TileSegError::UnsupportedModelFormat {
                source_desc: path.display().to_string(),
                reason: "TorchScript support requires the `torch` feature".to_string(),
            }),
        }
    }
}

impl SegmentationBackend for Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Onnx(backend) => backend.name(),
            #[cfg(feature = "torch")]
            Self::Torch(backend) => backend.name(),
        }
    }

    fn forward(&self, chunk: ArrayView4<f32>, output: ArrayViewMut4<f32>) -> Result<()> {
        match self {
            Self::Onnx(backend) => backend.forward(chunk, output),
            #[cfg(feature = "torch")]
            Self::Torch(backend) => backend.forward(chunk, output),
        }
    }
}
