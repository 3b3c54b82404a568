use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the tiled segmentation engine.
///
/// Every variant carries the values needed to reproduce the failure (offending
/// dimensions, configured values, artifact locations) so callers never have to
/// parse error strings.
#[derive(Error, Debug)]
pub enum TileSegError {
    #[error("Invalid configuration: {field} = {value} ({reason})")]
    InvalidConfiguration {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unsupported model format: {source_desc} ({reason})")]
    UnsupportedModelFormat { source_desc: String, reason: String },

    #[error("Model load error: {operation} failed for {source_desc}")]
    ModelLoad {
        source_desc: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Inference error: {operation} failed at tile offset {batch_offset}")]
    InferenceExecution {
        operation: String,
        batch_offset: usize,
        #[source]
        source: BoxError,
    },

    #[error("Invalid image: {reason} (shape {shape:?})")]
    InvalidImage { reason: String, shape: Vec<usize> },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Dataset error: {reason}")]
    Dataset { reason: String },
}

pub type Result<T> = std::result::Result<T, TileSegError>;

impl TileSegError {
    pub(crate) fn invalid_config(
        field: &str,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfiguration {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn inference(
        operation: impl Into<String>,
        batch_offset: usize,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::InferenceExecution {
            operation: operation.into(),
            batch_offset,
            source: source.into(),
        }
    }

    pub(crate) fn model_load(
        source_desc: impl std::fmt::Display,
        operation: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::ModelLoad {
            source_desc: source_desc.to_string(),
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Fallback for I/O errors raised without path context. Code that knows the
/// path builds `TileSegError::FileSystem` directly.
impl From<std::io::Error> for TileSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for TileSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for TileSegError {
    fn from(err: ort::Error) -> Self {
        Self::inference("ort operation", 0, err)
    }
}

/// Shape errors only arise while moving tensors in and out of a backend, so
/// they are reported as inference failures.
impl From<ndarray::ShapeError> for TileSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", 0, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration_message_carries_values() {
        let err = TileSegError::invalid_config("overlap_ratio", 1.5, "must be in [0, 1)");
        let message = err.to_string();
        assert!(message.contains("overlap_ratio"));
        assert!(message.contains("1.5"));
        assert!(message.contains("[0, 1)"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match TileSegError::from(io) {
            TileSegError::FileSystem { path, .. } => assert_eq!(path, PathBuf::from("unknown")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_binary_boundary_keeps_variant() {
        let err = TileSegError::inference("forward pass", 3, "device lost");
        let reported = anyhow::Error::from(err).context("Failed to segment image");
        match reported.downcast_ref::<TileSegError>() {
            Some(TileSegError::InferenceExecution { batch_offset, .. }) => {
                assert_eq!(*batch_offset, 3)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TileSegError>();
    }
}
