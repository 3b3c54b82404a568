use std::path::Path;

use half::f16;
use ndarray::prelude::*;
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
    tensor::{PrimitiveTensorElementType, TensorElementType},
    value::{TensorRef, ValueType},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, TileSegError};
use crate::traits::{write_output, SegmentationBackend};

/// Numeric types the graph backend knows how to feed and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphDType {
    F32,
    F16,
    F64,
}

impl GraphDType {
    /// Maps a declared element type; anything unrecognised degrades to `F32`.
    pub fn resolve(declared: Option<TensorElementType>, what: &str) -> Self {
        match declared {
            Some(TensorElementType::Float32) => Self::F32,
            Some(TensorElementType::Float16) => Self::F16,
            Some(TensorElementType::Float64) => Self::F64,
            other => {
                warn!(
                    declared = ?other,
                    "ONNX {what} element type not understood, defaulting to float32"
                );
                Self::F32
            }
        }
    }
}

fn declared_type(value_type: &ValueType) -> Option<TensorElementType> {
    match value_type {
        ValueType::Tensor { ty, .. } => Some(*ty),
        _ => None,
    }
}

fn load_error<'a, E: std::fmt::Display>(
    path: &'a Path,
    operation: &'static str,
) -> impl FnOnce(E) -> TileSegError + 'a {
    move |e| TileSegError::model_load(path.display(), operation, e.to_string())
}

/// ONNX Runtime session over a serialized graph.
///
/// `Session::run` needs exclusive access, so concurrent `predict` calls on one
/// backend serialize on the session lock.
pub struct OnnxBackend {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    input_dtype: GraphDType,
    output_dtype: GraphDType,
}

impl OnnxBackend {
    pub fn load(model_path: &Path, device_id: i32, num_threads: usize) -> Result<Self> {
        let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
        if !cuda.is_available().unwrap_or(false) {
            warn!("CUDAExecutionProvider not available, inference will run on CPU");
            if std::env::var_os("LD_LIBRARY_PATH").is_none() {
                warn!("LD_LIBRARY_PATH is not set, CUDA libraries may not be found");
            }
        }

        let session = SessionBuilder::new()
            .map_err(load_error(model_path, "session builder initialisation"))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                cuda.build(),
            ])
            .map_err(load_error(model_path, "execution provider registration"))?
            .with_memory_pattern(true)
            .map_err(load_error(model_path, "memory pattern setup"))?
            .with_intra_threads(num_threads.max(1))
            .map_err(load_error(model_path, "thread pool setup"))?
            .commit_from_file(model_path)
            .map_err(load_error(model_path, "graph loading"))?;

        let (input_name, input_dtype) = match session.inputs.first() {
            Some(input) => (
                input.name.clone(),
                GraphDType::resolve(declared_type(&input.input_type), "input"),
            ),
            None => {
                return Err(TileSegError::model_load(
                    model_path.display(),
                    "graph signature inspection",
                    "graph declares no inputs",
                ))
            }
        };
        let (output_name, output_dtype) = match session.outputs.first() {
            Some(output) => (
                output.name.clone(),
                GraphDType::resolve(declared_type(&output.output_type), "output"),
            ),
            None => {
                return Err(TileSegError::model_load(
                    model_path.display(),
                    "graph signature inspection",
                    "graph declares no outputs",
                ))
            }
        };

        info!(
            path = %model_path.display(),
            %input_name,
            ?input_dtype,
            %output_name,
            ?output_dtype,
            "loaded ONNX graph"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            input_dtype,
            output_dtype,
        })
    }

    pub const fn input_dtype(&self) -> GraphDType {
        self.input_dtype
    }

    fn run_typed<T>(
        &self,
        dims: Vec<i64>,
        data: &[T],
        output: ArrayViewMut4<f32>,
    ) -> Result<()>
    where
        T: PrimitiveTensorElementType + std::fmt::Debug + Clone + 'static,
    {
        let input = TensorRef::from_array_view((dims, data))
            .map_err(|e| TileSegError::inference("input tensor creation", 0, e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| TileSegError::inference("ONNX Runtime forward pass", 0, e))?;
        let value = &outputs[self.output_name.as_str()];

        let extract_error = |e: ort::Error| TileSegError::inference("output extraction", 0, e);
        match self.output_dtype {
            GraphDType::F32 => write_output(
                value.try_extract_array::<f32>().map_err(extract_error)?,
                output,
            )?,
            GraphDType::F16 => write_output(
                value
                    .try_extract_array::<f16>()
                    .map_err(extract_error)?
                    .mapv(f32::from)
                    .view(),
                output,
            )?,
            GraphDType::F64 => write_output(
                value
                    .try_extract_array::<f64>()
                    .map_err(extract_error)?
                    .mapv(|v| v as f32)
                    .view(),
                output,
            )?,
        };
        Ok(())
    }
}

impl SegmentationBackend for OnnxBackend {
    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn forward(&self, chunk: ArrayView4<f32>, output: ArrayViewMut4<f32>) -> Result<()> {
        let dims: Vec<i64> = chunk.shape().iter().map(|&d| d as i64).collect();
        debug!(tiles = dims[0], dtype = ?self.input_dtype, "ONNX forward");

        match self.input_dtype {
            GraphDType::F32 => {
                let standard = chunk.as_standard_layout();
                let data = standard.as_slice().ok_or_else(|| {
                    TileSegError::inference(
                        "input layout",
                        0,
                        "tile batch is not contiguous in memory",
                    )
                })?;
                self.run_typed(dims, data, output)
            }
            GraphDType::F16 => {
                let data: Vec<f16> = chunk.iter().map(|&v| f16::from_f32(v)).collect();
                self.run_typed(dims, &data, output)
            }
            GraphDType::F64 => {
                let data: Vec<f64> = chunk.iter().map(|&v| v as f64).collect();
                self.run_typed(dims, &data, output)
            }
        }
    }
}
