use std::path::Path;

use ndarray::prelude::*;
use parking_lot::Mutex;
use tch::{CModule, Device, Kind, Tensor};
use tracing::{debug, info};

use crate::errors::{Result, TileSegError};
use crate::traits::{write_output, SegmentationBackend};

/// TorchScript module held in evaluation mode.
pub struct TorchBackend {
    module: Mutex<CModule>,
    device: Device,
    kind: Kind,
}

impl TorchBackend {
    pub fn load(model_path: &Path, half: bool, device_id: i32) -> Result<Self> {
        let device = if tch::Cuda::is_available() {
            Device::Cuda(device_id.max(0) as usize)
        } else {
            Device::Cpu
        };

        let mut module = CModule::load_on_device(model_path, device)
            .map_err(|e| TileSegError::model_load(model_path.display(), "TorchScript load", e))?;
        module.set_eval();

        let kind = if half { Kind::Half } else { Kind::Float };
        if half {
            module.to(device, kind, false);
        }

        info!(path = %model_path.display(), ?device, ?kind, "loaded TorchScript module");

        Ok(Self {
            module: Mutex::new(module),
            device,
            kind,
        })
    }
}

impl SegmentationBackend for TorchBackend {
    fn name(&self) -> &'static str {
        "torch"
    }

    fn forward(&self, chunk: ArrayView4<f32>, output: ArrayViewMut4<f32>) -> Result<()> {
        let standard = chunk.as_standard_layout();
        let data = standard.as_slice().ok_or_else(|| {
            TileSegError::inference("input layout", 0, "tile batch is not contiguous in memory")
        })?;
        let dims: Vec<i64> = chunk.shape().iter().map(|&d| d as i64).collect();
        debug!(tiles = dims[0], kind = ?self.kind, "torch forward");

        let module = self.module.lock();
        let scores = tch::no_grad(|| {
            let input = Tensor::from_slice(data)
                .reshape(&dims)
                .to_device(self.device)
                .to_kind(self.kind);
            module.forward_ts(&[input])
        })
        .map_err(|e| TileSegError::inference("torch forward pass", 0, e))?;
        drop(module);

        let scores = scores
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .contiguous();
        let shape: Vec<usize> = scores.size().iter().map(|&d| d as usize).collect();
        let values = Vec::<f32>::try_from(scores.flatten(0, -1))
            .map_err(|e| TileSegError::inference("output extraction", 0, e))?;
        let raw = ArrayD::from_shape_vec(IxDyn(&shape), values)?;

        write_output(raw.view(), output)
    }
}
