//! TorchScript-backed segmentation networks.
//!
//! The primary module is called as `forward(image[, xyz])` and the crop
//! refinement module as `forward(image[, xyz], labels)`. Both must return a
//! `[1, H, W]` tensor of instance ids.

use std::{convert::TryFrom, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use ndarray::Array4;
use tch::{CModule, Device, Kind, Tensor};
use tracing::info;

use crate::segmenter::{LabelMap, ModelInput, RefinementModel, SegmentationModel, Segmenter};

/// Primary TorchScript network.
pub struct TorchSegmenter {
    module: CModule,
    device: Device,
}

impl TorchSegmenter {
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let path = model_path.as_ref();
        let mut module = CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load segmentation network {}", path.display()))?;
        module.set_eval();
        Ok(Self { module, device })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl SegmentationModel for TorchSegmenter {
    fn segment(&mut self, input: &ModelInput) -> Result<LabelMap> {
        let mut inputs = vec![array_to_tensor(&input.color, self.device)?];
        if let Some(geometry) = &input.geometry {
            inputs.push(array_to_tensor(geometry, self.device)?);
        }
        let output = tch::no_grad(|| self.module.forward_ts(&inputs))?;
        tensor_to_labels(&output)
    }
}

/// Crop refinement TorchScript network.
pub struct TorchRefiner {
    module: CModule,
    device: Device,
}

impl TorchRefiner {
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let path = model_path.as_ref();
        let mut module = CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load refinement network {}", path.display()))?;
        module.set_eval();
        Ok(Self { module, device })
    }
}

impl RefinementModel for TorchRefiner {
    fn refine(&mut self, input: &ModelInput, initial: &LabelMap) -> Result<LabelMap> {
        let mut inputs = vec![array_to_tensor(&input.color, self.device)?];
        if let Some(geometry) = &input.geometry {
            inputs.push(array_to_tensor(geometry, self.device)?);
        }
        let (width, height) = initial.dimensions();
        let labels = Tensor::from_slice(initial.as_raw())
            .to_kind(Kind::Int64)
            .view([1, height as i64, width as i64])
            .to_device(self.device);
        inputs.push(labels);
        let output = tch::no_grad(|| self.module.forward_ts(&inputs))?;
        tensor_to_labels(&output)
    }
}

/// Load the primary network and, when given, the crop refinement network.
pub fn load_segmenter(
    primary: &Path,
    refinement: Option<&Path>,
    device: Device,
) -> Result<Segmenter> {
    let network = TorchSegmenter::load(primary, device)?;
    info!("segmentation network {} loaded on {:?}", primary.display(), device);
    match refinement {
        Some(path) => {
            let refiner = TorchRefiner::load(path, device)?;
            info!("refinement network {} loaded on {:?}", path.display(), device);
            Ok(Segmenter::with_refinement(network, refiner))
        }
        None => Ok(Segmenter::primary_only(network)),
    }
}

fn array_to_tensor(array: &Array4<f32>, device: Device) -> Result<Tensor> {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data = array
        .as_slice()
        .ok_or_else(|| anyhow!("model input must be contiguous"))?;
    Ok(Tensor::from_slice(data).view(shape.as_slice()).to_device(device))
}

fn tensor_to_labels(output: &Tensor) -> Result<LabelMap> {
    let shape = output.size();
    let (height, width) = match shape.as_slice() {
        [1, h, w] | [1, 1, h, w] => (*h, *w),
        [h, w] => (*h, *w),
        other => bail!("unexpected label tensor shape {other:?}"),
    };
    let flat = output
        .to_device(Device::Cpu)
        .reshape([height * width])
        .clamp(0i64, 255i64)
        .to_kind(Kind::Uint8)
        .contiguous();
    let data = Vec::<u8>::try_from(&flat)?;
    LabelMap::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| anyhow!("label tensor does not match {width}x{height}"))
}
