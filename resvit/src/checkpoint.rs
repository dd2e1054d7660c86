//! Named parameter checkpoints.
//!
//! A checkpoint holds a `state_dict`: a map from dotted parameter names
//! (`encoder.stem.conv.weight`) to flat tensors. Modules expose their
//! parameters under those names through [`NamedParams`], which is driven by a
//! [`ParamMapper`]; the same walk serves both exporting a state dict and
//! overlaying one onto a freshly built model.
//!
//! Checkpoints written by this crate are JSON. PyTorch training checkpoints
//! (`.pth`, `.pt`, `.ckpt`) are read through `burn-import`, taking the tensors
//! under their `state_dict` key.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm, LayerNorm, Linear},
    prelude::*,
    record::{FullPrecisionSettings, PrecisionSettings, Record, Recorder},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};

use crate::error::{ResVitError, ResVitResult};

/// A flat tensor with its shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl StoredTensor {
    /// Reads a tensor back to host memory.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> ResVitResult<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| ResVitError::TensorOperationFailed {
                operation: format!("reading tensor data: {err:?}"),
            })?;
        Ok(Self { shape, values })
    }

    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(
            TensorData::new(self.values.clone(), self.shape.clone()),
            device,
        )
    }

    fn is_consistent(&self) -> bool {
        self.shape.iter().product::<usize>() == self.values.len()
    }
}

/// Parameter name to tensor, ordered by name.
pub type StateDict = BTreeMap<String, StoredTensor>;

/// How two-dimensional linear weights are laid out in a state dict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[d_input, d_output]`, as Burn stores them.
    #[default]
    Burn,
    /// `[d_output, d_input]`, as PyTorch stores them.
    PyTorch,
}

/// File formats a checkpoint can be read from, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    PyTorch,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("pth" | "pt" | "ckpt") => Self::PyTorch,
            _ => Self::Json,
        }
    }
}

/// A named tensor set plus the layout its linear weights use.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    /// JSON checkpoints are always written in Burn layout.
    #[serde(skip)]
    pub layout: TensorLayout,
}

impl Checkpoint {
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict,
            layout: TensorLayout::Burn,
        }
    }

    /// Reads a checkpoint in whichever format its extension names.
    pub fn load<B: Backend>(path: impl AsRef<Path>, device: &B::Device) -> ResVitResult<Self> {
        let path = path.as_ref();
        match CheckpointFormat::from_path(path) {
            CheckpointFormat::Json => Self::load_json(path),
            CheckpointFormat::PyTorch => Self::load_pytorch::<B>(path, device),
        }
    }

    /// Reads and checks a JSON checkpoint. Every tensor must hold exactly as
    /// many values as its shape describes.
    pub fn load_json(path: impl AsRef<Path>) -> ResVitResult<Self> {
        let path = path.as_ref();
        let load_error = |reason: String| ResVitError::CheckpointIo {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|err| load_error(err.to_string()))?;
        let checkpoint: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| load_error(err.to_string()))?;

        if let Some((name, tensor)) = checkpoint
            .state_dict
            .iter()
            .find(|(_, tensor)| !tensor.is_consistent())
        {
            return Err(load_error(format!(
                "tensor `{name}` has {} values for shape {:?}",
                tensor.values.len(),
                tensor.shape
            )));
        }

        Ok(checkpoint)
    }

    /// Reads the `state_dict` entry of a PyTorch checkpoint.
    ///
    /// The head's `nn.Sequential` index (`out.0`) is renamed to `out.conv`;
    /// every other name is kept as written.
    pub fn load_pytorch<B: Backend>(
        path: impl AsRef<Path>,
        device: &B::Device,
    ) -> ResVitResult<Self> {
        let path = path.as_ref();
        let load_args = LoadArgs::new(path.to_path_buf())
            .with_top_level_key("state_dict")
            .with_key_remap("^out\\.0\\.", "out.conv.")
            // Flatten the names so no module nesting is implied.
            .with_key_remap("\\.", "/");

        let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();
        let tensors: PyTorchTensors =
            Recorder::<B>::load(&recorder, load_args, device).map_err(|err| {
                ResVitError::CheckpointIo {
                    path: path.to_path_buf(),
                    reason: format!("{err:?}"),
                }
            })?;

        Self::from_pytorch_tensors(path, tensors.0)
    }

    fn from_pytorch_tensors(
        path: &Path,
        tensors: HashMap<String, TensorData>,
    ) -> ResVitResult<Self> {
        let state_dict = tensors
            .into_iter()
            .map(|(name, data)| {
                let shape = data.shape.clone();
                let values = data.convert::<f32>().to_vec::<f32>().map_err(|err| {
                    ResVitError::CheckpointIo {
                        path: path.to_path_buf(),
                        reason: format!("tensor `{name}`: {err:?}"),
                    }
                })?;
                Ok((name.replace('/', "."), StoredTensor { shape, values }))
            })
            .collect::<ResVitResult<StateDict>>()?;

        Ok(Self {
            state_dict,
            layout: TensorLayout::PyTorch,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ResVitResult<()> {
        let path = path.as_ref();
        let save_error = |reason: String| ResVitError::CheckpointIo {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::create(path).map_err(|err| save_error(err.to_string()))?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|err| save_error(err.to_string()))
    }
}

/// One tensor as `burn-import` hands it over.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct PyTorchParam {
    #[serde(default)]
    id: String,
    param: TensorData,
}

/// Every tensor of a PyTorch state dict under its flattened name.
#[derive(Debug, Default)]
struct PyTorchTensors(HashMap<String, TensorData>);

impl<B: Backend> Record<B> for PyTorchTensors {
    type Item<S: PrecisionSettings> = HashMap<String, PyTorchParam>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        self.0
            .into_iter()
            .map(|(name, param)| {
                (
                    name,
                    PyTorchParam {
                        id: String::new(),
                        param,
                    },
                )
            })
            .collect()
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, _device: &B::Device) -> Self {
        Self(
            item.into_iter()
                .map(|(name, entry)| (name, entry.param))
                .collect(),
        )
    }
}

/// Joins a parent prefix and a child name with a dot.
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Visits every named tensor of a module, possibly replacing it.
pub trait ParamMapper {
    fn map_param<B: Backend, const D: usize>(
        &mut self,
        name: String,
        param: Param<Tensor<B, D>>,
    ) -> ResVitResult<Param<Tensor<B, D>>>;

    fn map_running<B: Backend, const D: usize>(
        &mut self,
        name: String,
        state: RunningState<Tensor<B, D>>,
    ) -> ResVitResult<RunningState<Tensor<B, D>>>;

    /// Linear weights, whose axis order differs between layouts.
    fn map_linear_weight<B: Backend>(
        &mut self,
        name: String,
        param: Param<Tensor<B, 2>>,
    ) -> ResVitResult<Param<Tensor<B, 2>>> {
        self.map_param(name, param)
    }
}

/// Modules whose tensors are addressable by dotted name.
pub trait NamedParams: Sized {
    fn map_named<M: ParamMapper>(self, prefix: &str, mapper: &mut M) -> ResVitResult<Self>;
}

impl<T: NamedParams> NamedParams for Vec<T> {
    fn map_named<M: ParamMapper>(self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.into_iter()
            .enumerate()
            .map(|(index, item)| item.map_named(&join_name(prefix, &index.to_string()), mapper))
            .collect()
    }
}

impl<T: NamedParams> NamedParams for Option<T> {
    fn map_named<M: ParamMapper>(self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.map(|item| item.map_named(prefix, mapper)).transpose()
    }
}

impl<B: Backend> NamedParams for Conv2d<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.weight = mapper.map_param(join_name(prefix, "weight"), self.weight)?;
        self.bias = self
            .bias
            .map(|bias| mapper.map_param(join_name(prefix, "bias"), bias))
            .transpose()?;
        Ok(self)
    }
}

impl<B: Backend> NamedParams for Linear<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.weight = mapper.map_linear_weight(join_name(prefix, "weight"), self.weight)?;
        self.bias = self
            .bias
            .map(|bias| mapper.map_param(join_name(prefix, "bias"), bias))
            .transpose()?;
        Ok(self)
    }
}

impl<B: Backend> NamedParams for LayerNorm<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.gamma = mapper.map_param(join_name(prefix, "weight"), self.gamma)?;
        self.beta = mapper.map_param(join_name(prefix, "bias"), self.beta)?;
        Ok(self)
    }
}

impl<B: Backend> NamedParams for BatchNorm<B, 2> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.gamma = mapper.map_param(join_name(prefix, "weight"), self.gamma)?;
        self.beta = mapper.map_param(join_name(prefix, "bias"), self.beta)?;
        self.running_mean =
            mapper.map_running(join_name(prefix, "running_mean"), self.running_mean)?;
        self.running_var = mapper.map_running(join_name(prefix, "running_var"), self.running_var)?;
        Ok(self)
    }
}

/// Copies every tensor into a [`StateDict`].
#[derive(Debug, Default)]
pub struct StateDictCollector {
    pub state_dict: StateDict,
}

impl ParamMapper for StateDictCollector {
    fn map_param<B: Backend, const D: usize>(
        &mut self,
        name: String,
        param: Param<Tensor<B, D>>,
    ) -> ResVitResult<Param<Tensor<B, D>>> {
        self.state_dict
            .insert(name, StoredTensor::from_tensor(param.val())?);
        Ok(param)
    }

    fn map_running<B: Backend, const D: usize>(
        &mut self,
        name: String,
        state: RunningState<Tensor<B, D>>,
    ) -> ResVitResult<RunningState<Tensor<B, D>>> {
        self.state_dict
            .insert(name, StoredTensor::from_tensor(state.value())?);
        Ok(state)
    }
}

/// Outcome of a non-strict overlay.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OverlayReport {
    /// Parameters overwritten from the checkpoint.
    pub applied: Vec<String>,
    /// Model parameters the checkpoint does not mention.
    pub missing: Vec<String>,
    /// Checkpoint entries that name no model parameter.
    pub unexpected: Vec<String>,
}

/// Overwrites parameters whose names appear in a state dict.
///
/// Names absent on either side are recorded and skipped. A name present on
/// both sides with different shapes is an error.
pub struct StateDictOverlay<'a> {
    state_dict: &'a StateDict,
    layout: TensorLayout,
    report: OverlayReport,
}

impl<'a> StateDictOverlay<'a> {
    pub fn new(state_dict: &'a StateDict) -> Self {
        Self {
            state_dict,
            layout: TensorLayout::Burn,
            report: OverlayReport::default(),
        }
    }

    /// Reads linear weights stored as `[d_output, d_input]` when `layout` is
    /// [`TensorLayout::PyTorch`].
    pub const fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Finishes the walk, listing the checkpoint entries nothing consumed.
    pub fn finish(mut self) -> OverlayReport {
        self.report.unexpected = self
            .state_dict
            .keys()
            .filter(|name| !self.report.applied.contains(name))
            .cloned()
            .collect();
        self.report
    }

    fn lookup(&mut self, name: &str, expected: &[usize]) -> ResVitResult<Option<&'a StoredTensor>> {
        let state_dict = self.state_dict;
        let Some(stored) = state_dict.get(name) else {
            self.report.missing.push(name.to_string());
            return Ok(None);
        };
        if stored.shape != expected {
            return Err(ResVitError::CheckpointShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                found: stored.shape.clone(),
            });
        }
        self.report.applied.push(name.to_string());
        Ok(Some(stored))
    }
}

/// Swaps `current` for `loaded`, keeping its gradient tracking.
fn replace_tensor<B: Backend, const D: usize>(
    current: &Tensor<B, D>,
    loaded: Tensor<B, D>,
) -> Tensor<B, D> {
    if current.is_require_grad() {
        loaded.require_grad()
    } else {
        loaded
    }
}

impl ParamMapper for StateDictOverlay<'_> {
    fn map_param<B: Backend, const D: usize>(
        &mut self,
        name: String,
        param: Param<Tensor<B, D>>,
    ) -> ResVitResult<Param<Tensor<B, D>>> {
        let expected = param.val().dims();
        let Some(stored) = self.lookup(&name, &expected)? else {
            return Ok(param);
        };

        Ok(param.map(|tensor| {
            let loaded = stored.to_tensor(&tensor.device());
            replace_tensor(&tensor, loaded)
        }))
    }

    fn map_running<B: Backend, const D: usize>(
        &mut self,
        name: String,
        state: RunningState<Tensor<B, D>>,
    ) -> ResVitResult<RunningState<Tensor<B, D>>> {
        let current = state.value();
        let Some(stored) = self.lookup(&name, &current.dims())? else {
            return Ok(state);
        };
        Ok(RunningState::new(stored.to_tensor(&current.device())))
    }

    fn map_linear_weight<B: Backend>(
        &mut self,
        name: String,
        param: Param<Tensor<B, 2>>,
    ) -> ResVitResult<Param<Tensor<B, 2>>> {
        if self.layout == TensorLayout::Burn {
            return self.map_param(name, param);
        }

        let [d_input, d_output] = param.val().dims();
        let Some(stored) = self.lookup(&name, &[d_output, d_input])? else {
            return Ok(param);
        };

        Ok(param.map(|tensor| {
            let loaded = stored.to_tensor::<B, 2>(&tensor.device()).transpose();
            replace_tensor(&tensor, loaded)
        }))
    }
}
