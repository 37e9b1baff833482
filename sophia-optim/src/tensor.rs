use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, ShapeError};
use serde::{Deserialize, Serialize};

/// Where a tensor logically lives. Arithmetic always runs on host memory;
/// the tag drives the placement rules of capturable mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Host,
    Accelerator(usize),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    Real,
    /// Stored as the real view: a trailing axis of length 2 holding (re, im).
    Complex,
}

/// Dense `f32` buffer with a dtype and a device tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
    dtype: DType,
    device: Device,
}

impl Tensor {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self {
            data,
            dtype: DType::Real,
            device: Device::Host,
        }
    }

    pub fn from_vec(shape: &[usize], values: Vec<f32>) -> Result<Self, ShapeError> {
        Ok(Self::new(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// Builds a complex tensor of logical `shape` from `(re, im)` pairs.
    pub fn from_complex(shape: &[usize], values: &[(f32, f32)]) -> Result<Self, ShapeError> {
        let mut real_shape = shape.to_vec();
        real_shape.push(2);
        let interleaved = values.iter().flat_map(|&(re, im)| [re, im]).collect();
        Self::from_real_view(&real_shape, interleaved, DType::Complex)
    }

    /// Rebuilds a tensor from its real-view shape and values.
    pub fn from_real_view(
        real_shape: &[usize],
        values: Vec<f32>,
        dtype: DType,
    ) -> Result<Self, ShapeError> {
        if dtype == DType::Complex && real_shape.last() != Some(&2) {
            return Err(ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape));
        }
        Ok(Self {
            data: ArrayD::from_shape_vec(IxDyn(real_shape), values)?,
            dtype,
            device: Device::Host,
        })
    }

    /// Zero-dimensional tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self {
            data: ArrayD::zeros(other.data.raw_dim()),
            dtype: other.dtype,
            device: other.device,
        }
    }

    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_complex(&self) -> bool {
        self.dtype == DType::Complex
    }

    /// Logical shape; complex tensors drop the trailing (re, im) axis.
    pub fn shape(&self) -> &[usize] {
        let shape = self.data.shape();
        match self.dtype {
            DType::Real => shape,
            DType::Complex => &shape[..shape.len() - 1],
        }
    }

    /// Shape of the real view, including the (re, im) axis for complex tensors.
    pub fn real_shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn real_view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn real_view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.data.view_mut()
    }

    /// Root mean square over the real view: `||t||_2 / sqrt(numel)`.
    /// Squares are summed in `f64` so large entries do not overflow.
    pub fn rms(&self) -> f32 {
        let n = self.data.len();
        if n == 0 {
            return 0.0;
        }
        let norm = self
            .data
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt();
        (norm / (n as f64).sqrt()) as f32
    }

    /// Real-view values in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Complex values as `(re, im)` pairs; `None` for real tensors.
    pub fn to_complex_vec(&self) -> Option<Vec<(f32, f32)>> {
        if !self.is_complex() {
            return None;
        }
        let values = self.to_vec();
        Some(values.chunks_exact(2).map(|c| (c[0], c[1])).collect())
    }

    pub(crate) fn same_layout(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype && self.data.shape() == other.data.shape()
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self::new(data)
    }
}

/// Gradient attached to a parameter. Only dense gradients can be consumed;
/// sparse ones exist so misuse is caught instead of silently densified.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(Tensor),
    Sparse {
        shape: Vec<usize>,
        indices: Vec<Vec<usize>>,
        values: Vec<f32>,
    },
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse { .. })
    }

    pub fn dense(&self) -> Option<&Tensor> {
        match self {
            Gradient::Dense(t) => Some(t),
            Gradient::Sparse { .. } => None,
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(t: Tensor) -> Self {
        Gradient::Dense(t)
    }
}

/// Caller-owned parameter. The optimizer mutates `data` in place and only
/// reads `grad`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub data: Tensor,
    pub grad: Option<Gradient>,
}

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Self { data, grad: None }
    }

    pub fn with_grad(mut self, grad: impl Into<Gradient>) -> Self {
        self.grad = Some(grad.into());
        self
    }

    pub fn set_grad(&mut self, grad: impl Into<Gradient>) {
        self.grad = Some(grad.into());
    }
}

/// Stable handle of a parameter: its index in the caller's parameter slice.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ParamId(pub usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for ParamId {
    fn from(index: usize) -> Self {
        ParamId(index)
    }
}
