use crate::{
    error::{Result, SophiaError},
    tensor::{Device, Gradient, ParamId, Parameter, Tensor},
};
use log::debug;
use ndarray::Array1;
use std::collections::BTreeMap;

/// Number of optimizer steps taken for one parameter.
///
/// `Scalar` is a lightweight host value. `Tensor` is a one-element buffer
/// placed on a device, which is what capturable mode and the RMS-tracking
/// variants keep so the counter never has to leave the device.
#[derive(Debug, Clone, PartialEq)]
pub enum StepCounter {
    Scalar(f32),
    Tensor { value: Array1<f32>, device: Device },
}

impl StepCounter {
    pub fn host() -> Self {
        StepCounter::Scalar(0.0)
    }

    pub fn on_device(device: Device) -> Self {
        StepCounter::Tensor {
            value: Array1::zeros(1),
            device,
        }
    }

    pub fn increment(&mut self) {
        match self {
            StepCounter::Scalar(step) => *step += 1.0,
            StepCounter::Tensor { value, .. } => value.mapv_inplace(|v| v + 1.0),
        }
    }

    /// Reads the counter back to the host. For a device counter this is the
    /// synchronization point.
    pub fn value(&self) -> f32 {
        match self {
            StepCounter::Scalar(step) => *step,
            StepCounter::Tensor { value, .. } => value.first().copied().unwrap_or(0.0),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            StepCounter::Scalar(_) => Device::Host,
            StepCounter::Tensor { device, .. } => *device,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, StepCounter::Tensor { .. })
    }
}

/// Per-parameter optimizer state. Buffers are shape-identical to the
/// parameter and start at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamState {
    pub step: StepCounter,
    pub momentum: Tensor,
    /// `None` only after restoring a record that lacked it; backfilled to
    /// zero on the next touch.
    pub hessian: Option<Tensor>,
    /// Floored parameter RMS of the last step, for variants that track it.
    pub rms: Option<f32>,
}

impl ParamState {
    pub fn zeros(param: &Tensor, layout: StateLayout) -> Self {
        Self {
            step: if layout.step_on_device {
                StepCounter::on_device(param.device())
            } else {
                StepCounter::host()
            },
            momentum: Tensor::zeros_like(param),
            hessian: Some(Tensor::zeros_like(param)),
            rms: layout.tracks_rms.then_some(0.0),
        }
    }
}

/// How fresh state is laid out for a given variant and group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub step_on_device: bool,
    pub tracks_rms: bool,
}

/// Owns every parameter's state, addressed by [`ParamId`].
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    states: BTreeMap<ParamId, ParamState>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `id`, creating zeroed buffers on first touch.
    ///
    /// Rejects sparse or mis-shaped gradients before anything is allocated or
    /// mutated. A missing hessian buffer is backfilled to zero.
    pub fn ensure_state(
        &mut self,
        id: ParamId,
        param: &Parameter,
        layout: StateLayout,
    ) -> Result<&mut ParamState> {
        if let Some(grad) = &param.grad {
            dense_grad(id, grad, &param.data)?;
        }

        let state = self.states.entry(id).or_insert_with(|| {
            debug!(
                "initializing state for parameter {} with shape {:?}",
                id.index(),
                param.data.shape()
            );
            ParamState::zeros(&param.data, layout)
        });

        if !state.momentum.same_layout(&param.data) {
            return Err(SophiaError::ShapeMismatch {
                param: id.index(),
                expected: param.data.real_shape().to_vec(),
                actual: state.momentum.real_shape().to_vec(),
            });
        }
        match &state.hessian {
            None => {
                debug!("backfilling missing hessian for parameter {}", id.index());
                state.hessian = Some(Tensor::zeros_like(&param.data));
            }
            Some(hessian) if !hessian.same_layout(&param.data) => {
                return Err(SophiaError::ShapeMismatch {
                    param: id.index(),
                    expected: param.data.real_shape().to_vec(),
                    actual: hessian.real_shape().to_vec(),
                });
            }
            Some(_) => {}
        }
        if layout.tracks_rms && state.rms.is_none() {
            state.rms = Some(0.0);
        }
        Ok(state)
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamState> {
        self.states.get(&id)
    }

    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut ParamState> {
        self.states.get_mut(&id)
    }

    pub fn insert(&mut self, id: ParamId, state: ParamState) {
        self.states.insert(id, state);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &ParamState)> {
        self.states.iter().map(|(id, s)| (*id, s))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// The dense gradient of `param`, or the reason it cannot be used.
pub fn dense_grad<'a>(id: ParamId, grad: &'a Gradient, param: &Tensor) -> Result<&'a Tensor> {
    let grad = grad.dense().ok_or_else(|| SophiaError::InvalidGradient {
        param: id.index(),
        reason: "Sophia does not support sparse gradients".to_string(),
    })?;
    if !grad.same_layout(param) {
        return Err(SophiaError::ShapeMismatch {
            param: id.index(),
            expected: param.real_shape().to_vec(),
            actual: grad.real_shape().to_vec(),
        });
    }
    Ok(grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: StateLayout = StateLayout {
        step_on_device: false,
        tracks_rms: false,
    };

    fn param(values: Vec<f32>) -> Parameter {
        let n = values.len();
        let grad = Tensor::from_vec(&[n], vec![0.5; n]).unwrap();
        Parameter::new(Tensor::from_vec(&[n], values).unwrap()).with_grad(grad)
    }

    #[test]
    fn test_ensure_state_allocates_zeros_once() {
        let mut manager = StateManager::new();
        let p = param(vec![1.0, 2.0, 3.0]);

        let state = manager.ensure_state(ParamId(0), &p, HOST).unwrap();
        assert_eq!(state.step, StepCounter::Scalar(0.0));
        assert_eq!(state.momentum.shape(), &[3]);
        assert!(state.momentum.to_vec().iter().all(|v| *v == 0.0));
        assert!(state.rms.is_none());

        state.step.increment();
        let again = manager.ensure_state(ParamId(0), &p, HOST).unwrap();
        assert_eq!(again.step.value(), 1.0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ensure_state_backfills_hessian() {
        let mut manager = StateManager::new();
        let p = param(vec![1.0, 2.0]);
        manager.ensure_state(ParamId(3), &p, HOST).unwrap().hessian = None;

        let state = manager.ensure_state(ParamId(3), &p, HOST).unwrap();
        assert_eq!(state.hessian.as_ref().unwrap().to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_ensure_state_rejects_sparse_without_allocating() {
        let mut manager = StateManager::new();
        let mut p = param(vec![1.0]);
        p.grad = Some(Gradient::Sparse {
            shape: vec![1],
            indices: vec![vec![0]],
            values: vec![1.0],
        });
        assert!(matches!(
            manager.ensure_state(ParamId(0), &p, HOST),
            Err(SophiaError::InvalidGradient { param: 0, .. })
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_device_step_layout() {
        let mut manager = StateManager::new();
        let mut p = param(vec![1.0]);
        p.data = p.data.clone().on(Device::Accelerator(0));
        let layout = StateLayout {
            step_on_device: true,
            tracks_rms: true,
        };
        let state = manager.ensure_state(ParamId(0), &p, layout).unwrap();
        assert!(state.step.is_tensor());
        assert_eq!(state.step.device(), Device::Accelerator(0));
        assert_eq!(state.rms, Some(0.0));
    }
}
