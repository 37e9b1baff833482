//! Serializable optimizer state.
//!
//! Parameters are keyed by their packed position across groups (first
//! parameter of the first group is 0, and so on), so a dict saved from one
//! optimizer can be loaded into another built over an equivalent layout.

use crate::{
    config::GroupConfig,
    error::{Result, SophiaError},
    optimizer::{ParamGroup, Sophia},
    state::{ParamState, StateManager, StepCounter},
    tensor::{DType, Device, ParamId, Tensor},
};
use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use sophia_utils::{compress_obj, decompress_obj, dejsonify, is_compressed, jsonify};
use std::collections::{BTreeMap, HashMap};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorRecord {
    /// Shape of the real view.
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    #[serde(default)]
    pub dtype: DType,
    #[serde(default)]
    pub device: Device,
}

impl From<&Tensor> for TensorRecord {
    fn from(t: &Tensor) -> Self {
        Self {
            shape: t.real_shape().to_vec(),
            data: t.to_vec(),
            dtype: t.dtype(),
            device: t.device(),
        }
    }
}

impl TensorRecord {
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::from_real_view(&self.shape, self.data.clone(), self.dtype)
            .map(|t| t.on(self.device))
            .map_err(|e| {
                SophiaError::StateDict(format!(
                    "tensor of shape {:?} with {} values: {}",
                    self.shape,
                    self.data.len(),
                    e
                ))
            })
    }
}

/// A step counter as persisted. Older dicts store a bare number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StepRecord {
    Tensor(TensorRecord),
    Legacy(f64),
}

impl From<&StepCounter> for StepRecord {
    fn from(step: &StepCounter) -> Self {
        match step {
            StepCounter::Scalar(v) => StepRecord::Tensor(TensorRecord {
                shape: vec![],
                data: vec![*v],
                dtype: DType::Real,
                device: Device::Host,
            }),
            StepCounter::Tensor { value, device } => StepRecord::Tensor(TensorRecord {
                shape: vec![value.len()],
                data: value.to_vec(),
                dtype: DType::Real,
                device: *device,
            }),
        }
    }
}

impl StepRecord {
    /// Legacy numbers become a host zero-dimensional counter.
    pub fn to_counter(&self) -> Result<StepCounter> {
        match self {
            StepRecord::Legacy(v) => Ok(StepCounter::Scalar(*v as f32)),
            StepRecord::Tensor(t) => match (t.shape.as_slice(), t.data.as_slice()) {
                ([], [v]) => Ok(StepCounter::Scalar(*v)),
                ([1], [v]) => Ok(StepCounter::Tensor {
                    value: Array1::from_elem(1, *v),
                    device: t.device,
                }),
                _ => Err(SophiaError::StateDict(format!(
                    "step counter must hold one value, got shape {:?}",
                    t.shape
                ))),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParamStateRecord {
    pub step: StepRecord,
    pub exp_avg: TensorRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hessian: Option<TensorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms: Option<f32>,
}

impl From<&ParamState> for ParamStateRecord {
    fn from(state: &ParamState) -> Self {
        Self {
            step: (&state.step).into(),
            exp_avg: (&state.momentum).into(),
            hessian: state.hessian.as_ref().map(Into::into),
            rms: state.rms,
        }
    }
}

impl ParamStateRecord {
    pub fn to_state(&self) -> Result<ParamState> {
        let momentum = self.exp_avg.to_tensor()?;
        let hessian = match &self.hessian {
            Some(record) => {
                let hessian = record.to_tensor()?;
                if !hessian.same_layout(&momentum) {
                    return Err(SophiaError::StateDict(format!(
                        "hessian shape {:?} differs from exp_avg shape {:?}",
                        hessian.real_shape(),
                        momentum.real_shape()
                    )));
                }
                Some(hessian)
            }
            None => None,
        };
        Ok(ParamState {
            step: self.step.to_counter()?,
            momentum,
            hessian,
            rms: self.rms,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub params: Vec<usize>,
    pub lr: f64,
    pub betas: (f64, f64),
    pub rho: f64,
    pub weight_decay: f64,
    #[serde(default)]
    pub maximize: bool,
    #[serde(default)]
    pub capturable: bool,
}

impl GroupRecord {
    fn config(&self) -> GroupConfig {
        GroupConfig {
            lr: self.lr,
            betas: self.betas,
            rho: self.rho,
            weight_decay: self.weight_decay,
            maximize: self.maximize,
            capturable: self.capturable,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StateDict {
    #[serde(default)]
    pub state: BTreeMap<usize, ParamStateRecord>,
    pub param_groups: Vec<GroupRecord>,
}

impl StateDict {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(jsonify(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(dejsonify(json)?)
    }

    /// Canonical JSON, zlib-compressed when `compress` is set.
    pub fn to_bytes(&self, compress: bool) -> anyhow::Result<Vec<u8>> {
        if compress {
            compress_obj(self)
        } else {
            Ok(self.to_json()?.into_bytes())
        }
    }

    /// Accepts either form written by [`StateDict::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if is_compressed(bytes) {
            decompress_obj(bytes)
        } else {
            Self::from_json(std::str::from_utf8(bytes)?)
        }
    }
}

impl Sophia {
    pub fn state_dict(&self) -> StateDict {
        let mut packed = 0usize;
        let mut state = BTreeMap::new();
        let mut param_groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let mut params = Vec::with_capacity(group.params.len());
            for id in &group.params {
                if let Some(s) = self.state.get(*id) {
                    state.insert(packed, s.into());
                }
                params.push(packed);
                packed += 1;
            }
            let cfg = &group.config;
            param_groups.push(GroupRecord {
                params,
                lr: cfg.lr,
                betas: cfg.betas,
                rho: cfg.rho,
                weight_decay: cfg.weight_decay,
                maximize: cfg.maximize,
                capturable: cfg.capturable,
            });
        }
        StateDict {
            state,
            param_groups,
        }
    }

    /// Replaces group configs and per-parameter state with `dict`.
    ///
    /// Nothing changes unless the whole dict loads: group count and sizes must
    /// match and every record must decode.
    pub fn load_state_dict(&mut self, dict: StateDict) -> Result<()> {
        if dict.param_groups.len() != self.groups.len() {
            return Err(SophiaError::StateDict(format!(
                "loaded state dict has {} parameter groups, optimizer has {}",
                dict.param_groups.len(),
                self.groups.len()
            )));
        }

        let mut id_map: HashMap<usize, ParamId> = HashMap::new();
        let mut groups = Vec::with_capacity(self.groups.len());
        for (saved, current) in dict.param_groups.iter().zip(&self.groups) {
            if saved.params.len() != current.params.len() {
                return Err(SophiaError::StateDict(format!(
                    "loaded parameter group has {} parameters, optimizer group has {}",
                    saved.params.len(),
                    current.params.len()
                )));
            }
            let config = saved.config();
            config.validate()?;
            id_map.extend(saved.params.iter().copied().zip(current.params.iter().copied()));
            groups.push(ParamGroup {
                params: current.params.clone(),
                config,
            });
        }

        let mut state = StateManager::new();
        for (packed, record) in &dict.state {
            let id = id_map.get(packed).ok_or_else(|| {
                SophiaError::StateDict(format!("state for unknown parameter {}", packed))
            })?;
            let restored = record.to_state()?;
            if restored.hessian.is_none() {
                debug!(
                    "state for parameter {} has no hessian, it will start from zero",
                    id.index()
                );
            }
            state.insert(*id, restored);
        }

        self.groups = groups;
        self.state = state;
        Ok(())
    }
}
