use crate::{
    config::{GroupConfig, GroupOverrides},
    error::{Result, SophiaError},
    kernel::{check_placement, hessian_ema, sophia_update},
    state::{dense_grad, ParamState, StateLayout, StateManager},
    tensor::{ParamId, Parameter, Tensor},
    variant::{SophiaVariant, VariantProfile},
};
use log::trace;
use std::collections::HashSet;

/// Batch size used in the ratio denominator when the caller has no better value.
pub const DEFAULT_BATCH_SIZE: f64 = 5120.0;

/// Recomputes the loss (and, as a side effect, the gradients) before a step.
/// The caller enables gradient computation inside it.
pub type LossClosure<'a> = &'a mut dyn FnMut(&mut [Parameter]) -> anyhow::Result<f32>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub config: GroupConfig,
}

/// Construction-time description of a group.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupSpec {
    pub params: Vec<ParamId>,
    pub overrides: GroupOverrides,
}

impl GroupSpec {
    pub fn new<I>(params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ParamId>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            overrides: GroupOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: GroupOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Sophia optimizer over caller-owned parameters.
///
/// Parameters are addressed by their index in the slice handed to
/// [`Sophia::update_hessian`] and [`Sophia::step`]; the same slice layout
/// must be used on every call. One instance must not be driven from several
/// threads at once.
#[derive(Debug, Clone)]
pub struct Sophia {
    pub(crate) variant: SophiaVariant,
    pub(crate) defaults: GroupConfig,
    pub(crate) groups: Vec<ParamGroup>,
    pub(crate) state: StateManager,
}

impl Sophia {
    /// Single group holding `params`, configured by `defaults`.
    pub fn new<I>(variant: SophiaVariant, params: I, defaults: GroupConfig) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<ParamId>,
    {
        Self::with_groups(variant, vec![GroupSpec::new(params)], defaults)
    }

    pub fn with_groups(
        variant: SophiaVariant,
        groups: Vec<GroupSpec>,
        defaults: GroupConfig,
    ) -> Result<Self> {
        defaults.validate()?;
        let mut optimizer = Self {
            variant,
            defaults,
            groups: Vec::with_capacity(groups.len()),
            state: StateManager::new(),
        };
        for group in groups {
            optimizer.add_param_group(group)?;
        }
        if optimizer.groups.iter().all(|g| g.params.is_empty()) {
            return Err(SophiaError::InvalidConfig(
                "optimizer got an empty parameter list".to_string(),
            ));
        }
        Ok(optimizer)
    }

    pub fn add_param_group(&mut self, group: GroupSpec) -> Result<()> {
        let config = group.overrides.resolve(&self.defaults);
        config.validate()?;

        let mut seen: HashSet<ParamId> = self
            .groups
            .iter()
            .flat_map(|g| g.params.iter().copied())
            .collect();
        for id in &group.params {
            if !seen.insert(*id) {
                return Err(SophiaError::InvalidConfig(format!(
                    "parameter {} appears in more than one parameter group",
                    id.index()
                )));
            }
        }

        self.groups.push(ParamGroup {
            params: group.params,
            config,
        });
        Ok(())
    }

    pub fn variant(&self) -> SophiaVariant {
        self.variant
    }

    pub fn defaults(&self) -> &GroupConfig {
        &self.defaults
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn state_of(&self, id: impl Into<ParamId>) -> Option<&ParamState> {
        self.state.get(id.into())
    }

    /// Mutates the config of `group`. The change is kept only if the result
    /// still validates.
    pub fn reconfigure<F>(&mut self, group: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut GroupConfig),
    {
        let target = self.groups.get_mut(group).ok_or_else(|| {
            SophiaError::InvalidConfig(format!("no parameter group at index {}", group))
        })?;
        let mut config = target.config;
        f(&mut config);
        config.validate()?;
        target.config = config;
        Ok(())
    }

    /// Sets the learning rate of every group.
    pub fn set_lr(&mut self, lr: f64) -> Result<()> {
        for group in 0..self.groups.len() {
            self.reconfigure(group, |cfg| cfg.lr = lr)?;
        }
        Ok(())
    }

    /// Folds the squared gradient of every tracked parameter into its
    /// hessian estimate. Parameters without a gradient are skipped.
    pub fn update_hessian(&mut self, params: &[Parameter]) -> Result<()> {
        let profile = self.variant.profile();
        for group in &self.groups {
            let layout = state_layout(&profile, &group.config);
            let (_, beta2) = group.config.betas;
            for &id in &group.params {
                let param = lookup(params, id)?;
                let Some(grad) = &param.grad else {
                    continue;
                };
                let grad = dense_grad(id, grad, &param.data)?;
                let state = self.state.ensure_state(id, param, layout)?;
                let hessian = state
                    .hessian
                    .get_or_insert_with(|| Tensor::zeros_like(&param.data));
                hessian_ema(hessian, grad, beta2);
            }
        }
        trace!("{} hessian update done", self.variant);
        Ok(())
    }

    /// Runs `closure` (if any), then applies one update to every tracked
    /// parameter that has a gradient. Returns the closure's loss.
    ///
    /// Parameters are updated one at a time; if one fails, those before it
    /// keep their update and it is left untouched, including its state.
    pub fn step(
        &mut self,
        params: &mut [Parameter],
        closure: Option<LossClosure<'_>>,
        bs: f64,
    ) -> Result<Option<f32>> {
        let loss = match closure {
            Some(f) => Some(f(params)?),
            None => None,
        };

        let profile = self.variant.profile();
        let available = params.len();
        for group in &self.groups {
            let layout = state_layout(&profile, &group.config);
            for &id in &group.params {
                let param = params
                    .get_mut(id.index())
                    .ok_or(SophiaError::UnknownParameter {
                        param: id.index(),
                        available,
                    })?;
                let Some(grad) = &param.grad else {
                    continue;
                };
                if group.config.capturable {
                    check_placement(id, &param.data, dense_grad(id, grad, &param.data)?)?;
                }
                let state = self.state.ensure_state(id, param, layout)?;
                let Parameter { data, grad } = param;
                let Some(grad) = grad.as_ref() else {
                    continue;
                };
                let grad = dense_grad(id, grad, data)?;
                sophia_update(id, data, grad, state, &group.config, &profile, bs)?;
            }
        }
        trace!("{} step done over {} groups", self.variant, self.groups.len());
        Ok(loss)
    }

    /// Clears the gradient of every tracked parameter.
    pub fn zero_grad(&self, params: &mut [Parameter]) {
        for id in self.groups.iter().flat_map(|g| g.params.iter()) {
            if let Some(param) = params.get_mut(id.index()) {
                param.grad = None;
            }
        }
    }
}

fn state_layout(profile: &VariantProfile, config: &GroupConfig) -> StateLayout {
    StateLayout {
        step_on_device: profile.tracks_rms || config.capturable,
        tracks_rms: profile.tracks_rms,
    }
}

fn lookup(params: &[Parameter], id: ParamId) -> Result<&Parameter> {
    params.get(id.index()).ok_or(SophiaError::UnknownParameter {
        param: id.index(),
        available: params.len(),
    })
}
