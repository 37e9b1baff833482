use crate::{
    error::{Result, SophiaError},
    variant::SophiaVariant,
};
use serde::{Deserialize, Serialize};

/// Hyper-parameters shared by a group of parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct GroupConfig {
    pub lr: f64,
    pub betas: (f64, f64),
    pub rho: f64,
    pub weight_decay: f64,
    pub maximize: bool,
    pub capturable: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::defaults_for(SophiaVariant::Base)
    }
}

impl GroupConfig {
    pub fn defaults_for(variant: SophiaVariant) -> Self {
        Self {
            lr: 1e-4,
            betas: variant.default_betas(),
            rho: 0.04,
            weight_decay: 1e-1,
            maximize: false,
            capturable: false,
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_maximize(mut self, maximize: bool) -> Self {
        self.maximize = maximize;
        self
    }

    pub fn with_capturable(mut self, capturable: bool) -> Self {
        self.capturable = capturable;
        self
    }

    /// Negated comparisons so NaN is rejected too.
    pub fn validate(&self) -> Result<()> {
        let (beta1, beta2) = self.betas;
        if !(0.0 <= self.lr) {
            return Err(SophiaError::InvalidConfig(format!(
                "Invalid learning rate: {}",
                self.lr
            )));
        }
        if !(0.0 <= beta1 && beta1 < 1.0) {
            return Err(SophiaError::InvalidConfig(format!(
                "Invalid beta parameter at index 0: {}",
                beta1
            )));
        }
        if !(0.0 <= beta2 && beta2 < 1.0) {
            return Err(SophiaError::InvalidConfig(format!(
                "Invalid beta parameter at index 1: {}",
                beta2
            )));
        }
        if !(0.0 <= self.rho) {
            return Err(SophiaError::InvalidConfig(format!(
                "Invalid rho parameter: {}",
                self.rho
            )));
        }
        if !(0.0 <= self.weight_decay) {
            return Err(SophiaError::InvalidConfig(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Per-group overrides; unset fields fall back to the optimizer defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct GroupOverrides {
    pub lr: Option<f64>,
    pub betas: Option<(f64, f64)>,
    pub rho: Option<f64>,
    pub weight_decay: Option<f64>,
    pub maximize: Option<bool>,
    pub capturable: Option<bool>,
}

impl GroupOverrides {
    pub fn resolve(&self, defaults: &GroupConfig) -> GroupConfig {
        GroupConfig {
            lr: self.lr.unwrap_or(defaults.lr),
            betas: self.betas.unwrap_or(defaults.betas),
            rho: self.rho.unwrap_or(defaults.rho),
            weight_decay: self.weight_decay.unwrap_or(defaults.weight_decay),
            maximize: self.maximize.unwrap_or(defaults.maximize),
            capturable: self.capturable.unwrap_or(defaults.capturable),
        }
    }
}
