use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sophia_optim::{GroupConfig, GroupOverrides, SophiaVariant, DEFAULT_BATCH_SIZE};
use sophia_utils::dejsonify;
use std::fs;

/// Settings of one synthetic training run. Every field has a default, so
/// `{}` is a valid settings string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainSettings {
    pub variant: SophiaVariant,
    /// Applied on top of the variant's defaults.
    pub optimizer: GroupOverrides,
    pub num_samples: usize,
    pub num_features: usize,
    pub num_outputs: usize,
    pub noise_std: f64,
    pub num_steps: usize,
    pub hessian_interval: usize,
    pub batch_size: f64,
    pub report_interval: usize,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            variant: SophiaVariant::Base,
            optimizer: GroupOverrides::default(),
            num_samples: 256,
            num_features: 8,
            num_outputs: 1,
            noise_std: 0.1,
            num_steps: 500,
            hessian_interval: 10,
            batch_size: DEFAULT_BATCH_SIZE,
            report_interval: 50,
        }
    }
}

impl TrainSettings {
    pub fn group_config(&self) -> GroupConfig {
        self.optimizer
            .resolve(&GroupConfig::defaults_for(self.variant))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 || self.num_features == 0 || self.num_outputs == 0 {
            return Err(anyhow!(
                "Problem dimensions must be positive, got {} samples, {} features, {} outputs",
                self.num_samples,
                self.num_features,
                self.num_outputs
            ));
        }
        if self.hessian_interval == 0 {
            return Err(anyhow!("hessian_interval must be at least 1"));
        }
        if !(self.noise_std >= 0.0) {
            return Err(anyhow!("Invalid noise_std: {}", self.noise_std));
        }
        if !(self.batch_size > 0.0) {
            return Err(anyhow!("Invalid batch_size: {}", self.batch_size));
        }
        self.group_config().validate()?;
        Ok(())
    }
}

/// Accepts a JSON string or a path ending in `.json`.
pub fn load_settings(settings: &str) -> Result<TrainSettings> {
    let settings = if settings.ends_with(".json") {
        fs::read_to_string(settings)
            .map_err(|e| anyhow!("Failed to read settings file {}: {}", settings, e))?
    } else {
        settings.to_string()
    };

    let settings = dejsonify::<TrainSettings>(&settings)
        .map_err(|e| anyhow!("Failed to parse settings: {}", e))?;
    settings.validate()?;
    Ok(settings)
}
