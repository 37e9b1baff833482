use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sophia_optim::{Parameter, SophiaVariant, StateDict, TensorRecord};
use sophia_utils::{compress_obj, decompress_obj, dejsonify, is_compressed, jsonify};
use std::{fs, path::Path};

/// Model parameters plus optimizer state, enough to resume a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub variant: SophiaVariant,
    pub step: usize,
    pub params: Vec<TensorRecord>,
    pub optimizer: StateDict,
}

impl Checkpoint {
    pub fn new(variant: SophiaVariant, step: usize, params: &[Parameter], optimizer: StateDict) -> Self {
        Self {
            variant,
            step,
            params: params.iter().map(|p| TensorRecord::from(&p.data)).collect(),
            optimizer,
        }
    }

    pub fn restore_params(&self) -> Result<Vec<Parameter>> {
        let mut params = Vec::with_capacity(self.params.len());
        for record in &self.params {
            params.push(Parameter::new(record.to_tensor()?));
        }
        Ok(params)
    }

    pub fn save(&self, path: &Path, compress: bool) -> Result<()> {
        let bytes = if compress {
            compress_obj(self)?
        } else {
            jsonify(self)?.into_bytes()
        };
        fs::write(path, bytes)
            .map_err(|e| anyhow!("Failed to write checkpoint {}: {}", path.display(), e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_obj(&read(path)?)
    }
}

/// What `inspect` accepts: a full checkpoint or a bare optimizer state dict.
pub enum Snapshot {
    Checkpoint(Checkpoint),
    StateDict(StateDict),
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = read(path)?;
        match load_obj::<Checkpoint>(&bytes) {
            Ok(checkpoint) => Ok(Snapshot::Checkpoint(checkpoint)),
            Err(_) => Ok(Snapshot::StateDict(StateDict::from_bytes(&bytes)?)),
        }
    }

    pub fn state_dict(&self) -> &StateDict {
        match self {
            Snapshot::Checkpoint(c) => &c.optimizer,
            Snapshot::StateDict(d) => d,
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))
}

fn load_obj<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if is_compressed(bytes) {
        decompress_obj(bytes)
    } else {
        Ok(dejsonify(std::str::from_utf8(bytes)?)?)
    }
}
