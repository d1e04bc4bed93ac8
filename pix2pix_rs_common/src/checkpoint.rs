use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::progress::IterWithProgress;

/// Prefix of the autoencoder weights inside a latent diffusion checkpoint.
pub const FIRST_STAGE_PREFIX: &str = "first_stage_model.";

/// Key under which PyTorch Lightning checkpoints nest the model weights.
const LIGHTNING_STATE_DICT_KEY: &str = "state_dict";

/// Named weights of a model.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

/// Result of comparing a state dict against the names a model expects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl KeyReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl StateDict {
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load a checkpoint, dispatching on the file extension.
    ///
    /// - `.safetensors` files are read directly.
    /// - `.ckpt`, `.pt`, `.pth` and `.bin` files are read as PyTorch pickles. Lightning checkpoints
    ///   nest their weights under `state_dict`; plain state dicts are read as-is.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device, silent: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("loading checkpoint from {}.", path.display());

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let tensors: Vec<(String, Tensor)> = match ext {
            "safetensors" => candle_core::safetensors::load(path, &Device::Cpu)?
                .into_iter()
                .collect(),
            "ckpt" | "pt" | "pth" | "bin" => {
                match candle_core::pickle::read_all_with_key(path, Some(LIGHTNING_STATE_DICT_KEY))
                {
                    Ok(tensors) => tensors,
                    Err(e) => {
                        debug!("no `{LIGHTNING_STATE_DICT_KEY}` entry ({e}), reading the checkpoint as a plain state dict.");
                        candle_core::pickle::read_all_with_key(path, None)?
                    }
                }
            }
            other => anyhow::bail!("Unexpected checkpoint extension `{other}`."),
        };

        let mut loaded = HashMap::new();
        for (name, tensor) in tensors.into_iter().with_progress("Loading tensors", silent) {
            loaded.insert(name, tensor.to_device(device)?);
        }
        info!("loaded {} tensors.", loaded.len());

        Ok(Self { tensors: loaded })
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }

    /// Replace every autoencoder weight with the one of the same name from a standalone VAE
    /// checkpoint. A first stage weight which the VAE checkpoint lacks is an error.
    pub fn with_vae_override(mut self, vae: &StateDict) -> anyhow::Result<Self> {
        let mut replaced = 0usize;
        for (name, tensor) in self.tensors.iter_mut() {
            let Some(vae_name) = name.strip_prefix(FIRST_STAGE_PREFIX) else {
                continue;
            };
            let Some(vae_tensor) = vae.get(vae_name) else {
                anyhow::bail!("VAE checkpoint is missing `{vae_name}` (needed for `{name}`).");
            };
            *tensor = vae_tensor.clone();
            replaced += 1;
        }
        info!("replaced {replaced} first stage tensors from the VAE checkpoint.");
        Ok(self)
    }

    /// Compare against the names a model expects, sorted.
    pub fn key_report<S: AsRef<str>>(&self, expected: &[S]) -> KeyReport {
        let expected = expected
            .iter()
            .map(|name| name.as_ref())
            .collect::<BTreeSet<_>>();
        let present = self
            .tensors
            .keys()
            .map(String::as_str)
            .collect::<BTreeSet<_>>();

        KeyReport {
            missing: expected
                .difference(&present)
                .map(ToString::to_string)
                .collect(),
            unexpected: present
                .difference(&expected)
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Cast every floating point tensor to `dtype`. Integer buffers are kept as-is.
    pub fn to_dtype(self, dtype: DType) -> candle_core::Result<Self> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in self.tensors {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }
        Ok(Self { tensors })
    }
}
