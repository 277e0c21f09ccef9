use crate::bank::KernelBank;
use markerconv_core::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A directory of per-layer parameter files, `conv1.json` upward. File
/// names are 1-based to match how practitioners number layers; every index
/// in the API is 0-based.
#[derive(Debug, Clone)]
pub struct ParamStore {
    dir: PathBuf,
}

impl ParamStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        ParamStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layer_path(&self, layer: usize) -> PathBuf {
        self.dir.join(format!("conv{}.json", layer + 1))
    }

    pub fn has_layer(&self, layer: usize) -> bool {
        self.layer_path(layer).is_file()
    }

    pub fn save_layer(&self, layer: usize, bank: &KernelBank) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(bank)
            .map_err(|e| ModelError::Config(format!("could not encode kernel bank: {e}")))?;
        fs::write(self.layer_path(layer), json)?;
        Ok(())
    }

    pub fn load_layer(&self, layer: usize) -> Result<KernelBank> {
        let path = self.layer_path(layer);
        let json = fs::read_to_string(&path)?;
        let bank: KernelBank = serde_json::from_str(&json).map_err(|e| {
            ModelError::Config(format!("malformed kernel bank {}: {e}", path.display()))
        })?;
        bank.check()?;
        Ok(bank)
    }
}

/// A manual kernel choice for one layer: the bank indices to keep, in the
/// order they should appear in the curated bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelManifest {
    pub selected: Vec<usize>,
}

impl KernelManifest {
    pub fn new(selected: Vec<usize>) -> Self {
        KernelManifest { selected }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&json)
            .map_err(|e| ModelError::Config(format!("malformed kernel manifest: {e}")))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ModelError::Config(format!("could not encode kernel manifest: {e}")))?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Curate `bank` down to the kernels this manifest names.
    pub fn apply(&self, bank: &KernelBank) -> Result<KernelBank> {
        bank.select(&self.selected)
    }
}
