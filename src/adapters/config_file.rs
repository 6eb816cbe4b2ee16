//! JSON file configuration adapter.
//!
//! Implements [`ConfigPort`] over one JSON document.  Fields missing from
//! the file take their defaults; a missing file yields the full default
//! config.  Values are range-checked on both load and save.

use std::fs;
use std::io;
use std::path::PathBuf;

use log::info;

use crate::app::ports::ConfigPort;
use crate::config::{LoopConfig, validate_config};
use crate::error::ConfigError;

pub struct JsonConfigFile {
    path: PathBuf,
}

impl JsonConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigPort for JsonConfigFile {
    fn load(&self) -> Result<LoopConfig, ConfigError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "JsonConfigFile: {} not found, using defaults",
                    self.path.display()
                );
                return Ok(LoopConfig::default());
            }
            Err(e) => return Err(ConfigError::Io(e.to_string())),
        };
        let cfg: LoopConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Corrupted(e.to_string()))?;
        validate_config(&cfg)?;
        info!("JsonConfigFile: loaded {}", self.path.display());
        Ok(cfg)
    }

    fn save(&self, config: &LoopConfig) -> Result<(), ConfigError> {
        validate_config(config)?;
        let text =
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Io(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        fs::write(&self.path, text).map_err(|e| ConfigError::Io(e.to_string()))?;
        info!("JsonConfigFile: saved {}", self.path.display());
        Ok(())
    }
}
