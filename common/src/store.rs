use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::config::{ConfigError, DeviceConfig};

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Config document kept as a single JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file yields `base` unchanged.
    pub fn load_into(&self, base: DeviceConfig) -> Result<DeviceConfig, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => {
                let mut config = base;
                config.apply_json(&raw)?;
                Ok(config)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(base),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn load(&self) -> Result<DeviceConfig, StoreError> {
        self.load_into(DeviceConfig::default())
    }

    pub fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let payload = config.to_json()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, payload).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
