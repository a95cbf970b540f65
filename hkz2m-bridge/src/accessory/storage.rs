//! Persistent bridge data in the storage directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::AccessoryError;

const BRIDGE_FILE: &str = "bridge.json";

/// Data kept across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBridge {
    /// Setup code the bridge was last published with. Nothing in this
    /// crate reads it back; pairing is left to an external front end.
    pub pin: String,
    /// Incremented every time the accessory set is published, so
    /// controllers refetch the attribute database.
    pub config_number: u32,
}

/// Storage directory holding `bridge.json`.
#[derive(Debug, Clone)]
pub struct BridgeStore {
    dir: PathBuf,
}

impl BridgeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join(BRIDGE_FILE)
    }

    /// Read the stored data, if any.
    pub fn load(&self) -> Result<Option<StoredBridge>, AccessoryError> {
        let path = self.file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AccessoryError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| AccessoryError::Storage {
                path: path.display().to_string(),
                source,
            })
    }

    /// Record a new publication of the accessory set and return the
    /// updated data. Creates the directory on first use.
    pub fn bump(&self, pin: &str) -> Result<StoredBridge, AccessoryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| AccessoryError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut stored = self.load()?.unwrap_or_default();
        if !stored.pin.is_empty() && stored.pin != pin {
            info!(dir = %self.dir.display(), "Setup code changed");
        }
        stored.pin = pin.to_string();
        stored.config_number = stored.config_number.wrapping_add(1).max(1);

        let path = self.file();
        let content = serde_json::to_string_pretty(&stored).map_err(|source| {
            AccessoryError::Storage {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(&path, content).map_err(|source| AccessoryError::Io {
            path: path.display().to_string(),
            source,
        })?;

        debug!(path = %path.display(), config_number = stored.config_number, "Stored bridge data");
        Ok(stored)
    }
}
