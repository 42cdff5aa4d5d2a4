//! Sources of instance configuration records.

use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::Value;

use sourcehub_shared::{Result, SourceHubError, load_config_from};

/// Read-only, reloadable sequence of raw instance records.
///
/// Records stay untyped here so one malformed entry can be reported by the
/// loader without failing the whole read.
pub trait InstanceConfigStore: Send + Sync {
    fn instance_confs(&self) -> Result<Vec<Value>>;
}

/// Reads `[[instances]]` from a TOML config file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl InstanceConfigStore for FileConfigStore {
    fn instance_confs(&self) -> Result<Vec<Value>> {
        Ok(load_config_from(&self.path)?.instances)
    }
}

/// In-memory store, replaceable at runtime.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: RwLock<Vec<Value>>,
}

impl MemoryConfigStore {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Replace the stored records; takes effect on the next reload.
    pub fn replace(&self, records: Vec<Value>) -> Result<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| SourceHubError::config("instance store lock poisoned"))?;
        *guard = records;
        Ok(())
    }
}

impl InstanceConfigStore for MemoryConfigStore {
    fn instance_confs(&self) -> Result<Vec<Value>> {
        self.records
            .read()
            .map(|records| records.clone())
            .map_err(|_| SourceHubError::config("instance store lock poisoned"))
    }
}
