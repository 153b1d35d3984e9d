use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::descriptor::PluginDescriptor;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read plugin registry: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to serialize plugin registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// Known-good plugin descriptors plus the blacklist of plugins that crashed
/// or hung a probe.
///
/// A path lives in at most one of the two sets at any time; scanning moves it
/// between them. Mutators only touch the in-memory document — callers persist
/// explicitly with [`PluginRegistry::save`].
#[derive(Debug)]
pub struct PluginRegistry {
    path: PathBuf,
    data: Mutex<RegistryFile>,
}

impl PluginRegistry {
    /// Opens the registry document if present, otherwise starts empty. A
    /// malformed document is logged and treated as empty rather than failing
    /// startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let data = read_document(&path)?;
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the document from disk, discarding the in-memory state.
    /// Discovery uses this to pick up writes made by scan child processes.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let data = read_document(&self.path)?;
        *self.data.lock() = data;
        Ok(())
    }

    /// Serializes the full registry, overwriting the prior file.
    pub fn save(&self) -> Result<(), RegistryError> {
        let data = self.data.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*data)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.data.lock().plugins.clone()
    }

    pub fn find(&self, path: &str) -> Option<PluginDescriptor> {
        self.data
            .lock()
            .plugins
            .iter()
            .find(|plugin| plugin.path == path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().plugins.is_empty()
    }

    /// Adds or replaces a descriptor. Any blacklist entry for the same path
    /// is dropped; a plugin is never known and blacklisted at once.
    pub fn upsert(&self, descriptor: PluginDescriptor) {
        let mut data = self.data.lock();
        data.blacklist.retain(|entry| entry != &descriptor.path);
        if let Some(existing) = data
            .plugins
            .iter_mut()
            .find(|plugin| plugin.path == descriptor.path)
        {
            *existing = descriptor;
        } else {
            data.plugins.push(descriptor);
        }
    }

    pub fn remove(&self, path: &str) {
        self.data.lock().plugins.retain(|plugin| plugin.path != path);
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.data.lock().blacklist.clone()
    }

    pub fn is_blacklisted(&self, path: &str) -> bool {
        self.data.lock().blacklist.iter().any(|entry| entry == path)
    }

    /// Records a crashed or hung plugin. Any known descriptor for the path is
    /// dropped. Entries never expire on their own; a successful manual rescan
    /// or deleting the registry removes them.
    pub fn add_to_blacklist(&self, path: &str) {
        let mut data = self.data.lock();
        data.plugins.retain(|plugin| plugin.path != path);
        if !data.blacklist.iter().any(|entry| entry == path) {
            data.blacklist.push(path.to_string());
        }
    }

    pub fn remove_from_blacklist(&self, path: &str) {
        self.data.lock().blacklist.retain(|entry| entry != path);
    }

    /// Alphabetical, case-insensitive order for stable presentation.
    pub fn sort_by_name(&self) {
        self.data
            .lock()
            .plugins
            .sort_by_key(|plugin| plugin.name.to_lowercase());
    }
}

fn read_document(path: &Path) -> Result<RegistryFile, RegistryError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RegistryFile::default()),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_str(&raw) {
        Ok(data) => Ok(data),
        Err(err) => {
            warn!("malformed plugin registry at {}: {}", path.display(), err);
            Ok(RegistryFile::default())
        }
    }
}
