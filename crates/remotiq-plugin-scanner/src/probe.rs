use std::path::Path;

use thiserror::Error;

use remotiq_plugin_db::{PluginDescriptor, PluginFormat};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("candidate is not a loadable plugin")]
    Unloadable,
}

/// Metadata-extraction seam for one plugin candidate.
///
/// The default implementation inspects the candidate on disk; format-specific
/// loaders plug in richer probes, and tests substitute deterministic ones.
/// Probing runs inside the disposable scan child, so an implementation is
/// allowed to crash or hang.
pub trait PluginProber {
    fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, ProbeError>;
}

/// Probes a candidate by opening its binary on disk.
#[derive(Debug, Default)]
pub struct BinaryProber;

impl PluginProber for BinaryProber {
    fn probe(&self, path: &Path, format: PluginFormat) -> Result<PluginDescriptor, ProbeError> {
        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() && metadata.len() == 0 {
            return Err(ProbeError::Unloadable);
        }
        Ok(PluginDescriptor::from_path(path, format))
    }
}
