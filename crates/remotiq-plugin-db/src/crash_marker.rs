use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::registry::PluginRegistry;

/// Pre-commit marker listing the plugin paths currently being probed.
///
/// Written before a risky load and deleted on clean completion, so its mere
/// presence at startup means a previous scan died before it could finalize
/// the registry. Recovering the marker into the blacklist is what prevents an
/// infinite re-crash loop across restarts.
#[derive(Debug, Clone)]
pub struct CrashMarker {
    path: PathBuf,
}

impl CrashMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Records the paths about to be probed, newline-delimited.
    pub fn record(&self, paths: &[String]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, paths.join("\n"))
    }

    /// Deletes the marker; a missing file is fine.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reads and deletes the marker, returning the recorded paths. Blank
    /// lines are tolerated.
    pub fn consume(&self) -> io::Result<Vec<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        self.clear()?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Startup recovery: every recorded path becomes a blacklist entry and
    /// the marker is deleted. Returns how many entries were recovered; the
    /// caller re-persists the registry when the count is non-zero.
    pub fn recover(&self, registry: &PluginRegistry) -> io::Result<usize> {
        let paths = self.consume()?;
        for path in &paths {
            warn!("plugin crashed during a previous scan, blacklisting: {path}");
            registry.add_to_blacklist(path);
        }
        Ok(paths.len())
    }
}
