use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Plugin packaging formats the server can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    Clap,
    Vst3,
    Lv2,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 3] = [PluginFormat::Clap, PluginFormat::Vst3, PluginFormat::Lv2];

    /// Stable tag used in the registry document, logs and the child-process
    /// scan argument.
    pub fn label(self) -> &'static str {
        match self {
            PluginFormat::Clap => "CLAP",
            PluginFormat::Vst3 => "VST3",
            PluginFormat::Lv2 => "LV2",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CLAP" => Some(PluginFormat::Clap),
            "VST3" => Some(PluginFormat::Vst3),
            "LV2" => Some(PluginFormat::Lv2),
            _ => None,
        }
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Metadata describing one known-good plugin. The installation path doubles
/// as the stable identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub path: String,
    pub name: String,
    pub format: PluginFormat,
    /// Modification time (seconds since the epoch) of the binary when it was
    /// scanned. A differing mtime means the plugin needs rescanning.
    pub last_modified: Option<u64>,
}

impl PluginDescriptor {
    pub fn from_path(path: &Path, format: PluginFormat) -> Self {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("Unknown Plugin")
            .to_string();
        Self {
            path: path.display().to_string(),
            name,
            format,
            last_modified: binary_mtime(path),
        }
    }

    /// True when the underlying binary changed since the descriptor was
    /// recorded, or disappeared entirely.
    pub fn needs_rescan(&self) -> bool {
        binary_mtime(Path::new(&self.path)) != self.last_modified || self.last_modified.is_none()
    }
}

/// Modification time of a candidate binary, if it can be read.
pub fn binary_mtime(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|age| age.as_secs())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let descriptor = PluginDescriptor {
            path: "/usr/lib/vst3/Comp.vst3".to_string(),
            name: "Comp".to_string(),
            format: PluginFormat::Vst3,
            last_modified: Some(1_700_000_000),
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let roundtrip: PluginDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip, descriptor);
    }

    #[test]
    fn labels_parse_back() {
        for format in PluginFormat::ALL {
            assert_eq!(PluginFormat::from_label(format.label()), Some(format));
        }
        assert_eq!(PluginFormat::from_label("vst3"), Some(PluginFormat::Vst3));
        assert_eq!(PluginFormat::from_label("AAX"), None);
    }

    #[test]
    fn unchanged_binary_needs_no_rescan() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("synth.clap");
        std::fs::write(&binary, b"plugin").unwrap();
        let descriptor = PluginDescriptor::from_path(&binary, PluginFormat::Clap);
        assert_eq!(descriptor.name, "synth");
        assert!(!descriptor.needs_rescan());
    }

    #[test]
    fn missing_binary_needs_rescan() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("gone.clap");
        std::fs::write(&binary, b"plugin").unwrap();
        let descriptor = PluginDescriptor::from_path(&binary, PluginFormat::Clap);
        std::fs::remove_file(&binary).unwrap();
        assert!(descriptor.needs_rescan());
    }
}
