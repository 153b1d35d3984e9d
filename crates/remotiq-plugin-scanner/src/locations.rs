use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use remotiq_plugin_db::PluginFormat;

/// Per-format directories searched for installable plugin candidates.
///
/// Defaults cover the conventional system and per-user install locations;
/// tests and power users substitute their own roots.
#[derive(Debug, Clone)]
pub struct ScanLocations {
    pub clap: Vec<PathBuf>,
    pub vst3: Vec<PathBuf>,
    pub lv2: Vec<PathBuf>,
}

impl Default for ScanLocations {
    fn default() -> Self {
        Self {
            clap: default_roots(PluginFormat::Clap),
            vst3: default_roots(PluginFormat::Vst3),
            lv2: default_roots(PluginFormat::Lv2),
        }
    }
}

impl ScanLocations {
    pub fn roots(&self, format: PluginFormat) -> &[PathBuf] {
        match format {
            PluginFormat::Clap => &self.clap,
            PluginFormat::Vst3 => &self.vst3,
            PluginFormat::Lv2 => &self.lv2,
        }
    }

    /// Enumerates every installable candidate for one format. Unreadable
    /// directories are skipped; the result is sorted for stable logs.
    pub fn candidates(&self, format: PluginFormat) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for root in self.roots(format) {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("skipping plugin root {}: {}", root.display(), err);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if matches_format(&path, format) {
                    found.push(path);
                }
            }
        }
        found.sort();
        found
    }
}

fn matches_format(path: &Path, format: PluginFormat) -> bool {
    match format {
        PluginFormat::Clap => path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("clap"))
            .unwrap_or(false),
        PluginFormat::Vst3 => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(".vst3"))
            .unwrap_or(false),
        PluginFormat::Lv2 => {
            if path.is_dir() {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("lv2"))
                    .unwrap_or(false)
            } else {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("so"))
                    .unwrap_or(false)
            }
        }
    }
}

fn default_roots(format: PluginFormat) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    match format {
        PluginFormat::Clap => {
            roots.push(PathBuf::from("/usr/lib/clap"));
            roots.push(PathBuf::from("/usr/local/lib/clap"));
            if let Some(home) = dirs::home_dir() {
                roots.push(home.join(".clap"));
            }
            #[cfg(target_os = "macos")]
            {
                roots.push(PathBuf::from("/Library/Audio/Plug-Ins/CLAP"));
                if let Some(home) = dirs::home_dir() {
                    roots.push(home.join("Library/Audio/Plug-Ins/CLAP"));
                }
            }
        }
        PluginFormat::Vst3 => {
            roots.push(PathBuf::from("/usr/lib/vst3"));
            roots.push(PathBuf::from("/usr/local/lib/vst3"));
            if let Some(home) = dirs::home_dir() {
                roots.push(home.join(".vst3"));
            }
            #[cfg(target_os = "macos")]
            {
                roots.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
                if let Some(home) = dirs::home_dir() {
                    roots.push(home.join("Library/Audio/Plug-Ins/VST3"));
                }
            }
            #[cfg(target_os = "windows")]
            {
                if let Some(program_files) = std::env::var_os("PROGRAMFILES").map(PathBuf::from) {
                    roots.push(program_files.join("Common Files/VST3"));
                }
            }
        }
        PluginFormat::Lv2 => {
            roots.push(PathBuf::from("/usr/lib/lv2"));
            roots.push(PathBuf::from("/usr/local/lib/lv2"));
            if let Some(home) = dirs::home_dir() {
                roots.push(home.join(".lv2"));
            }
        }
    }
    roots
}

/// Human-readable name a candidate is presented and filtered under.
pub fn display_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Unknown Plugin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn candidates_match_format_specific_shapes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("synth.clap"), b"").unwrap();
        fs::write(dir.path().join("other.vst3"), b"").unwrap();
        fs::write(dir.path().join("readme.txt"), b"").unwrap();

        let locations = ScanLocations {
            clap: vec![dir.path().to_path_buf()],
            vst3: vec![dir.path().to_path_buf()],
            lv2: vec![dir.path().to_path_buf()],
        };
        let clap: Vec<_> = locations.candidates(PluginFormat::Clap);
        assert_eq!(clap, vec![dir.path().join("synth.clap")]);
        let vst3: Vec<_> = locations.candidates(PluginFormat::Vst3);
        assert_eq!(vst3, vec![dir.path().join("other.vst3")]);
        assert!(locations.candidates(PluginFormat::Lv2).is_empty());
    }

    #[test]
    fn lv2_accepts_bundle_directories_and_shared_objects() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("reverb.lv2")).unwrap();
        fs::write(dir.path().join("flat.so"), b"").unwrap();
        let locations = ScanLocations {
            clap: Vec::new(),
            vst3: Vec::new(),
            lv2: vec![dir.path().to_path_buf()],
        };
        assert_eq!(locations.candidates(PluginFormat::Lv2).len(), 2);
    }

    #[test]
    fn missing_roots_are_skipped() {
        let locations = ScanLocations {
            clap: vec![PathBuf::from("/nonexistent/remotiq-test")],
            vst3: Vec::new(),
            lv2: Vec::new(),
        };
        assert!(locations.candidates(PluginFormat::Clap).is_empty());
    }

    #[test]
    fn display_name_strips_extension() {
        assert_eq!(display_name(Path::new("/usr/lib/clap/Big Synth.clap")), "Big Synth");
    }
}
