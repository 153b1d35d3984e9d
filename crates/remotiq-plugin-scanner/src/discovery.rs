use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use remotiq_config::{ConfigStore, ServerConfig};
use remotiq_plugin_db::{CrashMarker, PluginFormat, PluginRegistry};

use crate::isolated::{IsolatedScanner, ScanOutcome};
use crate::locations::{display_name, ScanLocations};

/// Name fragments identifying the host's own bridge plugins. Candidates
/// carrying one of these are never scanned, so the server cannot end up
/// loading itself.
const SELF_PLUGIN_MARKERS: [&str; 2] = ["remotiq", "remlink"];

/// Exclusion policy for scan candidates.
///
/// A non-empty include list accepts exact name matches only and overrides the
/// configured exclusion set entirely; otherwise exact membership in the
/// exclusion set excludes.
pub fn should_exclude(name: &str, include: &[String], exclude: &BTreeSet<String>) -> bool {
    let folded = name.to_lowercase();
    if SELF_PLUGIN_MARKERS
        .iter()
        .any(|marker| folded.contains(marker))
    {
        return true;
    }
    if !include.is_empty() {
        return !include.iter().any(|incl| incl == name);
    }
    exclude.contains(name)
}

/// Drives discovery passes: enumerates candidates per enabled format, probes
/// the ones that need it through the crash-isolated scanner, and reconciles
/// the exclusion list against what was actually observed.
///
/// The primary pass and [`Discovery::add_plugins`] both mutate the registry
/// and configuration; callers serialize the two entry points.
#[derive(Clone)]
pub struct Discovery {
    pub locations: ScanLocations,
    pub isolated: IsolatedScanner,
    config: Arc<Mutex<ServerConfig>>,
    store: ConfigStore,
    registry: Arc<PluginRegistry>,
    marker: CrashMarker,
}

impl Discovery {
    pub fn new(
        config: Arc<Mutex<ServerConfig>>,
        store: ConfigStore,
        registry: Arc<PluginRegistry>,
        marker: CrashMarker,
    ) -> Self {
        Self {
            locations: ScanLocations::default(),
            isolated: IsolatedScanner::default(),
            config,
            store,
            registry,
            marker,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// One full discovery pass. With an empty include list every candidate of
    /// every enabled format is considered; otherwise only the named plugins
    /// are accepted.
    pub fn scan_for_plugins(&self, include: &[String]) -> Result<()> {
        info!("scanning for plugins...");
        let (formats, mut never_seen) = {
            let config = self.config.lock();
            (enabled_formats(&config), config.exclude_plugins.clone())
        };

        self.registry.reload()?;

        for format in formats {
            for candidate in self.locations.candidates(format) {
                let path = candidate.display().to_string();
                let name = display_name(&candidate);
                let known = self.registry.find(&path);
                let needs_scan = known.map_or(true, |descriptor| descriptor.needs_rescan());
                let excluded = {
                    let config = self.config.lock();
                    should_exclude(&name, include, &config.exclude_plugins)
                };
                if needs_scan && !self.registry.is_blacklisted(&path) && !excluded {
                    info!("  scanning: {name}");
                    self.scan_candidate(&path, format);
                } else {
                    debug!("  skipping: {name}");
                }
                never_seen.remove(&name);
            }
        }

        self.registry.reload()?;
        self.registry.sort_by_name();

        if !never_seen.is_empty() {
            let mut config = self.config.lock();
            for name in &never_seen {
                debug!("pruning stale exclusion: {name}");
                config.exclude_plugins.remove(name);
            }
        }

        info!("scan for plugins finished");
        Ok(())
    }

    fn scan_candidate(&self, path: &str, format: PluginFormat) {
        match self.isolated.scan(path, format) {
            // exit-code outcomes are logged by the scanner itself
            Ok(ScanOutcome::Completed) | Ok(ScanOutcome::Failed(_)) => {}
            Ok(ScanOutcome::TimedOut) => {
                // the child persisted nothing; record the hang ourselves
                if let Err(err) = self.registry.reload() {
                    warn!("could not reload registry after hung scan: {err}");
                }
                self.registry.add_to_blacklist(path);
                if let Err(err) = self.registry.save() {
                    warn!("could not persist blacklist entry for {path}: {err}");
                }
                let _ = self.marker.clear();
            }
            Err(err) => {
                // candidate stays unknown and is retried on the next pass
                warn!("failed to launch scan process for {path}: {err:#}");
            }
        }
    }

    /// Persists the configuration and registry documents.
    pub fn persist(&self) -> Result<()> {
        self.store.save(&self.config.lock())?;
        self.registry.save()?;
        Ok(())
    }

    /// Runs a discovery pass restricted to `names` off the calling thread,
    /// persists the results, and invokes `callback` exactly once with whether
    /// every requested name is now known. Must not run concurrently with the
    /// primary pass.
    pub fn add_plugins<F>(&self, names: Vec<String>, callback: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let discovery = self.clone();
        thread::spawn(move || {
            if let Err(err) = discovery.scan_for_plugins(&names) {
                warn!("on-demand plugin scan failed: {err:#}");
                callback(false);
                return;
            }
            if let Err(err) = discovery.persist() {
                warn!("could not persist on-demand scan results: {err:#}");
                callback(false);
                return;
            }
            let known = discovery.registry.plugins();
            let all_found = names
                .iter()
                .all(|name| known.iter().any(|plugin| &plugin.name == name));
            callback(all_found);
        })
    }
}

fn enabled_formats(config: &ServerConfig) -> Vec<PluginFormat> {
    let mut formats = Vec::new();
    if config.enable_clap {
        formats.push(PluginFormat::Clap);
    }
    if config.enable_vst3 {
        formats.push(PluginFormat::Vst3);
    }
    if config.enable_lv2 {
        formats.push(PluginFormat::Lv2);
    }
    formats
}
