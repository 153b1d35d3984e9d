use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use remotiq_plugin_db::{CrashMarker, PluginFormat, PluginRegistry};

use crate::probe::PluginProber;

/// Wall-clock budget for one scan child process.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of probing one candidate in a disposable child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Child exited zero; it already persisted the registry update.
    Completed,
    /// Child exited non-zero. The candidate stays out of the registry and is
    /// retried on the next pass.
    Failed(i32),
    /// Child was still running at the deadline and was killed. A hang is a
    /// crash from the host's perspective.
    TimedOut,
}

/// Re-invokes the host executable in single-plugin scan mode.
///
/// The child performs exactly one scan-and-persist cycle ([`scan_plugin`])
/// and communicates only through its exit code and the registry document, so
/// an untrusted binary can never destabilize the calling process.
#[derive(Debug, Clone)]
pub struct IsolatedScanner {
    pub executable: PathBuf,
    /// Extra arguments forwarded to the child ahead of `--scan`, e.g. a
    /// non-default state directory.
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for IsolatedScanner {
    fn default() -> Self {
        Self {
            executable: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("remotiq-server")),
            args: Vec::new(),
            timeout: SCAN_TIMEOUT,
        }
    }
}

impl IsolatedScanner {
    /// Argument format consumed by the child: `<path>|<format label>`.
    pub fn scan_argument(path: &str, format: PluginFormat) -> String {
        format!("{path}|{}", format.label())
    }

    pub fn scan(&self, path: &str, format: PluginFormat) -> Result<ScanOutcome> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .arg("--scan")
            .arg(Self::scan_argument(path, format))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start scan process for {path}"))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait().context("failed to poll scan process")? {
                Some(status) if status.success() => return Ok(ScanOutcome::Completed),
                Some(status) => {
                    let code = status.code().unwrap_or(-1);
                    warn!("scan of {path} failed with exit code {code}");
                    return Ok(ScanOutcome::Failed(code));
                }
                None if Instant::now() >= deadline => {
                    error!("scan timeout for {path}, killing scan process");
                    child.kill().context("failed to kill hung scan process")?;
                    let _ = child.wait();
                    return Ok(ScanOutcome::TimedOut);
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

/// Splits a `--scan` argument back into candidate path and format.
pub fn parse_scan_argument(arg: &str) -> Option<(String, PluginFormat)> {
    let (path, label) = arg.rsplit_once('|')?;
    if path.is_empty() {
        return None;
    }
    Some((path.to_string(), PluginFormat::from_label(label)?))
}

/// One scan-and-persist cycle, run inside the disposable child process.
///
/// Opens a scratch copy of the registry, records the candidate in the crash
/// marker, probes it, and persists the outcome: success upserts a descriptor,
/// a clean probe failure leaves the registry untouched (the candidate is
/// retried on a later pass). The marker survives only if the probe dies
/// before finishing. Never call this from the long-lived server for an
/// untrusted candidate.
pub fn scan_plugin<P: PluginProber>(
    registry_path: &Path,
    marker: &CrashMarker,
    prober: &P,
    path: &str,
    format: PluginFormat,
) -> Result<bool> {
    let registry = PluginRegistry::open(registry_path)?;
    info!("scanning path={path} fmt={format}");
    marker.record(&[path.to_string()])?;
    let success = match prober.probe(Path::new(path), format) {
        Ok(descriptor) => {
            registry.upsert(descriptor);
            true
        }
        Err(err) => {
            warn!("probe failed for {path}: {err}");
            false
        }
    };
    registry.save()?;
    marker.clear()?;
    Ok(success)
}
