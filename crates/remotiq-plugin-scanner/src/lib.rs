//! Crash-isolated plugin discovery for the Remotiq server.
//!
//! Plugins are untrusted third-party native code. Every candidate is probed
//! in a disposable child process (the server re-invoked in single-plugin scan
//! mode) so a segfaulting or deadlocking plugin can only take down that
//! child, never the long-lived server or its client sessions. Results travel
//! back through the persisted registry plus the child's exit code, and a
//! crash-marker file covers the case where the child dies too abruptly to
//! finalize anything.

mod discovery;
mod isolated;
mod locations;
mod probe;

pub use discovery::*;
pub use isolated::*;
pub use locations::*;
pub use probe::*;
