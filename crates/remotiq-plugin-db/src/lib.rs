//! Persistent plugin registry and blacklist for the Remotiq server.

mod crash_marker;
mod descriptor;
mod registry;

pub use crash_marker::*;
pub use descriptor::*;
pub use registry::*;
