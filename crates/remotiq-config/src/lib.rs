//! Server configuration for the Remotiq remote plugin host.

mod paths;
mod store;

pub use paths::*;
pub use store::*;
