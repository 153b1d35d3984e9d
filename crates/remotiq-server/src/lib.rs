//! Connection dispatch for the Remotiq server.
//!
//! The dispatcher runs plugin discovery to completion, then owns the
//! listening socket: every accepted connection becomes a [`WorkerSession`]
//! on its own thread, and finished sessions are reclaimed lazily so accept
//! latency never pays for teardown. The per-connection streaming protocol
//! lives behind the [`SessionWorker`] seam.

mod dispatcher;
mod session;

pub use dispatcher::*;
pub use session::*;
