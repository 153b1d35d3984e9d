use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::warn;

/// Contract for the per-connection worker collaborator. The streaming
/// protocol itself lives behind this seam.
pub trait SessionWorker: Send + 'static {
    /// Runs on the session thread until the client disconnects or `stop` is
    /// observed. Implementations are expected to poll `stop` and unwind
    /// blocking I/O promptly once it is set.
    fn run(&mut self, stream: TcpStream, stop: &AtomicBool);
}

impl<F> SessionWorker for F
where
    F: FnMut(TcpStream, &AtomicBool) + Send + 'static,
{
    fn run(&mut self, stream: TcpStream, stop: &AtomicBool) {
        self(stream, stop)
    }
}

impl SessionWorker for Box<dyn SessionWorker> {
    fn run(&mut self, stream: TcpStream, stop: &AtomicBool) {
        (**self).run(stream, stop)
    }
}

/// Dispatcher-side handle for one accepted connection.
///
/// The accepted socket is owned by the worker exclusively; the handle keeps
/// only a shutdown-capable clone. Lifecycle is create-on-accept, run until
/// the client disconnects or shutdown, then terminal.
pub struct WorkerSession {
    peer: String,
    stop: Arc<AtomicBool>,
    socket: TcpStream,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerSession {
    pub fn spawn<W: SessionWorker>(stream: TcpStream, mut worker: W) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let socket = stream.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("session-{peer}"))
            .spawn(move || worker.run(stream, &stop_for_thread))?;
        Ok(Self {
            peer,
            stop,
            socket,
            handle: Some(handle),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Cooperative stop: raises the flag and shuts the socket down so a
    /// blocking read in the worker unwinds.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Waits, unboundedly, for the session thread to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("session thread for {} panicked", self.peer);
            }
        }
    }
}
