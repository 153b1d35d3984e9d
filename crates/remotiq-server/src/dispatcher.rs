use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use remotiq_config::ServerConfig;
use remotiq_plugin_scanner::Discovery;

use crate::session::{SessionWorker, WorkerSession};

/// Default base listen port; the instance identity is added to it.
pub const DEFAULT_BASE_PORT: u16 = 52180;

/// Produces a fresh worker for each accepted connection.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn SessionWorker> + Send + Sync>;

/// Lifecycle states of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Discovering,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Owns the listening socket and the live-session list.
///
/// Discovery fully completes and is persisted before the listener opens, so
/// no client is ever served against a partially-updated registry. Finished
/// sessions are detected synchronously after each accept and disposed of on a
/// background thread; only [`Dispatcher::shutdown`] waits unboundedly.
pub struct Dispatcher {
    config: Arc<Mutex<ServerConfig>>,
    discovery: Discovery,
    factory: WorkerFactory,
    host: String,
    base_port: u16,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: AtomicBool,
    sessions: Mutex<Vec<WorkerSession>>,
    disposal_tx: Sender<Vec<WorkerSession>>,
    _disposer: thread::JoinHandle<()>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Mutex<ServerConfig>>,
        discovery: Discovery,
        factory: WorkerFactory,
        host: String,
        base_port: u16,
    ) -> Self {
        let (disposal_tx, disposal_rx) = crossbeam_channel::unbounded::<Vec<WorkerSession>>();
        let disposer = thread::spawn(move || {
            for batch in disposal_rx.iter() {
                for mut session in batch {
                    session.join();
                }
            }
        });
        Self {
            config,
            discovery,
            factory,
            host,
            base_port,
            state: Mutex::new(ServerState::Idle),
            local_addr: Mutex::new(None),
            stop: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            disposal_tx,
            _disposer: disposer,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Address actually bound, once the dispatcher is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Sessions that are running or not yet observed as finished.
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Discovery, then the accept loop. Blocks the calling thread until
    /// shutdown or a fatal listener error.
    pub fn run(&self) -> Result<()> {
        self.set_state(ServerState::Discovering);
        if let Err(err) = self.discovery.scan_for_plugins(&[]) {
            warn!("plugin discovery failed: {err:#}");
        }
        if let Err(err) = self.discovery.persist() {
            warn!("could not persist discovery results: {err:#}");
        }
        if self.stop.load(Ordering::SeqCst) {
            self.set_state(ServerState::Stopped);
            return Ok(());
        }

        let (id, port) = {
            let config = self.config.lock();
            let port = self
                .base_port
                .checked_add(config.id)
                .context("listen port out of range")?;
            (config.id, port)
        };
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        info!("creating listener {host}:{port}");
        let listener = match TcpListener::bind((host, port)) {
            Ok(listener) => listener,
            Err(err) => {
                error!("failed to create listener on {host}:{port}: {err}");
                return Err(err).context("failed to create listener");
            }
        };
        *self.local_addr.lock() = Some(listener.local_addr()?);
        if self.stop.load(Ordering::SeqCst) {
            self.set_state(ServerState::Stopped);
            return Ok(());
        }
        self.set_state(ServerState::Listening);
        info!("server started: ID={id}, PORT={port}");

        for stream in listener.incoming() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => self.dispatch(stream),
                Err(err) => warn!("accept failed: {err}"),
            }
        }

        self.set_state(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("new client {peer}");
        let worker = (self.factory)();
        match WorkerSession::spawn(stream, worker) {
            Ok(session) => {
                let mut sessions = self.sessions.lock();
                sessions.push(session);
                self.reclaim_finished(&mut sessions);
            }
            Err(err) => warn!("failed to start session for {peer}: {err}"),
        }
    }

    /// Lazy reclamation: finished sessions are detected here, synchronously,
    /// but their teardown runs on the disposer thread so the next accept is
    /// never delayed by it.
    fn reclaim_finished(&self, sessions: &mut Vec<WorkerSession>) {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < sessions.len() {
            if sessions[index].is_running() {
                index += 1;
            } else {
                finished.push(sessions.swap_remove(index));
            }
        }
        if !finished.is_empty() {
            debug!("reclaiming {} finished sessions", finished.len());
            let _ = self.disposal_tx.send(finished);
        }
    }

    /// Stops the dispatch loop and every live session, waiting unboundedly
    /// for each to finish. Idempotent and safe to invoke in any state.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ServerState::ShuttingDown);
        // poke the listener so a blocked accept wakes up and sees the flag
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
        let mut sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions.iter() {
            info!(
                "shutting down worker {}, running={}",
                session.peer(),
                session.is_running()
            );
            session.request_stop();
        }
        for session in sessions.iter_mut() {
            session.join();
        }
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use remotiq_config::ConfigStore;
    use remotiq_plugin_db::{CrashMarker, PluginRegistry};

    use super::*;

    /// Worker that reads until EOF; `request_stop` shuts the socket down and
    /// unblocks it. Tracks how many workers are mid-run.
    fn counting_factory(active: Arc<AtomicUsize>) -> WorkerFactory {
        Arc::new(move || {
            let active = Arc::clone(&active);
            Box::new(move |mut stream: TcpStream, _stop: &AtomicBool| {
                active.fetch_add(1, Ordering::SeqCst);
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink);
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
    }

    fn test_dispatcher(dir: &std::path::Path, factory: WorkerFactory) -> Dispatcher {
        // all formats disabled: the discovery pass is a no-op
        let config = Arc::new(Mutex::new(ServerConfig::default()));
        let store = ConfigStore::new(dir.join("config.json"));
        let registry = Arc::new(PluginRegistry::open(dir.join("plugins.json")).unwrap());
        let marker = CrashMarker::new(dir.join("crashed.list"));
        let discovery = Discovery::new(Arc::clone(&config), store, registry, marker);
        Dispatcher::new(config, discovery, factory, "127.0.0.1".to_string(), 0)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_for_addr(dispatcher: &Dispatcher) -> SocketAddr {
        wait_for("listener", || dispatcher.local_addr().is_some());
        dispatcher.local_addr().unwrap()
    }

    #[test]
    fn reclamation_removes_only_finished_sessions() {
        let dir = tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(test_dispatcher(dir.path(), counting_factory(Arc::clone(&active))));
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.run())
        };
        let addr = wait_for_addr(&dispatcher);
        assert_eq!(dispatcher.state(), ServerState::Listening);

        let first = TcpStream::connect(addr).unwrap();
        wait_for("first session", || dispatcher.live_sessions() == 1);
        drop(first);
        wait_for("first worker exit", || active.load(Ordering::SeqCst) == 0);
        // give the finished session thread a beat to fully terminate
        thread::sleep(Duration::from_millis(100));

        let _second = TcpStream::connect(addr).unwrap();
        wait_for("second session", || active.load(Ordering::SeqCst) == 1);
        let _third = TcpStream::connect(addr).unwrap();
        wait_for("third session", || active.load(Ordering::SeqCst) == 2);

        // the finished first session was reclaimed, the live two remain
        wait_for("reclamation", || dispatcher.live_sessions() == 2);

        dispatcher.shutdown();
        runner.join().unwrap().unwrap();
        assert_eq!(dispatcher.state(), ServerState::Stopped);
        assert_eq!(dispatcher.live_sessions(), 0);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_stops_live_sessions() {
        let dir = tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(test_dispatcher(dir.path(), counting_factory(Arc::clone(&active))));
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.run())
        };
        let addr = wait_for_addr(&dispatcher);

        let _client = TcpStream::connect(addr).unwrap();
        wait_for("session start", || active.load(Ordering::SeqCst) == 1);

        dispatcher.shutdown();
        dispatcher.shutdown();
        runner.join().unwrap().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.state(), ServerState::Stopped);
    }

    #[test]
    fn shutdown_before_run_is_safe() {
        let dir = tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let dispatcher = test_dispatcher(dir.path(), counting_factory(active));
        dispatcher.shutdown();
        dispatcher.run().unwrap();
        assert_eq!(dispatcher.state(), ServerState::Stopped);
    }

    #[test]
    fn bind_failure_is_fatal_for_the_instance() {
        let dir = tempdir().unwrap();
        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let active = Arc::new(AtomicUsize::new(0));
        let config = Arc::new(Mutex::new(ServerConfig::default()));
        let store = ConfigStore::new(dir.path().join("config.json"));
        let registry = Arc::new(PluginRegistry::open(dir.path().join("plugins.json")).unwrap());
        let marker = CrashMarker::new(dir.path().join("crashed.list"));
        let discovery = Discovery::new(Arc::clone(&config), store, registry, marker);
        let dispatcher = Dispatcher::new(
            config,
            discovery,
            counting_factory(active),
            "127.0.0.1".to_string(),
            port,
        );
        assert!(dispatcher.run().is_err());
        assert_ne!(dispatcher.state(), ServerState::Listening);
    }
}
