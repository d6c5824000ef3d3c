//! Handle network connections for a filelink server.
//!
//! Two backends drive the same [`Session`] protocol engine:
//!
//! - [`serve`] — single-threaded, readiness-multiplexed. One blocking
//!   `select` per iteration, one state machine step per ready session.
//! - [`listen`] — a worker thread pool running each accepted connection's
//!   machine to completion on a blocking socket.

use std::io::ErrorKind;
use std::net::{TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::machine::{Direction, Readiness, Session};
use crate::poll::{Interests, Wait};
use crate::stream::Stream;

/// Bound TCP listening socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let inner = TcpListener::bind(addr).map_err(Error::Io)?;
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.inner.local_addr().map_err(Error::Io)
    }

    pub fn set_nonblocking(&self, b: bool) -> Result<()> {
        self.inner.set_nonblocking(b).map_err(Error::Io)
    }

    pub fn accept(&self) -> Result<(Box<dyn Stream>, String)> {
        let (stream, addr) = self.inner.accept().map_err(Error::Io)?;
        Ok((Box::new(stream), addr.to_string()))
    }

    /// Accept with a readiness-gated timeout. `timeout_ms == 0` blocks
    /// until a connection arrives.
    pub fn accept_timeout(&self, timeout_ms: u64) -> Result<(Box<dyn Stream>, String)> {
        if timeout_ms > 0 {
            let mut interests = Interests::new();
            interests.add(self.as_raw_fd(), Direction::Receive)?;
            match interests.wait(Some(Duration::from_millis(timeout_ms)))? {
                Wait::Ready => {}
                Wait::TimedOut | Wait::Interrupted => return Err(Error::Timeout),
            }
        }
        self.accept()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// `ServeConfig` specifies the configuration parameters for [`serve`].
///
/// Examples:
///
/// ```rust
/// let c = filelink::ServeConfig::default();
/// assert_eq!(c.max_clients, 16);
/// assert_eq!(c.idle_timeout, 0);
/// assert!(c.stop_serving.is_none());
/// ```
pub struct ServeConfig {
    /// Maximum number of concurrently served sessions. Connections beyond
    /// it wait in the kernel accept queue until a slot frees up.
    pub max_clients: usize,
    /// Seconds a session may sit between protocol steps before it is
    /// dropped. `0` disables the idle sweep.
    pub idle_timeout: u64,
    /// An optional `AtomicBool` as a global flag, which makes the server
    /// return cleanly after the current iteration when set to `true`.
    pub stop_serving: Option<Arc<AtomicBool>>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            max_clients: 16,
            idle_timeout: 0,
            stop_serving: None,
        }
    }
}

/// Fixed-capacity slot array of live sessions.
struct SessionTable {
    slots: Vec<Option<Session>>,
}

impl SessionTable {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        SessionTable { slots }
    }

    fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn has_capacity(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    fn insert(&mut self, session: Session) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(session);
                return true;
            }
        }
        false
    }

    fn sweep_idle(&mut self, limit: Duration) {
        let now = Instant::now();
        for slot in self.slots.iter_mut() {
            if let Some(session) = slot {
                if now.duration_since(session.last_activity()) > limit {
                    info!(peer = %session.peer(), "dropping idle session");
                    session.close();
                    *slot = None;
                }
            }
        }
    }
}

fn stop_requested(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref()
        .map(|f| f.load(Ordering::SeqCst))
        .unwrap_or(false)
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    let root = root.canonicalize().map_err(Error::Io)?;
    if !root.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            "root is not a directory",
        )));
    }
    Ok(root)
}

/// Serve files from `root` on a single thread, multiplexing up to
/// `config.max_clients` concurrent sessions over one `select` loop.
///
/// Each iteration blocks exactly once, accepts at most one new connection
/// (and only while the session table has a free slot), and advances every
/// ready session by one protocol step. A failing session is dropped
/// without disturbing the others. Returns when `config.stop_serving` is
/// observed set; sessions still in flight are abandoned.
pub fn serve<P: AsRef<Path>>(listener: Listener, root: P, config: &ServeConfig) -> Result<()> {
    if config.max_clients == 0 || config.max_clients + 1 > libc::FD_SETSIZE {
        return Err(Error::CapacityTooLarge(config.max_clients));
    }
    let root = canonical_root(root.as_ref())?;

    // A vanished connection must not stall the loop between select and
    // accept.
    listener.set_nonblocking(true)?;
    let listener_fd = listener.as_raw_fd();

    let mut table = SessionTable::with_capacity(config.max_clients);
    let idle_limit = if config.idle_timeout > 0 {
        Some(Duration::from_secs(config.idle_timeout))
    } else {
        None
    };

    let addr = listener.local_addr()?;
    info!(
        addr = %addr,
        root = %root.display(),
        max_clients = config.max_clients,
        "serving (multiplexed)"
    );

    loop {
        if stop_requested(&config.stop_serving) {
            info!("stop requested, shutting down");
            return Ok(());
        }

        let mut interests = Interests::new();
        if table.has_capacity() {
            interests.add(listener_fd, Direction::Receive)?;
        }
        for slot in table.slots.iter_mut() {
            if let Some(session) = slot {
                if let Some(direction) = session.state().direction() {
                    if let Err(e) = interests.add(session.fd(), direction) {
                        // a descriptor select cannot watch only costs that session
                        warn!(peer = %session.peer(), error = %e, "cannot poll session");
                        session.close();
                        *slot = None;
                    }
                }
            }
        }

        match interests.wait(idle_limit)? {
            Wait::Interrupted => continue,
            Wait::TimedOut => {
                if let Some(limit) = idle_limit {
                    table.sweep_idle(limit);
                }
                continue;
            }
            Wait::Ready => {}
        }

        if interests.read_ready(listener_fd) && table.has_capacity() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, active = table.active() + 1, "new connection");
                    table.insert(Session::new(stream, peer));
                }
                Err(Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }

        for slot in table.slots.iter_mut() {
            if let Some(session) = slot {
                let ready = Readiness {
                    readable: interests.read_ready(session.fd()),
                    writable: interests.write_ready(session.fd()),
                };
                session.advance(ready, &root);
                if session.is_closed() {
                    *slot = None;
                }
            }
        }

        if let Some(limit) = idle_limit {
            table.sweep_idle(limit);
        }
    }
}

/// `PoolConfig` specifies the configuration parameters for [`listen`].
///
/// Examples:
///
/// ```rust
/// let c = filelink::PoolConfig::default();
/// assert_eq!(c.initial_workers, 1);
/// assert_eq!(c.max_workers, 100);
/// assert!(c.stop_serving.is_none());
/// ```
pub struct PoolConfig {
    /// The amount of initial worker threads
    pub initial_workers: usize,
    /// The maximum amount of worker threads
    pub max_workers: usize,
    /// An optional `AtomicBool` as a global flag, which lets the server
    /// stop accepting new connections when set to `true`
    pub stop_serving: Option<Arc<AtomicBool>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_workers: 1,
            max_workers: 100,
            stop_serving: None,
        }
    }
}

/// Serve files from `root` with a pool of worker threads, one blocking
/// session per connection.
///
/// Same wire protocol and the same [`Session`] engine as [`serve`]; only
/// the scheduling differs. Returns when `config.stop_serving` is observed
/// set (checked between accepts at 100 ms granularity); workers finish
/// their current session before the pool joins them.
pub fn listen<P: AsRef<Path>>(listener: Listener, root: P, config: &PoolConfig) -> Result<()> {
    let root = Arc::new(canonical_root(root.as_ref())?);
    let mut pool = ThreadPool::new(config.initial_workers, config.max_workers);

    let addr = listener.local_addr()?;
    info!(addr = %addr, root = %root.display(), "serving (pooled)");

    loop {
        if stop_requested(&config.stop_serving) {
            info!("stop requested, shutting down");
            return Ok(());
        }

        let wait_ms = if config.stop_serving.is_some() { 100 } else { 0 };
        let (stream, peer) = match listener.accept_timeout(wait_ms) {
            Ok(accepted) => accepted,
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        };

        debug!(peer = %peer, "new connection");
        let root = Arc::clone(&root);
        pool.execute(move || {
            let mut session = Session::new(stream, peer);
            session.run_blocking(&root);
        });
    }
}

enum Message {
    NewJob(Job),
    Terminate,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ThreadPool {
    max_workers: usize,
    workers: Vec<Worker>,
    num_busy: Arc<RwLock<usize>>,
    sender: mpsc::Sender<Message>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl ThreadPool {
    /// Create a new ThreadPool.
    ///
    /// The initial_workers is the number of threads in the pool.
    ///
    /// # Panics
    ///
    /// The `new` function will panic if initial_workers is zero.
    fn new(initial_workers: usize, max_workers: usize) -> ThreadPool {
        assert!(initial_workers > 0);

        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(initial_workers);

        let num_busy = Arc::new(RwLock::new(0_usize));

        for _ in 0..initial_workers {
            workers.push(Worker::new(Arc::clone(&receiver), Arc::clone(&num_busy)));
        }

        ThreadPool {
            max_workers,
            workers,
            sender,
            receiver,
            num_busy,
        }
    }

    fn execute<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender.send(Message::NewJob(job)).unwrap();
        if ((self.num_busy() + 1) >= self.workers.len()) && (self.workers.len() <= self.max_workers)
        {
            self.workers.push(Worker::new(
                Arc::clone(&self.receiver),
                Arc::clone(&self.num_busy),
            ));
        }
    }

    fn num_busy(&self) -> usize {
        let num_busy = self.num_busy.read().unwrap();
        *num_busy
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &mut self.workers {
            self.sender.send(Message::Terminate).unwrap();
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                thread.join().unwrap();
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(receiver: Arc<Mutex<mpsc::Receiver<Message>>>, num_busy: Arc<RwLock<usize>>) -> Worker {
        let thread = thread::spawn(move || loop {
            let message = receiver.lock().unwrap().recv().unwrap();

            match message {
                Message::NewJob(job) => {
                    {
                        let mut num_busy = num_busy.write().unwrap();
                        *num_busy += 1;
                    }
                    job();
                    {
                        let mut num_busy = num_busy.write().unwrap();
                        *num_busy -= 1;
                    }
                }
                Message::Terminate => {
                    break;
                }
            }
        });

        Worker {
            thread: Some(thread),
        }
    }
}
