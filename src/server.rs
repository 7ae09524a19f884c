//! The reactor: listen socket, event loop, timer, and the worker-side
//! task protocol.
//!
//! The reactor thread is the only mutator of the multiplexer wait state,
//! the timer, and the connection table. Connection fds are registered
//! oneshot, so at most one worker owns a connection at a time; workers
//! re-arm interest through the shared [`Registry`] when they finish, and
//! hand close decisions back over a channel plus [`Waker`] so that
//! deregistration, socket close, and table removal all happen on the
//! reactor thread.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use socket2::{Domain, Socket, Type};

use crate::epoll::{Epoller, Interest, Registry, Waker};
use crate::http::HttpConn;
use crate::logger::{LogConfig, Logger};
use crate::pool::{ConnPool, MemoryStore, ThreadPool, UserPool};
use crate::timer::HeapTimer;

/// Fd cap: accepts beyond this many live clients are turned away.
const MAX_FD: usize = 65536;

/// Which side(s) of the server run edge-triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Listen and connection fds level-triggered.
    Level,
    /// Connection fds edge-triggered.
    EdgeConn,
    /// Listen fd edge-triggered.
    EdgeListen,
    /// Both edge-triggered.
    EdgeBoth,
}

impl TriggerMode {
    /// Numeric config surface: 0 level, 1 edge connections, 2 edge
    /// listener, 3 (or anything else) edge both.
    pub fn from_mode(mode: u8) -> TriggerMode {
        match mode {
            0 => TriggerMode::Level,
            1 => TriggerMode::EdgeConn,
            2 => TriggerMode::EdgeListen,
            _ => TriggerMode::EdgeBoth,
        }
    }
}

/// Server construction parameters.
#[derive(Debug)]
pub struct Config {
    /// TCP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Edge/level triggering for the listen and connection fds.
    pub trigger: TriggerMode,
    /// Idle deadline per connection; `None` disables the timer.
    pub timeout: Option<Duration>,
    /// Accepted for config-surface parity; `SO_LINGER` tuning is left to
    /// the platform layer and this flag is not applied.
    pub linger: bool,
    /// Worker threads handling reads, parsing, and writes.
    pub worker_threads: usize,
    /// User-store handles in the checkout pool.
    pub user_pool_size: usize,
    /// Static asset root; defaults to `{cwd}/resources`.
    pub src_dir: Option<PathBuf>,
    /// Logger setup; `None` leaves logging uninstalled.
    pub log: Option<LogConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 1316,
            trigger: TriggerMode::EdgeBoth,
            timeout: Some(Duration::from_secs(60)),
            linger: false,
            worker_threads: 6,
            user_pool_size: 8,
            src_dir: None,
            log: Some(LogConfig::default()),
        }
    }
}

/// Typed timer payload; the reactor runs the effect itself when an entry
/// fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    IdleTimeout,
}

/// Everything a worker task needs besides its connection.
#[derive(Debug)]
struct WorkerShared {
    registry: Arc<Registry>,
    conn_interest: Interest,
    close_tx: Sender<RawFd>,
    waker: Arc<Waker>,
}

impl WorkerShared {
    /// Asks the reactor to shut `fd` down; never touches the table or
    /// timer from the worker side.
    fn request_close(&self, fd: RawFd) {
        let _ = self.close_tx.send(fd);
        let _ = self.waker.wake();
    }

    fn rearm(&self, fd: RawFd, next: Interest) -> bool {
        self.registry.modify(fd, self.conn_interest | next).is_ok()
    }
}

/// External stop/observe handle for a running server.
#[derive(Debug, Clone)]
pub struct Handle {
    closed: Arc<AtomicBool>,
    waker: Arc<Waker>,
    user_count: Arc<AtomicUsize>,
}

impl Handle {
    /// Flips the close flag and wakes the reactor; the loop stops after
    /// the current iteration.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }

    /// Number of currently connected clients.
    pub fn active_users(&self) -> usize {
        self.user_count.load(Ordering::Relaxed)
    }
}

/// Single-reactor, multi-worker HTTP/1.1 server.
#[derive(Debug)]
pub struct WebServer {
    listener: TcpListener,
    listen_fd: RawFd,
    listen_interest: Interest,
    edge_conns: bool,
    timeout: Option<Duration>,
    epoller: Epoller,
    timer: HeapTimer<Expiry>,
    workers: ThreadPool,
    conns: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    shared: Arc<WorkerShared>,
    close_rx: Receiver<RawFd>,
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
    user_count: Arc<AtomicUsize>,
    users: Arc<UserPool>,
    src_dir: Arc<PathBuf>,
    logger: Option<Arc<Logger>>,
}

impl WebServer {
    /// Binds the listen socket and assembles reactor state. An error here
    /// is a configuration failure; the server never enters its loop.
    pub fn new(config: Config) -> io::Result<WebServer> {
        let logger = match &config.log {
            Some(log_config) => Some(Logger::new(log_config)?.install()),
            None => None,
        };

        let src_dir = match config.src_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?.join("resources"),
        };
        let (listen_interest, conn_interest) = interest_sets(config.trigger);

        let listener = match bind_listener(config.port) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind port {}: {e}", config.port);
                return Err(e);
            }
        };
        let listen_fd = listener.as_raw_fd();

        let epoller = Epoller::new(1024)?;
        let registry = epoller.registry();
        registry.add(listen_fd, listen_interest | Interest::READABLE)?;
        let waker = Arc::new(Waker::new(&registry)?);

        let (close_tx, close_rx) = unbounded();
        let shared = Arc::new(WorkerShared {
            registry,
            conn_interest,
            close_tx,
            waker: Arc::clone(&waker),
        });

        let server = WebServer {
            listen_fd,
            listen_interest,
            edge_conns: conn_interest.contains(Interest::EDGE_TRIGGERED),
            timeout: config.timeout,
            timer: HeapTimer::new(),
            workers: ThreadPool::new(config.worker_threads),
            conns: HashMap::new(),
            shared,
            close_rx,
            waker,
            closed: Arc::new(AtomicBool::new(false)),
            user_count: Arc::new(AtomicUsize::new(0)),
            users: Arc::new(ConnPool::new(MemoryStore::shared(config.user_pool_size))),
            src_dir: Arc::new(src_dir),
            logger,
            listener,
            epoller,
        };

        info!("========== server init ==========");
        info!(
            "port: {}, listen mode: {}, conn mode: {}",
            server.listener.local_addr().map(|a| a.port()).unwrap_or(config.port),
            trigger_name(server.listen_interest),
            trigger_name(server.shared.conn_interest),
        );
        info!("src dir: {}", server.src_dir.display());
        info!(
            "user pool: {}, worker threads: {}",
            config.user_pool_size,
            config.worker_threads.max(1)
        );
        Ok(server)
    }

    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A cloneable stop/observe handle.
    pub fn handle(&self) -> Handle {
        Handle {
            closed: Arc::clone(&self.closed),
            waker: Arc::clone(&self.waker),
            user_count: Arc::clone(&self.user_count),
        }
    }

    /// Runs the reactor loop until the close flag flips.
    pub fn run(&mut self) {
        info!("========== server start ==========");
        while !self.closed.load(Ordering::Relaxed) {
            let mut wait_timeout = None;
            if self.timeout.is_some() {
                for (fd, Expiry::IdleTimeout) in self.timer.pop_expired() {
                    debug!("client[{fd}] idle timeout");
                    self.shutdown_conn(fd);
                }
                wait_timeout = self.timer.next_timeout();
            }
            let ready_count = match self.epoller.wait(wait_timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!("multiplexer wait failed: {e}");
                    break;
                }
            };
            for i in 0..ready_count {
                let fd = self.epoller.event_fd(i);
                let ready = self.epoller.event_ready(i);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.waker.fd() {
                    self.waker.drain();
                    while let Ok(fd) = self.close_rx.try_recv() {
                        self.shutdown_conn(fd);
                    }
                } else if ready.contains(Interest::HANGUP | Interest::PEER_HANGUP | Interest::ERROR)
                {
                    self.shutdown_conn(fd);
                } else if ready.contains(Interest::READABLE) {
                    self.deal_read(fd);
                } else if ready.contains(Interest::WRITABLE) {
                    self.deal_write(fd);
                } else {
                    error!("unexpected event mask on fd {fd}");
                }
            }
        }
        info!("========== server stop ==========");
    }

    /// Accept burst: always at least one accept, and under an
    /// edge-triggered listener keep going until the socket would block.
    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.user_count.load(Ordering::Relaxed) >= MAX_FD {
                        warn!("clients full, rejecting {peer}");
                        send_busy(stream);
                    } else if let Err(e) = self.add_client(stream, peer) {
                        warn!("failed to register client {peer}: {e}");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
            if !self.listen_interest.contains(Interest::EDGE_TRIGGERED) {
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let conn = HttpConn::new(
            stream,
            peer,
            self.edge_conns,
            Arc::clone(&self.src_dir),
            Arc::clone(&self.users),
            Arc::clone(&self.user_count),
        );
        self.conns.insert(fd, Arc::new(Mutex::new(conn)));
        if let Some(timeout) = self.timeout {
            self.timer.add(fd, timeout, Expiry::IdleTimeout);
        }
        if let Err(e) = self
            .shared
            .registry
            .add(fd, self.shared.conn_interest | Interest::READABLE)
        {
            self.timer.take(fd);
            self.conns.remove(&fd);
            return Err(e);
        }
        Ok(())
    }

    /// Central close path: drop the timer entry, deregister, close the
    /// socket, forget the connection. Only ever runs on the reactor
    /// thread.
    fn shutdown_conn(&mut self, fd: RawFd) {
        self.timer.take(fd);
        if let Some(conn) = self.conns.remove(&fd) {
            let _ = self.shared.registry.delete(fd);
            conn.lock().unwrap().close();
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(&fd) else {
            return;
        };
        let conn = Arc::clone(conn);
        let shared = Arc::clone(&self.shared);
        self.extend_time(fd);
        self.workers.execute(move || on_read(&conn, &shared));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(&fd) else {
            return;
        };
        let conn = Arc::clone(conn);
        let shared = Arc::clone(&self.shared);
        self.extend_time(fd);
        self.workers.execute(move || on_write(&conn, &shared));
    }

    /// Activity pushes the idle deadline out again.
    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        self.workers.join();
        for (_, conn) in self.conns.drain() {
            conn.lock().unwrap().close();
        }
        info!("server shut down");
        if let Some(logger) = &self.logger {
            logger.shutdown();
        }
    }
}

/// Worker task for a READABLE event: drain the socket, run the parser,
/// and re-arm for the next phase.
fn on_read(conn: &Mutex<HttpConn>, shared: &WorkerShared) {
    let mut conn = conn.lock().unwrap();
    if conn.is_closed() {
        return;
    }
    let fd = conn.fd();
    match conn.read() {
        Ok(0) => return shared.request_close(fd),
        Err(e) if e.kind() != ErrorKind::WouldBlock => {
            debug!("client[{fd}] read error: {e}");
            return shared.request_close(fd);
        }
        _ => {}
    }
    let next = if conn.process() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if !shared.rearm(fd, next) {
        shared.request_close(fd);
    }
}

/// Worker task for a WRITABLE event: flush, then either re-arm for the
/// next request (keep-alive), keep writing, or ask for a close.
fn on_write(conn: &Mutex<HttpConn>, shared: &WorkerShared) {
    let mut conn = conn.lock().unwrap();
    if conn.is_closed() {
        return;
    }
    let fd = conn.fd();
    match conn.write() {
        Ok(_) => {
            if conn.to_write() == 0 {
                if conn.is_keep_alive() {
                    if !shared.rearm(fd, Interest::READABLE) {
                        shared.request_close(fd);
                    }
                } else {
                    shared.request_close(fd);
                }
            } else if !shared.rearm(fd, Interest::WRITABLE) {
                shared.request_close(fd);
            }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            if !shared.rearm(fd, Interest::WRITABLE) {
                shared.request_close(fd);
            }
        }
        Err(e) => {
            debug!("client[{fd}] write error: {e}");
            shared.request_close(fd);
        }
    }
}

/// `SO_REUSEADDR`, system-max backlog, non-blocking.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Overloaded-server reply written straight to the rejected socket.
fn send_busy(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(b"Server busy!") {
        warn!("failed to send busy notice: {e}");
    }
}

fn interest_sets(trigger: TriggerMode) -> (Interest, Interest) {
    let mut listen = Interest::PEER_HANGUP;
    let mut conn = Interest::ONESHOT | Interest::PEER_HANGUP;
    match trigger {
        TriggerMode::Level => {}
        TriggerMode::EdgeConn => conn |= Interest::EDGE_TRIGGERED,
        TriggerMode::EdgeListen => listen |= Interest::EDGE_TRIGGERED,
        TriggerMode::EdgeBoth => {
            listen |= Interest::EDGE_TRIGGERED;
            conn |= Interest::EDGE_TRIGGERED;
        }
    }
    (listen, conn)
}

fn trigger_name(interest: Interest) -> &'static str {
    if interest.contains(Interest::EDGE_TRIGGERED) {
        "ET"
    } else {
        "LT"
    }
}
