use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{error, info, trace};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::confined::Confined;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::sys::socket;

/// Construction-time options for a [`TcpServer`].
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Sets `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// Number of I/O loop threads; 0 runs everything on the base loop.
    pub threads: usize,
    /// Default output-buffer high-water mark for new connections, in bytes.
    pub high_water_mark: usize,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            reuse_port: false,
            threads: 0,
            high_water_mark: 64 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    thread_init: Option<ThreadInitCallback>,
}

/// A non-blocking TCP server.
///
/// Owns an [`Acceptor`] on the loop it was created on (the base loop) and
/// a pool of I/O loops. Each accepted connection is assigned an I/O loop
/// round-robin and lives there for its whole life; the name-to-connection
/// map stays on the base loop thread.
///
/// Set the callbacks before [`start`]. Dropping the server posts a
/// teardown to every live connection; the base loop must keep running for
/// those to complete.
///
/// # Examples
///
/// ```no_run
/// use muxio::{EventLoop, ServerOptions, TcpServer};
///
/// let event_loop = EventLoop::new().unwrap();
/// let addr = "127.0.0.1:2007".parse().unwrap();
/// let server = TcpServer::new(&event_loop, addr, "echo", ServerOptions::default()).unwrap();
/// server.set_message_callback(|conn, buf, _when| {
///     let bytes = buf.retrieve_all_as_bytes();
///     conn.send(&bytes);
/// });
/// server.start();
/// event_loop.run();
/// ```
///
/// [`start`]: TcpServer::start
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base: LoopHandle,
    name: String,
    ip_port: String,
    local_addr: SocketAddr,
    options: ServerOptions,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    acceptor: Confined<Acceptor>,
    pool: Confined<EventLoopThreadPool>,
    connections: Confined<HashMap<String, TcpConnectionPtr>>,
    callbacks: Confined<ServerCallbacks>,
}

impl TcpServer {
    /// Creates a server listening on `listen_addr`; `event_loop` becomes
    /// the base loop. The socket is bound here, so a port of 0 is already
    /// resolved in [`local_addr`] when this returns.
    ///
    /// [`local_addr`]: TcpServer::local_addr
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: &str,
        options: ServerOptions,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(event_loop, listen_addr, options.reuse_port)?;
        let local_addr = acceptor.local_addr();
        let base = event_loop.handle();
        let thread = base.thread();
        let pool = EventLoopThreadPool::new(base.clone(), name.to_string());

        let inner = Arc::new(ServerInner {
            base,
            name: name.to_string(),
            ip_port: local_addr.to_string(),
            local_addr,
            options,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            acceptor: Confined::new(thread, acceptor),
            pool: Confined::new(thread, pool),
            connections: Confined::new(thread, HashMap::new()),
            callbacks: Confined::new(thread, ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .borrow()
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    ServerInner::new_connection(&server, socket, peer_addr);
                }
            });
        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The base loop's handle.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.inner.base
    }

    /// Invoked on connection establishment and teardown. Set before
    /// [`start`]; base loop thread only.
    ///
    /// [`start`]: TcpServer::start
    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.borrow_mut().connection = Some(Arc::new(callback));
    }

    /// Invoked when bytes arrive on any connection.
    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.borrow_mut().message = Some(Arc::new(callback));
    }

    /// Invoked when a connection's output buffer fully drains.
    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.borrow_mut().write_complete = Some(Arc::new(callback));
    }

    /// Invoked when a connection's queued output crosses the configured
    /// high-water mark; use it to apply backpressure.
    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.borrow_mut().high_water_mark = Some(Arc::new(callback));
    }

    /// Invoked once in every I/O loop thread before it starts looping.
    pub fn set_thread_init_callback(
        &self,
        callback: impl Fn(&EventLoop) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.borrow_mut().thread_init = Some(Arc::new(callback));
    }

    /// Spawns the I/O loops and starts listening. Idempotent; call on the
    /// base loop thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let thread_init = self.inner.callbacks.borrow().thread_init.clone();
        {
            let mut pool = self.inner.pool.borrow_mut();
            pool.set_thread_num(self.inner.options.threads);
            pool.start(thread_init);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.base.run_in_loop(move || {
            inner
                .acceptor
                .borrow()
                .listen()
                .expect("failed to listen on server socket");
        });
        info!(
            "TcpServer [{}] listening on {}",
            self.inner.name, self.inner.ip_port
        );
    }

    /// Number of live connections. Base loop thread only.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }
}

impl ServerInner {
    /// Runs on the base loop whenever the acceptor produces a socket.
    fn new_connection(this: &Arc<ServerInner>, socket: OwnedFd, peer_addr: SocketAddr) {
        this.base.assert_in_loop_thread();
        let io_loop = this.pool.borrow_mut().get_next_loop();
        let id = this.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", this.name, this.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            this.name, conn_name, peer_addr
        );

        let local_addr = match socket::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname for [{}]: {}", conn_name, err);
                return;
            }
        };

        let callbacks = this.callbacks.borrow();
        let mut connection =
            TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        connection.set_connection_callback(callbacks.connection.clone());
        connection.set_message_callback(callbacks.message.clone());
        connection.set_write_complete_callback(callbacks.write_complete.clone());
        connection
            .set_high_water_mark_callback(callbacks.high_water_mark.clone(), this.options.high_water_mark);
        let weak: Weak<ServerInner> = Arc::downgrade(this);
        connection.set_close_callback(Arc::new(move |conn| match weak.upgrade() {
            Some(server) => ServerInner::remove_connection(&server, conn),
            // The server is gone; fall back to a bare teardown.
            None => {
                let conn = Arc::clone(conn);
                let handle = conn.loop_handle().clone();
                handle.queue_in_loop(move || conn.connect_destroyed());
            }
        }));
        drop(callbacks);

        let connection = connection.into_shared();
        this.connections
            .borrow_mut()
            .insert(conn_name, Arc::clone(&connection));
        io_loop.run_in_loop(move || connection.connect_established());
    }

    /// Wired as every connection's close callback; may fire on any I/O
    /// loop, so hop to the base loop where the map lives. The posted task
    /// holds the server only weakly: a task stranded in a dying loop's
    /// queue must not move the server's destruction to a foreign thread.
    fn remove_connection(this: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let weak = Arc::downgrade(this);
        let conn = Arc::clone(conn);
        this.base.run_in_loop(move || match weak.upgrade() {
            Some(server) => ServerInner::remove_connection_in_loop(&server, &conn),
            None => {
                // The server won the race and already tore the map down;
                // connect_destroyed is idempotent.
                let handle = conn.loop_handle().clone();
                handle.queue_in_loop(move || conn.connect_destroyed());
            }
        });
    }

    fn remove_connection_in_loop(this: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        this.base.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            this.name,
            conn.name()
        );
        let removed = this.connections.borrow_mut().remove(conn.name());
        assert!(removed.is_some());
        let conn = Arc::clone(conn);
        let io_loop = conn.loop_handle().clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.base.assert_in_loop_thread();
        trace!("TcpServer [{}] destructing", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let io_loop = conn.loop_handle().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
        // The pool is dropped afterwards, which quits and joins the I/O
        // loops; their final iteration runs the teardowns queued above.
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpServer")
            .field("name", &self.inner.name)
            .field("addr", &self.inner.local_addr)
            .finish()
    }
}
