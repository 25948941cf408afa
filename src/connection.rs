use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use log::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::confined::Confined;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket::{self, Socket};

/// Shared reference to a [`TcpConnection`].
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked when a connection is established and again when it goes down;
/// query [`TcpConnection::connected`] to tell the two apart.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked with the input buffer whenever bytes arrive.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
/// Invoked once the output buffer has fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when the output buffer length crosses the high-water mark; the
/// second argument is the queued length.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Lifecycle of a connection. Transitions are one-way, in the order the
/// variants are declared.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::Disconnected,
            _ => unreachable!("bad connection state"),
        }
    }
}

/// State that only the owning loop's thread may touch.
struct LoopSide {
    channel: Option<Rc<Channel>>,
}

/// An established TCP connection bound to one event loop.
///
/// Connections are created by [`TcpServer`] and [`TcpClient`], never
/// directly. The pointer is freely shareable across threads; thread-safe
/// entry points ([`send`], [`shutdown`], [`force_close`]) hop onto the
/// owning loop when called from elsewhere, and everything stateful happens
/// on that loop's thread.
///
/// Ownership: the server (or client) holds the one long-lived strong
/// reference. The connection's channel holds only a weak observer back,
/// upgraded for the duration of each event dispatch, and every callback
/// hop binds a strong clone into the posted closure, so a connection never
/// dies under a running callback.
///
/// [`TcpServer`]: crate::TcpServer
/// [`TcpClient`]: crate::TcpClient
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
/// [`force_close`]: TcpConnection::force_close
pub struct TcpConnection {
    self_weak: OnceLock<Weak<TcpConnection>>,
    loop_handle: LoopHandle,
    name: String,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: AtomicBool,
    high_water_mark: AtomicUsize,
    loop_side: Confined<LoopSide>,
    input_buffer: Confined<Buffer>,
    output_buffer: Confined<Buffer>,
    context: Confined<Option<Box<dyn Any + Send>>>,
    connection_callback: Option<ConnectionCallback>,
    message_callback: Option<MessageCallback>,
    write_complete_callback: Option<WriteCompleteCallback>,
    high_water_mark_callback: Option<HighWaterMarkCallback>,
    close_callback: Option<CloseCallback>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_handle: LoopHandle,
        name: String,
        socket: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnection {
        let socket = Socket::from_owned(socket);
        let _ = socket.set_keep_alive(true);
        let thread = loop_handle.thread();
        debug!("TcpConnection::new [{}] fd={}", name, socket.fd());
        TcpConnection {
            self_weak: OnceLock::new(),
            loop_handle,
            name,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reading: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            loop_side: Confined::new(thread, LoopSide { channel: None }),
            input_buffer: Confined::new(thread, Buffer::new()),
            output_buffer: Confined::new(thread, Buffer::new()),
            context: Confined::new(thread, None),
            connection_callback: None,
            message_callback: None,
            write_complete_callback: None,
            high_water_mark_callback: None,
            close_callback: None,
        }
    }

    /// Finishes construction: wraps the connection in its `Arc` and plants
    /// the self reference the event plumbing hands out.
    pub(crate) fn into_shared(self) -> TcpConnectionPtr {
        let conn = Arc::new(self);
        conn.self_weak
            .set(Arc::downgrade(&conn))
            .expect("connection already shared");
        conn
    }

    /// A fresh strong reference to this connection.
    fn shared(&self) -> TcpConnectionPtr {
        self.self_weak
            .get()
            .expect("connection used before into_shared")
            .upgrade()
            .expect("connection already destroyed")
    }

    pub(crate) fn set_connection_callback(&mut self, callback: Option<ConnectionCallback>) {
        self.connection_callback = callback;
    }

    pub(crate) fn set_message_callback(&mut self, callback: Option<MessageCallback>) {
        self.message_callback = callback;
    }

    pub(crate) fn set_write_complete_callback(&mut self, callback: Option<WriteCompleteCallback>) {
        self.write_complete_callback = callback;
    }

    pub(crate) fn set_high_water_mark_callback(
        &mut self,
        callback: Option<HighWaterMarkCallback>,
        mark: usize,
    ) {
        self.high_water_mark_callback = callback;
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&mut self, callback: CloseCallback) {
        self.close_callback = Some(callback);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The handle of the loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        debug_assert!(state >= self.state());
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stores an arbitrary user payload on the connection. Loop thread only.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.borrow_mut() = Some(context);
    }

    /// Runs `f` with the stored payload downcast to `T`, if both exist.
    /// Loop thread only.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.context
            .borrow_mut()
            .as_mut()
            .and_then(|any| any.downcast_mut::<T>())
            .map(f)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Enabled by default on every new connection.
    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.socket.set_keep_alive(on)
    }

    /// Sends `data`. Callable from any thread: off the loop thread the
    /// bytes are copied and the write is posted to the loop.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.shared();
            let owned = data.to_vec();
            self.loop_handle
                .queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!("[{}] disconnected, give up writing", self.name);
            return;
        }
        let loop_side = self.loop_side.borrow();
        let channel = match loop_side.channel.as_ref() {
            Some(channel) => channel,
            None => {
                warn!("[{}] not established, give up writing", self.name);
                return;
            }
        };
        let mut output = self.output_buffer.borrow_mut();

        let mut written = 0;
        let mut fault = false;
        // Try a direct write when nothing is queued; otherwise the bytes
        // would overtake the buffered ones.
        if !channel.is_writing() && output.readable_bytes() == 0 {
            match socket::write(self.socket.fd(), data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        if let Some(callback) = &self.write_complete_callback {
                            let callback = Arc::clone(callback);
                            let conn = self.shared();
                            self.loop_handle.queue_in_loop(move || callback(&conn));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("[{}] write: {}", self.name, err);
                        if let Some(libc::EPIPE | libc::ECONNRESET) = err.raw_os_error() {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if !fault && remaining > 0 {
            let queued = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if queued + remaining >= mark && queued < mark {
                if let Some(callback) = &self.high_water_mark_callback {
                    let callback = Arc::clone(callback);
                    let conn = self.shared();
                    let length = queued + remaining;
                    self.loop_handle
                        .queue_in_loop(move || callback(&conn, length));
                }
            }
            output.append(&data[written..]);
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    /// Initiates a graceful shutdown: stop writing, half-close once the
    /// output buffer drains, wait for the peer to close.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.shared();
            self.loop_handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        let still_writing = self
            .loop_side
            .borrow()
            .channel
            .as_ref()
            .is_some_and(|channel| channel.is_writing());
        if !still_writing {
            if let Err(err) = self.socket.shutdown_write() {
                error!("[{}] shutdown write: {}", self.name, err);
            }
        }
        // Otherwise handle_write finishes the half-close after the drain.
    }

    /// Closes the connection without waiting for the output buffer.
    pub fn force_close(&self) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            let conn = self.shared();
            self.loop_handle.queue_in_loop(move || {
                let state = conn.state();
                if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
                    conn.handle_close();
                }
            });
        }
    }

    /// Resumes reading after [`stop_read`]. Callable from any thread.
    ///
    /// [`stop_read`]: TcpConnection::stop_read
    pub fn start_read(&self) {
        let conn = self.shared();
        self.loop_handle.run_in_loop(move || {
            conn.loop_handle.assert_in_loop_thread();
            if !conn.reading.load(Ordering::Acquire) {
                if let Some(channel) = conn.loop_side.borrow().channel.as_ref() {
                    channel.enable_reading();
                    conn.reading.store(true, Ordering::Release);
                }
            }
        });
    }

    /// Stops watching for input, leaving received bytes in the kernel as
    /// backpressure. Callable from any thread.
    pub fn stop_read(&self) {
        let conn = self.shared();
        self.loop_handle.run_in_loop(move || {
            conn.loop_handle.assert_in_loop_thread();
            if conn.reading.load(Ordering::Acquire) {
                if let Some(channel) = conn.loop_side.borrow().channel.as_ref() {
                    channel.disable_reading();
                    conn.reading.store(false, Ordering::Release);
                }
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Promotes the freshly accepted connection to `Connected`: wires and
    /// enables the channel and fires the connection callback. Called by
    /// the server or client on the owning loop.
    pub(crate) fn connect_established(&self) {
        self.loop_handle.assert_in_loop_thread();
        assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);

        let event_loop =
            EventLoop::current().expect("connect_established on a thread without an event loop");
        let channel = Channel::new(&event_loop, self.socket.fd());
        let weak = Arc::downgrade(&self.shared());
        channel.set_read_callback({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        });
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        channel.set_error_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }
        });
        channel.tie(Arc::downgrade(
            &(self.shared() as Arc<dyn Any + Send + Sync>),
        ));

        self.loop_side.borrow_mut().channel = Some(Rc::clone(&channel));
        channel.enable_reading();
        self.reading.store(true, Ordering::Release);

        self.invoke_connection_callback();
    }

    /// Final teardown: the last thing that happens to a connection, on its
    /// owning loop. Removes the channel, after which the loop holds no
    /// reference to the connection.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            if let Some(channel) = self.loop_side.borrow().channel.as_ref() {
                channel.disable_all();
            }
            self.invoke_connection_callback();
        }
        // Clearing the slot on the loop thread is part of the Confined
        // teardown protocol.
        if let Some(channel) = self.loop_side.borrow_mut().channel.take() {
            channel.remove();
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.loop_handle.assert_in_loop_thread();
        let mut input = self.input_buffer.borrow_mut();
        match input.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(callback) = &self.message_callback {
                    callback(&self.shared(), &mut input, receive_time);
                }
            }
            Err(err) => {
                drop(input);
                error!("[{}] read: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_handle.assert_in_loop_thread();
        let loop_side = self.loop_side.borrow();
        let channel = match loop_side.channel.as_ref() {
            Some(channel) => channel,
            None => return,
        };
        if !channel.is_writing() {
            trace!("[{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output_buffer.borrow_mut();
        match socket::write(self.socket.fd(), output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    channel.disable_writing();
                    if let Some(callback) = &self.write_complete_callback {
                        let callback = Arc::clone(callback);
                        let conn = self.shared();
                        self.loop_handle.queue_in_loop(move || callback(&conn));
                    }
                    if self.state() == ConnectionState::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("[{}] write: {}", self.name, err);
                }
            }
        }
    }

    fn handle_close(&self) {
        self.loop_handle.assert_in_loop_thread();
        let state = self.state();
        trace!("[{}] handle_close state={:?}", self.name, state);
        assert!(state == ConnectionState::Connected || state == ConnectionState::Disconnecting);
        self.set_state(ConnectionState::Disconnected);
        if let Some(channel) = self.loop_side.borrow().channel.as_ref() {
            channel.disable_all();
        }
        // A strong self-reference rides through the callbacks below, so
        // the connection outlives its own close handling even if they drop
        // the map entry.
        let conn = self.shared();
        self.invoke_connection_callback();
        if let Some(callback) = &self.close_callback {
            callback(&conn);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(self.socket.fd());
        error!(
            "[{}] SO_ERROR={} {}",
            self.name,
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    fn invoke_connection_callback(&self) {
        match &self.connection_callback {
            Some(callback) => callback(&self.shared()),
            None => info!(
                "{} -> {} is {}",
                self.peer_addr,
                self.local_addr,
                if self.connected() { "UP" } else { "DOWN" }
            ),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] state={:?}",
            self.name,
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
