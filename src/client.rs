use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, info};

use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket;

#[derive(Default)]
struct ClientCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

/// A non-blocking TCP client.
///
/// Drives a [`Connector`] on its loop and owns at most one live
/// [`TcpConnection`] at a time. With [`enable_retry`] set, losing the
/// connection starts a fresh connect with the backoff reset.
///
/// # Examples
///
/// ```no_run
/// use muxio::{EventLoop, TcpClient};
///
/// let event_loop = EventLoop::new().unwrap();
/// let addr = "127.0.0.1:2007".parse().unwrap();
/// let client = TcpClient::new(&event_loop, addr, "echo-client");
/// client.set_message_callback(|_conn, buf, _when| {
///     println!("{:?}", buf.retrieve_all_as_bytes());
/// });
/// client.connect();
/// event_loop.run();
/// ```
///
/// [`enable_retry`]: TcpClient::enable_retry
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    loop_handle: LoopHandle,
    name: String,
    connector: Connector,
    connection: Mutex<Option<TcpConnectionPtr>>,
    callbacks: Mutex<ClientCallbacks>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
}

impl TcpClient {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr, name: &str) -> TcpClient {
        let loop_handle = event_loop.handle();
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let on_connected = {
                let weak = weak.clone();
                move |socket: OwnedFd| {
                    if let Some(client) = weak.upgrade() {
                        ClientInner::new_connection(&client, socket);
                    }
                }
            };
            ClientInner {
                loop_handle: loop_handle.clone(),
                name: name.to_string(),
                connector: Connector::new(loop_handle, server_addr, on_connected),
                connection: Mutex::new(None),
                callbacks: Mutex::new(ClientCallbacks::default()),
                retry: AtomicBool::new(false),
                connect: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
            }
        });
        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.connector.server_addr()
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.inner.connection.lock().unwrap().clone()
    }

    /// Reconnect automatically after the connection goes down.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
    }

    pub fn retrying(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(callback));
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().message = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    /// Starts connecting. Callable from any thread.
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.inner.name,
            self.server_addr()
        );
        self.inner.connect.store(true, Ordering::Release);
        self.inner.connector.start();
    }

    /// Gracefully shuts down the current connection, if any.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(conn) = self.inner.connection.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Abandons an in-flight connect attempt.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector.stop();
    }
}

impl ClientInner {
    /// Runs on the client's loop when the connector produces a socket.
    fn new_connection(this: &Arc<ClientInner>, socket: OwnedFd) {
        this.loop_handle.assert_in_loop_thread();
        let peer_addr = match socket::peer_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("[{}] getpeername: {}", this.name, err);
                return;
            }
        };
        let local_addr = match socket::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("[{}] getsockname: {}", this.name, err);
                return;
            }
        };
        let id = this.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", this.name, peer_addr, id);

        let callbacks = this.callbacks.lock().unwrap();
        let mut connection = TcpConnection::new(
            this.loop_handle.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );
        connection.set_connection_callback(callbacks.connection.clone());
        connection.set_message_callback(callbacks.message.clone());
        connection.set_write_complete_callback(callbacks.write_complete.clone());
        drop(callbacks);
        let weak: Weak<ClientInner> = Arc::downgrade(this);
        connection.set_close_callback(Arc::new(move |conn| match weak.upgrade() {
            Some(client) => ClientInner::remove_connection(&client, conn),
            // The client is gone; fall back to a bare teardown.
            None => {
                let conn = Arc::clone(conn);
                let handle = conn.loop_handle().clone();
                handle.queue_in_loop(move || conn.connect_destroyed());
            }
        }));

        let connection = connection.into_shared();
        *this.connection.lock().unwrap() = Some(Arc::clone(&connection));
        connection.connect_established();
    }

    fn remove_connection(this: &Arc<ClientInner>, conn: &TcpConnectionPtr) {
        this.loop_handle.assert_in_loop_thread();
        *this.connection.lock().unwrap() = None;
        let teardown = Arc::clone(conn);
        this.loop_handle
            .queue_in_loop(move || teardown.connect_destroyed());

        if this.retry.load(Ordering::Acquire) && this.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                this.name,
                this.connector.server_addr()
            );
            this.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.inner.connector.stop();
        // A live connection outlasts the client; its close callback falls
        // back to plain teardown once the weak reference dies.
        let conn = self.inner.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.force_close();
        }
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpClient")
            .field("name", &self.inner.name)
            .field("server_addr", &self.inner.connector.server_addr())
            .finish()
    }
}
