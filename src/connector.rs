use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info, trace, warn};

use crate::channel::Channel;
use crate::confined::Confined;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::socket::{self, Socket};
use crate::timer::TimerId;

type ConnectedCallback = Box<dyn Fn(OwnedFd) + Send + Sync>;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Non-blocking connect state machine.
///
/// Starts a connect, waits for writability, checks `SO_ERROR` and the
/// self-connect corner case, and hands the ready socket to the owner.
/// Refused and unreachable connects retry on a loop timer with a doubling
/// delay, half a second up to thirty seconds. Used by [`TcpClient`].
///
/// [`TcpClient`]: crate::TcpClient
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    loop_handle: LoopHandle,
    server_addr: SocketAddr,
    /// User intent: true between start and stop.
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    attempt: Confined<Attempt>,
    on_connected: ConnectedCallback,
}

/// In-flight connect attempt, loop thread only.
struct Attempt {
    socket: Option<Socket>,
    channel: Option<Rc<Channel>>,
    retry_timer: Option<TimerId>,
}

impl Connector {
    /// Creates a connector targeting `server_addr`; the ready socket is
    /// handed to `on_connected` on the loop thread.
    pub fn new(
        loop_handle: LoopHandle,
        server_addr: SocketAddr,
        on_connected: impl Fn(OwnedFd) + Send + Sync + 'static,
    ) -> Connector {
        let on_connected: ConnectedCallback = Box::new(on_connected);
        let thread = loop_handle.thread();
        Connector {
            inner: Arc::new(ConnectorInner {
                loop_handle,
                server_addr,
                connect: AtomicBool::new(false),
                state: AtomicU8::new(ConnectorState::Disconnected as u8),
                retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
                attempt: Confined::new(
                    thread,
                    Attempt {
                        socket: None,
                        channel: None,
                        retry_timer: None,
                    },
                ),
                on_connected,
            }),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Begins connecting. Callable from any thread.
    pub fn start(&self) {
        self.inner.connect.store(true, Ordering::Release);
        let weak = Arc::downgrade(&self.inner);
        self.inner.loop_handle.run_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                ConnectorInner::start_in_loop(&inner);
            }
        });
    }

    /// Abandons the in-flight attempt and cancels any scheduled retry.
    /// Callable from any thread.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        let weak = Arc::downgrade(&self.inner);
        self.inner.loop_handle.queue_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                ConnectorInner::stop_in_loop(&inner);
            }
        });
    }

    /// Resets the backoff and reconnects. Loop thread only.
    pub(crate) fn restart(&self) {
        self.inner.loop_handle.assert_in_loop_thread();
        self.inner.set_state(ConnectorState::Disconnected);
        self.inner
            .retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Relaxed);
        self.inner.connect.store(true, Ordering::Release);
        ConnectorInner::start_in_loop(&self.inner);
    }
}

impl ConnectorInner {
    fn state(&self) -> ConnectorState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectorState::Disconnected,
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => unreachable!("bad connector state"),
        }
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(this: &Arc<ConnectorInner>) {
        this.loop_handle.assert_in_loop_thread();
        assert_eq!(this.state(), ConnectorState::Disconnected);
        if !this.connect.load(Ordering::Acquire) {
            trace!("connector to {} is stopped", this.server_addr);
            return;
        }
        let socket = match Socket::new_nonblocking(&this.server_addr) {
            Ok(socket) => socket,
            Err(err) => {
                error!("connector socket: {}", err);
                return;
            }
        };
        match socket::start_connect(&socket, &this.server_addr) {
            Ok(()) => ConnectorInner::connecting(this, socket),
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => {
                    ConnectorInner::connecting(this, socket);
                }
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH,
                ) => ConnectorInner::retry(this, socket),
                _ => {
                    error!("connect to {}: {}", this.server_addr, err);
                }
            },
        }
    }

    fn stop_in_loop(this: &Arc<ConnectorInner>) {
        this.loop_handle.assert_in_loop_thread();
        if let Some(timer) = this.attempt.borrow_mut().retry_timer.take() {
            this.loop_handle.cancel(timer);
        }
        if this.state() == ConnectorState::Connecting {
            this.set_state(ConnectorState::Disconnected);
            if let Some(socket) = this.take_attempt() {
                ConnectorInner::retry(this, socket);
            }
        }
    }

    /// Watches the socket for writability, which signals the verdict of a
    /// non-blocking connect.
    fn connecting(this: &Arc<ConnectorInner>, socket: Socket) {
        this.set_state(ConnectorState::Connecting);
        let event_loop = EventLoop::current().expect("connector running outside its loop thread");
        let channel = Channel::new(&event_loop, socket.fd());
        let weak = Arc::downgrade(this);
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    ConnectorInner::handle_write(&inner);
                }
            }
        });
        channel.set_error_callback(move || {
            if let Some(inner) = weak.upgrade() {
                ConnectorInner::handle_error(&inner);
            }
        });
        let mut attempt = this.attempt.borrow_mut();
        attempt.socket = Some(socket);
        attempt.channel = Some(Rc::clone(&channel));
        drop(attempt);
        channel.enable_writing();
    }

    /// Detaches the channel and returns the socket of the current attempt.
    fn take_attempt(&self) -> Option<Socket> {
        let mut attempt = self.attempt.borrow_mut();
        if let Some(channel) = attempt.channel.take() {
            channel.disable_all();
            channel.remove();
        }
        attempt.socket.take()
    }

    fn handle_write(this: &Arc<ConnectorInner>) {
        trace!("connector handle_write state={:?}", this.state());
        if this.state() != ConnectorState::Connecting {
            return;
        }
        let socket = match this.take_attempt() {
            Some(socket) => socket,
            None => return,
        };
        let err = socket::socket_error(socket.fd());
        if err != 0 {
            warn!(
                "connect to {}: SO_ERROR={} {}",
                this.server_addr,
                err,
                std::io::Error::from_raw_os_error(err)
            );
            ConnectorInner::retry(this, socket);
        } else if socket::is_self_connect(socket.fd()) {
            warn!("connect to {}: self connect", this.server_addr);
            ConnectorInner::retry(this, socket);
        } else {
            this.set_state(ConnectorState::Connected);
            if this.connect.load(Ordering::Acquire) {
                (this.on_connected)(socket.into_owned());
            }
            // Otherwise the attempt was stopped while connecting; the
            // socket closes on drop.
        }
    }

    fn handle_error(this: &Arc<ConnectorInner>) {
        if this.state() == ConnectorState::Connecting {
            if let Some(socket) = this.take_attempt() {
                let err = socket::socket_error(socket.fd());
                error!(
                    "connector to {}: SO_ERROR={} {}",
                    this.server_addr,
                    err,
                    std::io::Error::from_raw_os_error(err)
                );
                ConnectorInner::retry(this, socket);
            }
        }
    }

    /// Closes the failed socket and schedules another attempt with a
    /// doubled delay.
    fn retry(this: &Arc<ConnectorInner>, socket: Socket) {
        drop(socket);
        this.set_state(ConnectorState::Disconnected);
        if !this.connect.load(Ordering::Acquire) {
            trace!("connector to {} stopped during retry", this.server_addr);
            return;
        }
        let delay = Duration::from_millis(this.retry_delay_ms.load(Ordering::Relaxed));
        info!("connector retrying {} in {:?}", this.server_addr, delay);
        let next = (delay * 2).min(MAX_RETRY_DELAY);
        this.retry_delay_ms
            .store(next.as_millis() as u64, Ordering::Relaxed);
        let weak: Weak<ConnectorInner> = Arc::downgrade(this);
        let timer = this.loop_handle.run_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.attempt.borrow_mut().retry_timer = None;
                if inner.state() == ConnectorState::Disconnected {
                    ConnectorInner::start_in_loop(&inner);
                }
            }
        });
        this.attempt.borrow_mut().retry_timer = Some(timer);
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Connector")
            .field("server_addr", &self.inner.server_addr)
            .field("state", &self.inner.state())
            .finish()
    }
}
