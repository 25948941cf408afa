use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::ptr;
use std::rc::{Rc, Weak};

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::{self, Socket};

type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddr)>;

/// Accepts connections on a listening socket and hands the raw sockets up.
///
/// Lives entirely on its loop's thread; [`TcpServer`] owns one on the base
/// loop. The listening socket is bound at construction, so `bind` errors
/// surface early and a port of 0 can be resolved through [`local_addr`]
/// before [`listen`] is called.
///
/// [`TcpServer`]: crate::TcpServer
/// [`local_addr`]: Acceptor::local_addr
/// [`listen`]: Acceptor::listen
pub struct Acceptor {
    core: Rc<AcceptorCore>,
}

struct AcceptorCore {
    event_loop: EventLoop,
    socket: Socket,
    local_addr: SocketAddr,
    channel: Rc<Channel>,
    listening: Cell<bool>,
    /// Spare descriptor for EMFILE recovery; see `drain_with_idle_fd`.
    idle_fd: RefCell<Option<OwnedFd>>,
    on_new_connection: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Acceptor> {
        let socket = Socket::new_nonblocking(&listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&listen_addr)?;
        let local_addr = socket.local_addr()?;
        let idle_fd = socket::open_idle_fd()?;
        let channel = Channel::new(event_loop, socket.fd());
        trace!(
            "Acceptor fd={} listening on {}, idle fd={:?}",
            socket.fd(),
            local_addr,
            idle_fd
        );

        let core = Rc::new(AcceptorCore {
            event_loop: event_loop.clone(),
            socket,
            local_addr,
            channel,
            listening: Cell::new(false),
            idle_fd: RefCell::new(Some(idle_fd)),
            on_new_connection: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        core.channel
            .set_read_callback(move |_| AcceptorCore::handle_read(&weak));
        Ok(Acceptor { core })
    }

    /// The bound address, with any requested port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn listening(&self) -> bool {
        self.core.listening.get()
    }

    /// Receives every accepted socket along with its peer address.
    pub fn set_new_connection_callback(
        &self,
        callback: impl FnMut(OwnedFd, SocketAddr) + 'static,
    ) {
        *self.core.on_new_connection.borrow_mut() = Some(Box::new(callback));
    }

    /// Starts listening and watching for incoming connections.
    pub fn listen(&self) -> io::Result<()> {
        self.core.event_loop.assert_in_loop_thread();
        self.core.listening.set(true);
        self.core.socket.listen()?;
        self.core.channel.enable_reading();
        Ok(())
    }
}

impl AcceptorCore {
    fn handle_read(weak: &Weak<AcceptorCore>) {
        let core = match weak.upgrade() {
            Some(core) => core,
            None => return,
        };
        core.event_loop.assert_in_loop_thread();
        // One accept per readable event; level triggering redelivers the
        // event while the backlog is non-empty.
        match core.socket.accept() {
            Ok((socket, peer_addr)) => {
                trace!("accepted connection from {}", peer_addr);
                match core.on_new_connection.borrow_mut().as_mut() {
                    Some(callback) => callback(socket, peer_addr),
                    None => drop(socket),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("Acceptor accept: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    core.drain_with_idle_fd();
                }
            }
        }
    }

    /// The process is out of descriptors, so the pending connection can
    /// never be accepted and the listening socket stays readable forever,
    /// spinning the loop. Free the spare descriptor, claim the connection,
    /// close it, then re-open the spare.
    fn drain_with_idle_fd(&self) {
        let mut slot = self.idle_fd.borrow_mut();
        slot.take();
        if let Ok(connection) = syscall!(accept(
            self.socket.fd(),
            ptr::null_mut(),
            ptr::null_mut()
        )) {
            let _ = syscall!(close(connection));
        }
        match socket::open_idle_fd() {
            Ok(idle) => *slot = Some(idle),
            Err(err) => error!("re-opening idle fd: {}", err),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.core.channel.disable_all();
        self.core.channel.remove();
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Acceptor")
            .field("addr", &self.core.local_addr)
            .field("listening", &self.core.listening.get())
            .finish()
    }
}
