//! Event-driven non-blocking TCP networking built on a per-thread reactor.
//!
//! Each thread runs at most one [`EventLoop`], which multiplexes all of its
//! descriptors through one kernel poller (epoll by default, poll(2) via the
//! `MUXIO_USE_POLL` environment variable), fires timers off a `timerfd`,
//! and executes closures posted from other threads after an eventfd wakeup.
//! A [`TcpServer`] accepts on its base loop and deals connections out to a
//! pool of I/O loops round-robin; every [`TcpConnection`] then lives its
//! whole life on one loop, so per-connection callbacks never race.
//!
//! Threading rules, in short:
//!
//! * callbacks run on the connection's loop thread, serialized;
//! * [`TcpConnection::send`], [`TcpConnection::shutdown`], timer scheduling
//!   through [`LoopHandle`], and [`LoopHandle::run_in_loop`] are safe from
//!   any thread; everything else belongs to the owning loop's thread, and
//!   crossing that line panics rather than corrupts.
//!
//! # Examples
//!
//! An echo server on a single loop:
//!
//! ```no_run
//! use muxio::{EventLoop, ServerOptions, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:2007".parse().unwrap();
//! let server = TcpServer::new(&event_loop, addr, "echo", ServerOptions::default()).unwrap();
//! server.set_message_callback(|conn, buf, _when| {
//!     let bytes = buf.retrieve_all_as_bytes();
//!     conn.send(&bytes);
//! });
//! server.start();
//! event_loop.run();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg(unix)]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod client;
mod codec;
mod confined;
mod connection;
mod connector;
mod event;
mod event_loop;
mod loop_thread;
mod poller;
mod server;
mod sys;
mod timer;

pub use crate::acceptor::Acceptor;
pub use crate::buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use crate::channel::Channel;
pub use crate::client::TcpClient;
pub use crate::codec::{LengthHeaderCodec, HEADER_LEN, MAX_MESSAGE_LEN};
pub use crate::connection::{
    ConnectionCallback, ConnectionState, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback,
};
pub use crate::connector::Connector;
pub use crate::event::EventSet;
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use crate::server::{ServerOptions, TcpServer};
pub use crate::timer::TimerId;
