//! Multi-loop chat server, sharded flavor.
//!
//! Each I/O loop keeps its own thread-local set of connections, so the hot
//! path shares no mutable state at all. A broadcast posts one task to every
//! loop, and each loop forwards the message to the connections it owns.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use muxio::{EventLoop, LengthHeaderCodec, LoopHandle, ServerOptions, TcpConnectionPtr, TcpServer};

thread_local! {
    static LOCAL_CONNECTIONS: RefCell<Vec<TcpConnectionPtr>> = RefCell::new(Vec::new());
}

fn distribute(frame: &[u8]) {
    LOCAL_CONNECTIONS.with(|connections| {
        for conn in connections.borrow().iter() {
            LengthHeaderCodec::send(conn, frame);
        }
    });
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "127.0.0.1:2008".parse().unwrap();
    let options = ServerOptions {
        threads: 4,
        ..Default::default()
    };
    let server = TcpServer::new(&event_loop, addr, "chat-sharded", options)?;

    // Every I/O loop announces itself before it starts looping.
    let loops: Arc<Mutex<Vec<LoopHandle>>> = Default::default();
    server.set_thread_init_callback({
        let loops = Arc::clone(&loops);
        move |event_loop| loops.lock().unwrap().push(event_loop.handle())
    });

    let codec = {
        let loops = Arc::clone(&loops);
        Arc::new(LengthHeaderCodec::new(move |_conn, frame, _when| {
            let frame = frame.to_vec();
            for handle in loops.lock().unwrap().iter() {
                let frame = frame.clone();
                handle.queue_in_loop(move || distribute(&frame));
            }
        }))
    };

    server.set_connection_callback(|conn| {
        // Runs on the loop that owns the connection, so the thread-local
        // set is always the right shard.
        LOCAL_CONNECTIONS.with(|connections| {
            let mut connections = connections.borrow_mut();
            if conn.connected() {
                connections.push(Arc::clone(conn));
            } else {
                connections.retain(|other| !Arc::ptr_eq(other, conn));
            }
        });
    });
    server.set_message_callback(move |conn, buf, when| codec.on_message(conn, buf, when));

    server.start();
    println!("chat server (sharded) listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
