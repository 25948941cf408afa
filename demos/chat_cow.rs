//! Multi-loop chat server, copy-on-write flavor.
//!
//! Broadcasters clone an `Arc` snapshot of the connection map and iterate
//! it without holding the lock; the rare writer mutates through
//! `Arc::make_mut`, which copies the map only when a snapshot is still
//! being read somewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use muxio::{EventLoop, LengthHeaderCodec, ServerOptions, TcpConnectionPtr, TcpServer};

type ConnectionMap = HashMap<String, TcpConnectionPtr>;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "127.0.0.1:2008".parse().unwrap();
    let options = ServerOptions {
        threads: 3,
        ..Default::default()
    };
    let server = TcpServer::new(&event_loop, addr, "chat-cow", options)?;

    let connections: Arc<Mutex<Arc<ConnectionMap>>> = Arc::new(Mutex::new(Arc::new(HashMap::new())));

    let codec = {
        let connections = Arc::clone(&connections);
        Arc::new(LengthHeaderCodec::new(move |_conn, frame, _when| {
            // Snapshot under the lock, send outside it.
            let snapshot = connections.lock().unwrap().clone();
            for conn in snapshot.values() {
                LengthHeaderCodec::send(conn, frame);
            }
        }))
    };

    server.set_connection_callback({
        let connections = Arc::clone(&connections);
        move |conn| {
            let mut map = connections.lock().unwrap();
            let map = Arc::make_mut(&mut map);
            if conn.connected() {
                map.insert(conn.name().to_string(), Arc::clone(conn));
            } else {
                map.remove(conn.name());
            }
        }
    });
    server.set_message_callback(move |conn, buf, when| codec.on_message(conn, buf, when));

    server.start();
    println!("chat server (copy-on-write) listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
