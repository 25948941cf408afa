//! Single-loop chat server: every framed message is broadcast to every
//! connected client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use muxio::{EventLoop, LengthHeaderCodec, ServerOptions, TcpConnectionPtr, TcpServer};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "127.0.0.1:2008".parse().unwrap();
    let server = TcpServer::new(&event_loop, addr, "chat", ServerOptions::default())?;

    // One loop, so the lock is never contended; it only satisfies the
    // callback bounds.
    let connections: Arc<Mutex<HashMap<String, TcpConnectionPtr>>> = Default::default();

    let codec = {
        let connections = Arc::clone(&connections);
        Arc::new(LengthHeaderCodec::new(move |_conn, frame, _when| {
            for conn in connections.lock().unwrap().values() {
                LengthHeaderCodec::send(conn, frame);
            }
        }))
    };

    server.set_connection_callback({
        let connections = Arc::clone(&connections);
        move |conn| {
            println!(
                "chat: {} is {}",
                conn.name(),
                if conn.connected() { "UP" } else { "DOWN" }
            );
            let mut connections = connections.lock().unwrap();
            if conn.connected() {
                connections.insert(conn.name().to_string(), Arc::clone(conn));
            } else {
                connections.remove(conn.name());
            }
        }
    });
    server.set_message_callback(move |conn, buf, when| codec.on_message(conn, buf, when));

    server.start();
    println!("chat server listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
