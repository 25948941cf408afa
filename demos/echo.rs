//! Echo server on a single loop. Try it with `nc 127.0.0.1 2007`.

use muxio::{EventLoop, ServerOptions, TcpServer};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "127.0.0.1:2007".parse().unwrap();
    let server = TcpServer::new(&event_loop, addr, "echo", ServerOptions::default())?;

    server.set_connection_callback(|conn| {
        println!(
            "echo: {} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
    server.set_message_callback(|conn, buf, _when| {
        let bytes = buf.retrieve_all_as_bytes();
        conn.send(&bytes);
    });

    server.start();
    println!("echo server listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
