use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use muxio::{EventLoop, LoopHandle, ServerOptions, TcpClient, TcpServer};

mod util;

/// Plain echo server for the client to talk to.
fn spawn_echo_server() -> (SocketAddr, LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "echo",
            ServerOptions::default(),
        )
        .unwrap();
        server.set_message_callback(|conn, buf, _when| {
            let bytes = buf.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
        server.start();
        tx.send((server.local_addr(), event_loop.handle())).unwrap();
        event_loop.run();
        drop(server);
    });
    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, joined)
}

#[test]
fn client_round_trip_and_disconnect() {
    util::init();
    let (addr, server_handle, server_joined) = spawn_echo_server();

    let replies = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let observed_replies = Arc::clone(&replies);
    let observed_downs = Arc::clone(&downs);
    let client_joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, addr, "echo-client");
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                conn.send(b"ping");
            } else {
                observed_downs.fetch_add(1, Ordering::AcqRel);
            }
        });
        client.set_message_callback(move |conn, buf, _when| {
            let bytes = buf.retrieve_all_as_bytes();
            assert_eq!(bytes, b"ping");
            observed_replies.fetch_add(1, Ordering::AcqRel);
            // Half-close; the echo server answers with EOF and the close
            // path finishes the teardown.
            conn.shutdown();
        });
        tx.send(event_loop.handle()).unwrap();
        client.connect();
        event_loop.run();
        drop(client);
    });
    let client_handle = rx.recv().unwrap();

    util::wait_for_count(&replies, 1);
    util::wait_for_count(&downs, 1);

    client_handle.quit();
    client_joined.join().unwrap();
    server_handle.quit();
    server_joined.join().unwrap();
}

#[test]
fn client_sees_connection_object() {
    util::init();
    let (addr, server_handle, server_joined) = spawn_echo_server();

    let ups = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let observed = Arc::clone(&ups);
    let client_joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, addr, "probe");
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                assert_eq!(conn.peer_addr(), addr);
                observed.fetch_add(1, Ordering::AcqRel);
            }
        });
        client.connect();
        tx.send((event_loop.handle(), client)).unwrap();
        event_loop.run();
    });
    let (client_handle, client) = rx.recv().unwrap();

    util::wait_for_count(&ups, 1);
    let conn = client.connection().expect("connection should be up");
    assert_eq!(conn.peer_addr(), addr);
    assert!(conn.connected());

    // Tear the connection down while the loop is still running, then stop.
    client.disconnect();
    util::wait_for(|| client.connection().is_none());
    drop(conn);

    client_handle.quit();
    client_joined.join().unwrap();
    server_handle.quit();
    server_joined.join().unwrap();
}

#[test]
fn stopped_client_does_not_connect() {
    util::init();
    // No listener on this port; the connector would retry forever.
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let (tx, rx) = mpsc::channel();
    let client_joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, addr, "noluck");
        client.enable_retry();
        client.connect();
        client.stop();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
        assert!(client.connection().is_none());
    });
    let client_handle = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(200));
    client_handle.quit();
    client_joined.join().unwrap();
}
