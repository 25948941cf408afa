use std::collections::HashMap;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxio::{
    ConnectionState, EventLoop, LengthHeaderCodec, LoopHandle, ServerOptions, TcpConnectionPtr,
    TcpServer,
};

mod util;

struct Counters {
    ups: AtomicUsize,
    downs: AtomicUsize,
}

impl Counters {
    fn new() -> Arc<Counters> {
        Arc::new(Counters {
            ups: AtomicUsize::new(0),
            downs: AtomicUsize::new(0),
        })
    }
}

/// Runs a framed-echo server on its own base-loop thread and hands back
/// the pieces the test needs to drive it.
fn spawn_echo_server(
    options: ServerOptions,
    counters: Arc<Counters>,
) -> (SocketAddr, LoopHandle, TcpServer, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "echo",
            options,
        )
        .unwrap();
        let codec = Arc::new(LengthHeaderCodec::new(|conn, frame, _when| {
            LengthHeaderCodec::send(conn, frame);
        }));
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                assert_eq!(conn.state(), ConnectionState::Connected);
                counters.ups.fetch_add(1, Ordering::AcqRel);
            } else {
                assert_eq!(conn.state(), ConnectionState::Disconnected);
                counters.downs.fetch_add(1, Ordering::AcqRel);
            }
        });
        server.set_message_callback(move |conn, buf, when| codec.on_message(conn, buf, when));
        server.start();
        tx.send((server.local_addr(), event_loop.handle(), server.clone()))
            .unwrap();
        event_loop.run();
        drop(server);
    });
    let (addr, handle, server) = rx.recv().unwrap();
    (addr, handle, server, joined)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn length_prefixed_echo() {
    util::init();
    let counters = Counters::new();
    let (addr, handle, server, joined) = spawn_echo_server(ServerOptions::default(), Arc::clone(&counters));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&frame(b"foo")).unwrap();

    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, &[0x00, 0x00, 0x00, 0x03, b'f', b'o', b'o']);

    drop(stream);
    util::wait_for_count(&counters.downs, 1);

    // Exactly one up/down pair per accepted connection.
    assert_eq!(counters.ups.load(Ordering::Acquire), 1);
    assert_eq!(counters.downs.load(Ordering::Acquire), 1);

    drop(server);
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn split_frame_reassembly() {
    util::init();
    let counters = Counters::new();
    let (addr, handle, server, joined) = spawn_echo_server(ServerOptions::default(), counters);

    let mut stream = TcpStream::connect(addr).unwrap();
    let bytes = frame(b"split me");
    // Dribble the frame across three writes; the codec must wait for the
    // full frame before echoing.
    stream.write_all(&bytes[..2]).unwrap();
    thread::sleep(Duration::from_millis(30));
    stream.write_all(&bytes[2..6]).unwrap();
    thread::sleep(Duration::from_millis(30));
    stream.write_all(&bytes[6..]).unwrap();

    let mut reply = vec![0u8; bytes.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, bytes);

    drop(stream);
    drop(server);
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn oversize_frame_shuts_connection_down() {
    util::init();
    let counters = Counters::new();
    let (addr, handle, server, joined) =
        spawn_echo_server(ServerOptions::default(), Arc::clone(&counters));

    let mut stream = TcpStream::connect(addr).unwrap();
    // Header advertising 65537 bytes: a protocol violation.
    stream.write_all(&[0x00, 0x01, 0x00, 0x01]).unwrap();

    // The server shuts down its write side; we observe EOF.
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).unwrap();
    assert!(sink.is_empty());

    drop(stream);
    util::wait_for_count(&counters.downs, 1);

    // The connection map is empty again.
    let (count_tx, count_rx) = mpsc::channel();
    let queried = server.clone();
    handle.run_in_loop(move || count_tx.send(queried.connection_count()).unwrap());
    assert_eq!(count_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

    drop(server);
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn graceful_shutdown_drains_pending_output() {
    util::init();
    const PAYLOAD: usize = 1024 * 1024;

    let counters = Counters::new();
    let (tx, rx) = mpsc::channel();
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "firehose",
            ServerOptions::default(),
        )
        .unwrap();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // Far more than the socket buffer takes in one write; the
                // rest must drain through the output buffer after the
                // shutdown request.
                conn.send(&vec![0xabu8; PAYLOAD]);
                conn.shutdown();
                assert_eq!(conn.state(), ConnectionState::Disconnecting);
            } else {
                counters.downs.fetch_add(1, Ordering::AcqRel);
            }
        });
        server.start();
        tx.send((server.local_addr(), event_loop.handle())).unwrap();
        event_loop.run();
        drop(server);
    });
    let (addr, handle) = rx.recv().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&byte| byte == 0xab));

    drop(stream);
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn multi_loop_round_robin_and_broadcast() {
    util::init();
    const CLIENTS: usize = 4;

    let counters = Counters::new();
    let loop_threads = Arc::new(Mutex::new(HashSet::new()));
    let (tx, rx) = mpsc::channel();

    let observed_threads = Arc::clone(&loop_threads);
    let observed = Arc::clone(&counters);
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let options = ServerOptions {
            threads: CLIENTS,
            ..Default::default()
        };
        let server = TcpServer::new(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "chat",
            options,
        )
        .unwrap();

        type ConnectionMap = HashMap<String, TcpConnectionPtr>;
        let connections: Arc<Mutex<Arc<ConnectionMap>>> =
            Arc::new(Mutex::new(Arc::new(HashMap::new())));

        let codec = {
            let connections = Arc::clone(&connections);
            Arc::new(LengthHeaderCodec::new(move |_conn, frame, _when| {
                let snapshot = connections.lock().unwrap().clone();
                for conn in snapshot.values() {
                    LengthHeaderCodec::send(conn, frame);
                }
            }))
        };
        server.set_connection_callback(move |conn| {
            let mut map = connections.lock().unwrap();
            let map = Arc::make_mut(&mut map);
            if conn.connected() {
                observed_threads
                    .lock()
                    .unwrap()
                    .insert(thread::current().id());
                map.insert(conn.name().to_string(), Arc::clone(conn));
                observed.ups.fetch_add(1, Ordering::AcqRel);
            } else {
                map.remove(conn.name());
                observed.downs.fetch_add(1, Ordering::AcqRel);
            }
        });
        server.set_message_callback(move |conn, buf, when| codec.on_message(conn, buf, when));
        server.start();
        tx.send((server.local_addr(), event_loop.handle())).unwrap();
        event_loop.run();
        drop(server);
    });
    let (addr, handle) = rx.recv().unwrap();

    let mut clients: Vec<TcpStream> = (0..CLIENTS)
        .map(|_| TcpStream::connect(addr).unwrap())
        .collect();
    util::wait_for_count(&counters.ups, CLIENTS);

    // Round-robin put every connection on a different loop.
    assert_eq!(loop_threads.lock().unwrap().len(), CLIENTS);

    let message = frame(b"hello");
    clients[0].write_all(&message).unwrap();

    // Everyone receives the broadcast exactly once, sender included.
    for client in clients.iter_mut() {
        let mut reply = vec![0u8; message.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, message);
    }

    drop(clients);
    util::wait_for_count(&counters.downs, CLIENTS);
    handle.quit();
    joined.join().unwrap();
}
