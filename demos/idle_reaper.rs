//! Echo server that shuts down connections idle for 8 seconds.
//!
//! A wheel of 8 buckets advances one slot per second. Every connection owns
//! an entry whose drop gracefully shuts it down; activity re-inserts the
//! entry into the freshest bucket, extending its life by a full wheel turn.
//! Connections that stay quiet see their last reference age out of the
//! wheel and are closed, at a cost of O(1) per tick and per message.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use muxio::{EventLoop, ServerOptions, TcpConnection, TcpServer};

const IDLE_SECONDS: usize = 8;

struct Entry {
    conn: Weak<TcpConnection>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            println!("reaping idle connection {}", conn.name());
            conn.shutdown();
        }
    }
}

type Bucket = Vec<Arc<Entry>>;
type Wheel = VecDeque<Bucket>;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "127.0.0.1:2007".parse().unwrap();
    let server = TcpServer::new(&event_loop, addr, "idle-echo", ServerOptions::default())?;

    let wheel: Arc<Mutex<Wheel>> = Arc::new(Mutex::new(
        std::iter::repeat_with(Bucket::new).take(IDLE_SECONDS).collect(),
    ));

    server.set_connection_callback({
        let wheel = Arc::clone(&wheel);
        move |conn| {
            if conn.connected() {
                let entry = Arc::new(Entry {
                    conn: Arc::downgrade(conn),
                });
                wheel
                    .lock()
                    .unwrap()
                    .back_mut()
                    .unwrap()
                    .push(Arc::clone(&entry));
                // The connection keeps only a weak handle on its entry, so
                // the wheel alone decides the entry's lifetime.
                conn.set_context(Box::new(Arc::downgrade(&entry)));
            }
        }
    });
    server.set_message_callback({
        let wheel = Arc::clone(&wheel);
        move |conn, buf, _when| {
            let bytes = buf.retrieve_all_as_bytes();
            conn.send(&bytes);
            let entry = conn
                .with_context::<Weak<Entry>, _>(|weak| weak.upgrade())
                .flatten();
            if let Some(entry) = entry {
                wheel.lock().unwrap().back_mut().unwrap().push(entry);
            }
        }
    });

    {
        let wheel = Arc::clone(&wheel);
        event_loop.run_every(Duration::from_secs(1), move || {
            let mut wheel = wheel.lock().unwrap();
            // The oldest bucket drops here; entries living nowhere else
            // take their connections with them.
            wheel.pop_front();
            wheel.push_back(Bucket::new());
        });
    }

    server.start();
    println!("idle-reaping echo server listening on {}", server.local_addr());
    event_loop.run();
    Ok(())
}
