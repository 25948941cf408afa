use std::sync::Arc;
use std::time::Instant;

use log::error;

use crate::buffer::Buffer;
use crate::connection::TcpConnectionPtr;

/// Frame header: 4 byte big-endian payload length.
pub const HEADER_LEN: usize = 4;
/// Largest accepted payload. Anything longer is treated as a protocol
/// violation and the connection is shut down.
pub const MAX_MESSAGE_LEN: usize = 65536;

type FrameCallback = Arc<dyn Fn(&TcpConnectionPtr, &[u8], Instant) + Send + Sync>;

/// Length-prefixed framing codec.
///
/// Sits between a connection's raw message callback and application code:
/// feed [`on_message`] the input buffer and it invokes the frame callback
/// once per complete frame, leaving partial frames buffered. `"hi"` on the
/// wire is `00 00 00 02 68 69`.
///
/// # Examples
///
/// ```no_run
/// use muxio::{EventLoop, LengthHeaderCodec, ServerOptions, TcpServer};
/// use std::sync::Arc;
///
/// let event_loop = EventLoop::new().unwrap();
/// let addr = "127.0.0.1:2007".parse().unwrap();
/// let server = TcpServer::new(&event_loop, addr, "echo", ServerOptions::default()).unwrap();
/// let codec = Arc::new(LengthHeaderCodec::new(|conn, frame, _when| {
///     LengthHeaderCodec::send(conn, frame); // echo
/// }));
/// let on_message = Arc::clone(&codec);
/// server.set_message_callback(move |conn, buf, when| on_message.on_message(conn, buf, when));
/// server.start();
/// event_loop.run();
/// ```
///
/// [`on_message`]: LengthHeaderCodec::on_message
pub struct LengthHeaderCodec {
    on_frame: FrameCallback,
}

impl LengthHeaderCodec {
    pub fn new(
        on_frame: impl Fn(&TcpConnectionPtr, &[u8], Instant) + Send + Sync + 'static,
    ) -> LengthHeaderCodec {
        LengthHeaderCodec {
            on_frame: Arc::new(on_frame),
        }
    }

    /// Decodes as many complete frames as `buf` holds.
    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Instant) {
        while buf.readable_bytes() >= HEADER_LEN {
            let header: [u8; HEADER_LEN] = buf.peek()[..HEADER_LEN].try_into().unwrap();
            let len = u32::from_be_bytes(header) as usize;
            if len > MAX_MESSAGE_LEN {
                error!("[{}] invalid frame length {}", conn.name(), len);
                conn.shutdown();
                break;
            } else if buf.readable_bytes() >= HEADER_LEN + len {
                buf.retrieve(HEADER_LEN);
                let frame = buf.retrieve_as_bytes(len);
                (self.on_frame)(conn, &frame, receive_time);
            } else {
                // Partial frame; wait for more bytes.
                break;
            }
        }
    }

    /// Frames `message` and sends it, writing the header into the
    /// buffer's head room.
    pub fn send(conn: &TcpConnectionPtr, message: &[u8]) {
        let mut buf = Buffer::new();
        buf.append(message);
        buf.prepend(&(message.len() as u32).to_be_bytes());
        conn.send(buf.peek());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_layout() {
        let mut buf = Buffer::new();
        buf.append(b"hi");
        buf.prepend(&(2u32).to_be_bytes());
        assert_eq!(buf.peek(), &[0x00, 0x00, 0x00, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn header_parsing() {
        let header = [0x00u8, 0x01, 0x00, 0x01];
        assert_eq!(u32::from_be_bytes(header) as usize, 65537);
        assert!(u32::from_be_bytes(header) as usize > MAX_MESSAGE_LEN);
    }
}
