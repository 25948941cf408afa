use std::io;
use std::os::fd::RawFd;

/// Growable byte buffer with prependable head room.
///
/// The buffer is divided into three regions delimited by a read index and a
/// write index:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (content)    |                  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_index   <=   write_index    <=     size
/// ```
///
/// New data is appended after the write index and consumed from the read
/// index. The initial head room lets a codec prepend a frame header in
/// front of an already-assembled payload without copying it.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

/// Reserved head room restored whenever the buffer empties.
pub const CHEAP_PREPEND: usize = 8;
/// Initial capacity of the content region.
pub const INITIAL_SIZE: usize = 1024;

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything and recovers the initial head room.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes and returns `len` readable bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes and returns the whole readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Writes `data` in front of the readable region.
    ///
    /// Callers must check `prependable_bytes` first; exceeding the head
    /// room is a programming error.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Makes room for at least `len` writable bytes.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            // Enough total room; shift the content down to recover the
            // head room instead of reallocating.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }

    /// Reads from `fd` directly into the buffer with a single syscall.
    ///
    /// A scatter read fills the writable region first and spills into a
    /// 64 KiB stack scratch, which is appended afterwards (growing the
    /// buffer). This drains up to `writable_bytes` + 64 KiB per call no
    /// matter how small the buffer currently is, saving an `FIONREAD`
    /// round trip to size the read.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];
        // When there is enough space in the buffer, don't bother with the
        // scratch; at most 128 KiB - 1 is read when it is used.
        let iovcnt = if writable < scratch.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        self.read_index <= self.write_index && self.write_index <= self.buf.len()
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        let payload = vec![b'x'; 200];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);
        assert!(buf.invariants_hold());

        let head = buf.retrieve_as_bytes(50);
        assert_eq!(head.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 350);

        let rest = buf.retrieve_all_as_bytes();
        assert_eq!(rest.len(), 350);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert!(buf.invariants_hold());
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let mut buf = Buffer::new();
        let payload: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        buf.append(&payload);
        assert_eq!(buf.retrieve_all_as_bytes(), payload);
    }

    #[test]
    fn grow_reallocates() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert!(buf.invariants_hold());
    }

    #[test]
    fn grow_shifts_content_when_head_room_suffices() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(500);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 500);

        // 300 readable, 224 writable, 508 prependable: appending 400 fits
        // after shifting without growing the allocation.
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        let mut expected = vec![b'a'; 300];
        expected.extend_from_slice(&vec![b'b'; 400]);
        assert_eq!(buf.peek(), &expected[..]);
    }

    #[test]
    fn prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        let frame = buf.retrieve_all_as_bytes();
        assert_eq!(&frame[..4], &7u32.to_be_bytes());
        assert_eq!(&frame[4..], b"payload");
    }

    #[test]
    fn read_fd_fits_in_writable() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"hello buffer").unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 12);
        assert_eq!(buf.peek(), b"hello buffer");
    }

    #[test]
    fn read_fd_spills_into_scratch() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..8000u32).map(|i| i as u8).collect();
        tx.write_all(&payload).unwrap();

        // A single call drains everything even though only 1 KiB is
        // writable up front.
        let mut buf = Buffer::new();
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
        assert!(buf.invariants_hold());
    }
}
