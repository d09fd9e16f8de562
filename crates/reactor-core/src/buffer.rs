//! Growable byte queue used for per-connection input/output buffering.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (content)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader        <=      writer      <=     capacity
//! ```

use std::io;

use libc::iovec;

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_LEN: usize = 65536;

/// A resizable byte buffer with prependable headroom and a single-syscall
/// scatter-read path for fds of unknown pending size.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        ByteBuffer {
            buf: vec![0u8; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Slice of the readable region; empty if nothing is buffered.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advances the reader index by `len`, resetting to the empty state if
    /// that consumes everything.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(self.readable_bytes() >= len);
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    /// Reuses reclaimed prepend space before growing the backing store.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            debug_assert!(CHEAP_PREPEND < self.reader);
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    fn begin_write_ptr(&mut self) -> *mut u8 {
        let writer = self.writer;
        self.buf[writer..].as_mut_ptr()
    }

    /// Reads once from `fd` into the writable region, spilling any surplus
    /// into an on-stack 64 KiB region and appending that via `ensure_writable`.
    /// Returns the number of bytes read (never negative; I/O errors are
    /// surfaced through `io::Result`, matching the external syscall's `errno`).
    pub fn read_from_fd(&mut self, fd: libc::c_int) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_LEN];
        let writable = self.writable_bytes();

        let mut vec = [
            iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
            iovec {
                iov_base: extra.as_mut_ptr().cast(),
                iov_len: extra.len(),
            },
        ];
        // SAFETY: `begin_write_ptr` points at writer.. within a buffer we own for the
        // duration of this call; the pointer isn't retained beyond it.
        vec[0].iov_base = self.begin_write_ptr().cast();
        vec[0].iov_len = writable;
        let iovcnt = if writable < EXTRA_BUF_LEN { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, vec.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd` in a single syscall. Does not
    /// advance the reader index; the caller retrieves whatever prefix the
    /// kernel accepted.
    pub fn write_to_fd(&self, fd: libc::c_int) -> io::Result<usize> {
        let data = self.peek();
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn initial_state_matches_invariants() {
        let buf = ByteBuffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = ByteBuffer::new();
        let payload = b"hello, reactor".to_vec();
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), payload.len());
        let out = buf.retrieve_all_as_vec();
        assert_eq!(out, payload);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_partial_advances_reader_without_reset() {
        let mut buf = ByteBuffer::new();
        buf.append(b"0123456789");
        buf.retrieve(4);
        assert_eq!(buf.peek(), b"456789");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 4);
    }

    #[test]
    fn make_space_compacts_in_place_when_prepend_space_suffices() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(&[1u8; 10]);
        buf.retrieve(10);
        // prependable is now CHEAP_PREPEND + 10, writable is 16 - (CHEAP_PREPEND+10) bytes
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 12]);
        assert_eq!(buf.buf.len(), cap_before, "should compact, not reallocate");
        assert_eq!(buf.peek(), &[2u8; 12][..]);
    }

    #[test]
    fn make_space_reallocates_when_compaction_is_insufficient() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(&[1u8; 20]);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 20]);
        assert!(buf.buf.len() > cap_before);
        assert_eq!(buf.readable_bytes(), 40);
    }

    #[test]
    fn scatter_read_exactly_writable_does_not_touch_extra_region() {
        let (r, w) = nix_pipe();
        let mut buf = ByteBuffer::with_capacity(16);
        let payload = vec![7u8; buf.writable_bytes()];
        write_all(w.as_raw_fd(), &payload);
        let n = buf.read_from_fd(r.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn scatter_read_spills_into_extra_region_and_grows() {
        let (r, w) = nix_pipe();
        let mut buf = ByteBuffer::with_capacity(16);
        let payload = vec![9u8; 4096];
        let writer = std::thread::spawn({
            let fd = w.as_raw_fd();
            let payload = payload.clone();
            move || write_all(fd, &payload)
        });
        let mut total = Vec::new();
        while total.len() < payload.len() {
            let n = buf.read_from_fd(r.as_raw_fd()).unwrap();
            assert!(n > 0);
            total.extend_from_slice(buf.peek());
            buf.retrieve_all();
        }
        writer.join().unwrap();
        assert_eq!(total, payload);
    }

    fn nix_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: libc::c_int, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            let n = unsafe { libc::write(fd, data[off..].as_ptr().cast(), data.len() - off) };
            assert!(n > 0);
            off += n as usize;
        }
    }
}
