use std::io;
use std::os::unix::io::RawFd;

/// Headroom kept in front of the readable span so a protocol layer can
/// prepend a small header without copying the payload.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity, excluding the prepend headroom.
pub const INITIAL_SIZE: usize = 1024;

/// Stack spillover used by [`Buffer::read_fd`] so one scatter read can
/// ingest a large burst without keeping every buffer permanently oversized.
const SPILLOVER_SIZE: usize = 64 * 1024;

/// Growable byte buffer used for both connection input and output streams.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader_index  <=  writer_index   <=   capacity
/// ```
///
/// Both indices are non-decreasing between resets; when the readable span
/// empties, both snap back to [`CHEAP_PREPEND`] so the space in front of the
/// reader is reclaimed for free.
pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Read-only view of the readable span. Valid until the next mutating
    /// call.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Consume `len` readable bytes.
    ///
    /// Consuming everything resets both indices to the prepend mark.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drain `len` readable bytes into a freshly allocated `String`.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    /// Drain the whole readable span into a `String` and reset the indices.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append `data` to the writable span, compacting or growing as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.storage[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer_index + len, 0);
        } else {
            // Enough slack once the readable span is shifted down to the
            // prepend mark.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Read from `fd` with a single scatter read into the writable span plus
    /// a 64 KiB stack spillover. Data landing in the spillover is appended
    /// afterwards, growing the buffer only when a burst actually demands it.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spillover = [0u8; SPILLOVER_SIZE];
        let writable = self.writable_bytes();
        let iovs = [
            libc::iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: spillover.as_mut_ptr() as *mut libc::c_void,
                iov_len: spillover.len(),
            },
        ];
        let iovcnt = if writable < spillover.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iovs.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            self.append(&spillover[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable span to `fd` in a single call.
    ///
    /// The reader index is NOT advanced; the caller retrieves based on the
    /// returned count.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                fd,
                self.peek().as_ptr() as *const libc::c_void,
                self.readable_bytes(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.storage.len()
    }
}
