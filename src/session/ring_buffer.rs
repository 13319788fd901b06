//! Fixed-capacity circular byte buffer
//!
//! Stages inbound bytes between the transport and the protocol parsers.
//! The buffer never grows: once full, `put` moves zero bytes and the caller
//! has to drain with `get` before reading more from the transport.
//!
//! ```text
//!            read_pos          write_pos
//!               v                  v
//! [ . . . . . . D D D D D D D D D . . . . . ]
//!               |-- available --|-- spaces ->(wraps)
//! ```

use parking_lot::Mutex;

#[derive(Debug)]
struct Inner {
    data: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
    /// Disambiguates `write_pos == read_pos` (empty vs. full)
    full: bool,
}

impl Inner {
    fn bytes_available(&self) -> usize {
        if self.full {
            self.data.len()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.data.len() - self.read_pos + self.write_pos
        }
    }

    fn spaces_available(&self) -> usize {
        self.data.len() - self.bytes_available()
    }

    fn put(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.spaces_available());
        if len == 0 {
            return 0;
        }

        let capacity = self.data.len();
        let first = len.min(capacity - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        if first < len {
            self.data[..len - first].copy_from_slice(&src[first..len]);
        }
        self.write_pos = (self.write_pos + len) % capacity;
        if self.write_pos == self.read_pos {
            self.full = true;
        }
        len
    }

    fn get(&mut self, out: &mut [u8], clear: bool) -> usize {
        let len = out.len().min(self.bytes_available());
        if len == 0 {
            return 0;
        }

        let capacity = self.data.len();
        let first = len.min(capacity - self.read_pos);
        let start = self.read_pos;
        out[..first].copy_from_slice(&self.data[start..start + first]);
        if clear {
            self.data[start..start + first].fill(0);
        }
        if first < len {
            out[first..len].copy_from_slice(&self.data[..len - first]);
            if clear {
                self.data[..len - first].fill(0);
            }
        }
        self.read_pos = (self.read_pos + len) % capacity;
        self.full = false;
        len
    }
}

/// Circular byte store with independent read/write cursors
///
/// All operations are serialized by one internal lock.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Allocate a buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                full: false,
            }),
            capacity,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can be read right now
    pub fn bytes_available(&self) -> usize {
        self.inner.lock().bytes_available()
    }

    /// Bytes that can be written right now
    pub fn spaces_available(&self) -> usize {
        self.inner.lock().spaces_available()
    }

    /// Copy as much of `data` as fits; returns the number of bytes stored
    pub fn put(&self, data: &[u8]) -> usize {
        self.inner.lock().put(data)
    }

    /// Copy up to `out.len()` of the oldest bytes out; returns bytes read
    pub fn get(&self, out: &mut [u8]) -> usize {
        self.inner.lock().get(out, false)
    }

    /// Like [`get`](Self::get), but zeroes the consumed region
    pub fn get_clearing(&self, out: &mut [u8]) -> usize {
        self.inner.lock().get(out, true)
    }

    /// Read exactly `out.len()` bytes, or nothing if fewer are buffered
    pub fn get_exact(&self, out: &mut [u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.bytes_available() < out.len() {
            return false;
        }
        inner.get(out, false);
        true
    }

    /// Reset both cursors; contents are not wiped
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.write_pos = 0;
        inner.read_pos = 0;
        inner.full = false;
    }
}
