use std::cmp;

/// Receive ring for raw bytes coming off the port. The port fills the free
/// region, the packet decoder consumes from `start`. One slot is reserved
/// so a full ring is distinguishable from an empty one: at most
/// `capacity - 1` bytes are ever occupied.
#[derive(Debug)]
pub struct Ring {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Ring {
        Ring {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn available(&self) -> usize {
        (self.end + self.buf.len() - self.start) % self.buf.len()
    }

    pub fn free(&self) -> usize {
        self.buf.len() - 1 - self.available()
    }

    /// Contiguous writable region at the producer end. Shorter than
    /// `free()` when the free region wraps; the next call picks up the
    /// remainder.
    pub fn write_span(&mut self) -> &mut [u8] {
        let cap = self.buf.len();
        let n = if self.start > self.end {
            self.start - self.end - 1
        } else if self.start == 0 {
            cap - self.end - 1
        } else {
            cap - self.end
        };
        &mut self.buf[self.end..self.end + n]
    }

    /// Account for `n` bytes the port wrote into `write_span`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.end = (self.end + n) % self.buf.len();
    }

    /// Byte at `off` past the consumer end.
    pub fn at(&self, off: usize) -> u8 {
        debug_assert!(off < self.available());
        self.buf[(self.start + off) % self.buf.len()]
    }

    /// Copy `dst.len()` occupied bytes starting at `off` into `dst`.
    pub fn copy_to(&self, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= self.available());
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.buf[(self.start + off + i) % self.buf.len()];
        }
    }

    /// The occupied range `[off, off + len)` as at most two contiguous
    /// slices; the second is empty unless the range wraps.
    pub fn spans(&self, off: usize, len: usize) -> (&[u8], &[u8]) {
        debug_assert!(off + len <= self.available());
        let cap = self.buf.len();
        let from = (self.start + off) % cap;
        let head = cmp::min(len, cap - from);
        (&self.buf[from..from + head], &self.buf[..len - head])
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.start = (self.start + n) % self.buf.len();
    }
}
