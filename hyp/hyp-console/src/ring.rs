use core::fmt;

/// Byte ring that overwrites its oldest contents when full.
pub struct RingBuffer<const N: usize> {
    buf: [u8; N],
    /// Index of the oldest byte.
    head: usize,
    len: usize,
    /// Bytes overwritten before anyone drained them.
    lost: u64,
}

impl<const N: usize> RingBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            head: 0,
            len: 0,
            lost: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn lost(&self) -> u64 {
        self.lost
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if N == 0 {
            self.lost += bytes.len() as u64;
            return;
        }
        for &b in bytes {
            let tail = (self.head + self.len) % N;
            self.buf[tail] = b;
            if self.len == N {
                self.head = (self.head + 1) % N;
                self.lost += 1;
            } else {
                self.len += 1;
            }
        }
    }

    /// Move up to `out.len()` of the oldest bytes into `out`.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for slot in &mut out[..n] {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % N;
        }
        self.len -= n;
        n
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for RingBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_and_keeps_the_newest_bytes() {
        let mut ring = RingBuffer::<4>::new();
        ring.push(b"abc");
        let mut out = [0u8; 2];
        assert_eq!(ring.drain_into(&mut out), 2);
        assert_eq!(&out, b"ab");

        ring.push(b"defgh");
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.lost(), 2);
        let mut out = [0u8; 8];
        let n = ring.drain_into(&mut out);
        assert_eq!(&out[..n], b"efgh");
        assert!(ring.is_empty());
    }
}
