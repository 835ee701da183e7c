//! Bounded capture of NUL-terminated paths from untrusted memory.

use crate::memory::MemoryReader;

/// Capacity of the path carried by library-open events.
pub const LIB_PATH_MAX_SIZE: usize = 120;

/// A path copied out of the traced process, truncated to `N` bytes.
///
/// `len` is the offset of the first NUL in the scanned window, or the window
/// size when the window held no NUL. `len == 0` means nothing usable was read.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedPath<const N: usize> {
    pub pid: u32,
    pub len: u32,
    pub buf: [u8; N],
}

pub type LibPath = BoundedPath<LIB_PATH_MAX_SIZE>;

impl<const N: usize> Default for BoundedPath<N> {
    fn default() -> Self {
        Self {
            pid: 0,
            len: 0,
            buf: [0; N],
        }
    }
}

impl<const N: usize> BoundedPath<N> {
    /// Copies at most `min(max_len, N)` bytes starting at `src`.
    ///
    /// Tries a single bulk read first. If that faults (the string may end just
    /// before an unmapped page) it falls back to reading one byte at a time and
    /// stops at the first NUL or the first byte that cannot be read.
    pub fn capture<M: MemoryReader>(memory: &M, src: u64, max_len: usize) -> Self {
        let mut path = Self::default();
        let window = if max_len < N { max_len } else { N };
        if src == 0 || window == 0 {
            return path;
        }

        if memory.read(src, &mut path.buf[..window]).is_ok() {
            path.len = window as u32;
            for i in 0..window {
                if path.buf[i] == 0 {
                    path.len = i as u32;
                    break;
                }
            }
            // bytes after the terminator are garbage from the bulk copy
            let len = path.len as usize;
            path.buf[len..].fill(0);
        } else {
            path.buf = [0; N];
            path.len = window as u32;
            for i in 0..window {
                let mut byte = [0u8; 1];
                if memory.read(src + i as u64, &mut byte).is_err() || byte[0] == 0 {
                    path.len = i as u32;
                    break;
                }
                path.buf[i] = byte[0];
            }
        }
        path
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = if (self.len as usize) < N { self.len as usize } else { N };
        &self.buf[..len]
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    const SRC: u64 = 0x7fff_0000;

    #[test]
    fn test_truncates_to_window_without_nul() {
        let mut memory = FakeMemory::default();
        memory.map(SRC, &[b'a'; 100]);

        let path = BoundedPath::<120>::capture(&memory, SRC, 64);
        assert_eq!(path.len, 64);
        assert_eq!(path.as_bytes(), &[b'a'; 64][..]);
        assert!(path.buf[64..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_stops_at_first_nul() {
        let mut bytes = [b'x'; 100];
        bytes[10] = 0;
        let mut memory = FakeMemory::default();
        memory.map(SRC, &bytes);

        let path = BoundedPath::<120>::capture(&memory, SRC, 64);
        assert_eq!(path.len, 10);
        assert!(path.buf[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_window_clamped_to_capacity() {
        let mut memory = FakeMemory::default();
        memory.map(SRC, &[b'z'; 300]);

        let path = LibPath::capture(&memory, SRC, 4096);
        assert_eq!(path.len as usize, LIB_PATH_MAX_SIZE);
    }

    #[test]
    fn test_falls_back_when_bulk_read_crosses_unmapped_page() {
        // only 15 bytes mapped; a 64-byte bulk read faults
        let mut memory = FakeMemory::default();
        memory.map(SRC, b"/lib/libssl.so\0");

        let path = LibPath::capture(&memory, SRC, 64);
        assert_eq!(path.as_bytes(), b"/lib/libssl.so");
    }

    #[test]
    fn test_fallback_stops_at_fault_without_nul() {
        let mut memory = FakeMemory::default();
        memory.map(SRC, b"/usr/lib");

        let path = LibPath::capture(&memory, SRC, 64);
        assert_eq!(path.as_bytes(), b"/usr/lib");
    }

    #[test]
    fn test_unreadable_source_is_empty() {
        let memory = FakeMemory::default();
        assert!(LibPath::capture(&memory, SRC, 64).is_empty());
        assert!(LibPath::capture(&memory, 0, 64).is_empty());
    }

    #[test]
    fn test_empty_string_is_empty() {
        let mut memory = FakeMemory::default();
        memory.map(SRC, &[0u8; 8]);
        assert!(LibPath::capture(&memory, SRC, 8).is_empty());
    }
}
