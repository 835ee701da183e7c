//! Detection of shared-library opens worth reporting.
//!
//! The open's entry captures the path, the exit decides on the outcome. Only
//! paths shaped like `<stem>.so` where the six bytes before `.so` name a known
//! library are published.

use crate::{
    event::{EventSink, LibrarySet},
    memory::MemoryReader,
    path::{LIB_PATH_MAX_SIZE, LibPath},
    relay::ArgRelay,
    table::KeyedTable,
    tuple::ThreadKey,
};

pub const O_WRONLY: u32 = 0o1;

const STEM_LEN: usize = 6;
const SUFFIX: &[u8; 3] = b".so";

const CRYPTO_STEMS: [&[u8; STEM_LEN]; 3] = [b"libssl", b"crypto", b"gnutls"];
const GPU_STEMS: [&[u8; STEM_LEN]; 1] = [b"cudart"];

/// Which library sets are reported. Written once by the loader into a
/// one-slot array map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibsetConfig {
    pub crypto_enabled: u8,
    pub gpu_enabled: u8,
    pub _pad: [u8; 6],
}

impl LibsetConfig {
    pub const fn new(crypto: bool, gpu: bool) -> Self {
        Self {
            crypto_enabled: crypto as u8,
            gpu_enabled: gpu as u8,
            _pad: [0; 6],
        }
    }

    fn enabled(&self, set: LibrarySet) -> bool {
        match set {
            LibrarySet::Crypto => self.crypto_enabled != 0,
            LibrarySet::Gpu => self.gpu_enabled != 0,
        }
    }
}

/// Write-only opens can't be a library load. `None` means the flags are not
/// available at the hook (`openat2`), which is never filtered.
pub fn should_ignore_flags(flags: Option<u32>) -> bool {
    matches!(flags, Some(flags) if flags & O_WRONLY != 0)
}

/// Finds the first `.so` with room for a stem in front of it and returns the
/// enabled set that stem belongs to. Crypto wins over GPU.
pub fn classify(path: &[u8], config: &LibsetConfig) -> Option<LibrarySet> {
    let len = path.len();
    let mut i = 0;
    while i + STEM_LEN + SUFFIX.len() <= len {
        if &path[i + STEM_LEN..i + STEM_LEN + SUFFIX.len()] == SUFFIX {
            let stem = &path[i..i + STEM_LEN];
            if config.enabled(LibrarySet::Crypto) && CRYPTO_STEMS.iter().any(|s| &s[..] == stem) {
                return Some(LibrarySet::Crypto);
            }
            if config.enabled(LibrarySet::Gpu) && GPU_STEMS.iter().any(|s| &s[..] == stem) {
                return Some(LibrarySet::Gpu);
            }
            return None;
        }
        i += 1;
    }
    None
}

pub struct LibraryClassifier<'a, T> {
    pending: ArgRelay<'a, T, LibPath>,
}

impl<'a, T: KeyedTable<ThreadKey, LibPath>> LibraryClassifier<'a, T> {
    pub const fn new(pending: &'a T) -> Self {
        Self {
            pending: ArgRelay::new(pending),
        }
    }

    /// Open-family syscall entry. Returns whether a path was stashed.
    pub fn open_enter<M: MemoryReader>(
        &self,
        key: ThreadKey,
        filename: u64,
        flags: Option<u32>,
        memory: &M,
    ) -> bool {
        if should_ignore_flags(flags) {
            return false;
        }
        let path = LibPath::capture(memory, filename, LIB_PATH_MAX_SIZE).with_pid(key.pid());
        if path.is_empty() {
            return false;
        }
        self.pending.on_entry(key, &path)
    }

    /// Open-family syscall exit. The stashed path is consumed whatever the
    /// outcome.
    pub fn open_exit<S: EventSink>(
        &self,
        key: ThreadKey,
        ret: i64,
        config: &LibsetConfig,
        sink: &S,
    ) -> Option<LibrarySet> {
        let path = self.pending.on_exit(key)?;
        if ret < 0 {
            return None;
        }
        let set = classify(path.as_bytes(), config)?;
        sink.library_opened(set, &path);
        Some(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FixedTable;
    use crate::testing::{FakeMemory, RecordingSink};

    const FILENAME: u64 = 0x5555_0000;
    const ALL: LibsetConfig = LibsetConfig::new(true, true);

    fn memory_with(path: &[u8]) -> FakeMemory {
        let mut memory = FakeMemory::default();
        let mut bytes = path.to_vec();
        bytes.push(0);
        memory.map(FILENAME, &bytes);
        memory
    }

    fn open(path: &[u8], flags: Option<u32>, ret: i64, config: LibsetConfig) -> RecordingSink {
        let table: FixedTable<ThreadKey, LibPath, 4> = FixedTable::new();
        let classifier = LibraryClassifier::new(&table);
        let sink = RecordingSink::default();
        let key = ThreadKey::new(300, 301);

        classifier.open_enter(key, FILENAME, flags, &memory_with(path));
        classifier.open_exit(key, ret, &config, &sink);
        assert!(table.is_empty());
        sink
    }

    #[test]
    fn test_crypto_gate() {
        let off = open(b"/tmp/libssl.so", Some(0), 3, LibsetConfig::new(false, true));
        assert!(off.libraries.borrow().is_empty());

        let on = open(b"/tmp/libssl.so", Some(0), 3, ALL);
        let libraries = on.libraries.borrow();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].0, LibrarySet::Crypto);
        assert_eq!(libraries[0].1.as_bytes(), b"/tmp/libssl.so");
        assert_eq!(libraries[0].1.pid, 300);
    }

    #[test]
    fn test_write_only_open_is_ignored() {
        let sink = open(b"/tmp/libssl.so", Some(O_WRONLY), 3, ALL);
        assert!(sink.libraries.borrow().is_empty());
        assert!(should_ignore_flags(Some(0o1101)));
        assert!(!should_ignore_flags(Some(0o2)));
        assert!(!should_ignore_flags(None));
    }

    #[test]
    fn test_openat2_is_never_filtered() {
        let sink = open(b"/usr/lib/libcrypto.so.3", None, 4, ALL);
        assert_eq!(sink.libraries.borrow()[0].0, LibrarySet::Crypto);
    }

    #[test]
    fn test_failed_open_emits_nothing() {
        let sink = open(b"/tmp/libssl.so", Some(0), -2, ALL);
        assert!(sink.libraries.borrow().is_empty());
    }

    #[test]
    fn test_versioned_suffix_and_gpu_set() {
        let cudart = b"/usr/local/cuda/lib64/libcudart.so.12";
        assert_eq!(
            classify(b"/lib/x86_64-linux-gnu/libssl.so.3", &ALL),
            Some(LibrarySet::Crypto)
        );
        assert_eq!(classify(b"/usr/lib/libgnutls.so.30", &ALL), Some(LibrarySet::Crypto));
        assert_eq!(classify(cudart, &ALL), Some(LibrarySet::Gpu));
        assert_eq!(classify(cudart, &LibsetConfig::new(true, false)), None);
    }

    #[test]
    fn test_non_matches() {
        assert_eq!(classify(b"/etc/ssl/openssl.cnf", &ALL), None);
        assert_eq!(classify(b"/usr/lib/libz.so.1", &ALL), None);
        // stem needs six bytes in front of the suffix
        assert_eq!(classify(b"ssl.so", &ALL), None);
        assert_eq!(classify(b"", &ALL), None);
    }

    #[test]
    fn test_exit_without_entry_is_noop() {
        let table: FixedTable<ThreadKey, LibPath, 4> = FixedTable::new();
        let classifier = LibraryClassifier::new(&table);
        let sink = RecordingSink::default();
        assert_eq!(classifier.open_exit(ThreadKey::new(1, 1), 3, &ALL, &sink), None);
        assert!(sink.libraries.borrow().is_empty());
    }

    #[test]
    fn test_unreadable_filename_is_dropped() {
        let table: FixedTable<ThreadKey, LibPath, 4> = FixedTable::new();
        let classifier = LibraryClassifier::new(&table);
        let memory = FakeMemory::default();
        assert!(!classifier.open_enter(ThreadKey::new(1, 1), FILENAME, Some(0), &memory));
        assert!(table.is_empty());
    }

    #[test]
    fn test_long_path_is_truncated_but_still_classified() {
        let mut path = b"/opt/libssl.so.d/".to_vec();
        path.extend_from_slice(&[b'a'; 200]);

        let sink = open(&path, Some(0), 3, ALL);
        let libraries = sink.libraries.borrow();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].0, LibrarySet::Crypto);
        assert_eq!(libraries[0].1.len as usize, LIB_PATH_MAX_SIZE);
        assert_eq!(libraries[0].1.as_bytes(), &path[..LIB_PATH_MAX_SIZE]);
    }

    #[test]
    fn test_suffix_past_the_window_is_not_classified() {
        let mut path = b"/tmp/".to_vec();
        path.extend_from_slice(&[b'b'; 150]);
        path.extend_from_slice(b"/libssl.so");

        // `open` also checks the pending entry was cleared
        let sink = open(&path, Some(0), 3, ALL);
        assert!(sink.libraries.borrow().is_empty());
    }
}
