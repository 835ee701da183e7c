//! Bidirectional `(pid, fd) <-> connection` index.
//!
//! Populated the first time a descriptor is resolved to a stream socket and
//! consulted until [`crate::teardown::TeardownNotifier`] removes it. The two
//! directions are installed together and kept one-to-one.

use crate::{
    relay::ArgRelay,
    sock::{FieldAccessor, read_conn_tuple, stream_inet_sock},
    table::KeyedTable,
    tuple::{ConnTuple, IPPROTO_TCP, PidFd, ThreadKey},
};

/// What the entry side of a descriptor lookup decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupEntry {
    /// Waiting for the completion hook.
    Pending,
    /// Descriptor already indexed; nothing to resolve.
    Cached,
    /// Negative descriptor or the relay was full.
    Skipped,
}

pub struct SocketResolver<'a, F, R, L> {
    forward: &'a F,
    reverse: &'a R,
    lookups: ArgRelay<'a, L, u32>,
}

impl<'a, F, R, L> SocketResolver<'a, F, R, L>
where
    F: KeyedTable<PidFd, ConnTuple>,
    R: KeyedTable<ConnTuple, PidFd>,
    L: KeyedTable<ThreadKey, u32>,
{
    pub const fn new(forward: &'a F, reverse: &'a R, lookups: &'a L) -> Self {
        Self {
            forward,
            reverse,
            lookups: ArgRelay::new(lookups),
        }
    }

    /// Entry of a descriptor-resolution call: only the integer is known yet.
    pub fn lookup_entry(&self, key: ThreadKey, fd: i32) -> LookupEntry {
        if fd < 0 {
            return LookupEntry::Skipped;
        }
        let pid_fd = PidFd::new(key.pid(), fd as u32);
        // Existing entries skip the probe entirely. Processes with heavy fd
        // churn can hit a stale mapping until the close signal arrives.
        if self.forward.contains_key(&pid_fd) {
            return LookupEntry::Cached;
        }
        if self.lookups.on_entry(key, &(fd as u32)) {
            LookupEntry::Pending
        } else {
            LookupEntry::Skipped
        }
    }

    /// Completion of a descriptor-resolution call with the kernel's socket.
    ///
    /// Consumes the pending lookup whatever happens next. A miss means the
    /// entry side never ran for this thread and is a silent no-op.
    pub fn lookup_return<A: FieldAccessor>(
        &self,
        key: ThreadKey,
        socket: u64,
        accessor: &A,
    ) -> Option<ConnTuple> {
        let fd = self.lookups.on_exit(key)?;
        if socket == 0 {
            return None;
        }
        self.resolve_or_create_as(key, PidFd::new(key.pid(), fd), socket, accessor)
    }

    /// Returns the indexed tuple for `pid_fd`, deriving and installing it from
    /// `socket` on a miss. `None` means "not tracked".
    pub fn resolve_or_create<A: FieldAccessor>(
        &self,
        pid_fd: PidFd,
        socket: u64,
        accessor: &A,
    ) -> Option<ConnTuple> {
        self.resolve_or_create_as(ThreadKey::new(pid_fd.pid, 0), pid_fd, socket, accessor)
    }

    fn resolve_or_create_as<A: FieldAccessor>(
        &self,
        key: ThreadKey,
        pid_fd: PidFd,
        socket: u64,
        accessor: &A,
    ) -> Option<ConnTuple> {
        if let Some(tuple) = self.forward.lookup(&pid_fd) {
            return Some(tuple);
        }
        let sk = stream_inet_sock(accessor, socket)?;
        let tuple = read_conn_tuple(accessor, sk, key, IPPROTO_TCP)?;
        self.install(pid_fd, tuple).then_some(tuple)
    }

    /// Writes both directions. Whatever `pid_fd` or `tuple` were paired with
    /// before loses its counterpart so no one-sided entry survives.
    fn install(&self, pid_fd: PidFd, tuple: ConnTuple) -> bool {
        if let Some(previous) = self.reverse.lookup(&tuple) {
            if previous != pid_fd && self.forward.lookup(&previous) == Some(tuple) {
                self.forward.remove(&previous);
            }
        }
        if let Some(previous) = self.forward.lookup(&pid_fd) {
            if previous != tuple && self.reverse.lookup(&previous) == Some(pid_fd) {
                self.reverse.remove(&previous);
            }
        }

        if self.forward.update(&pid_fd, &tuple).is_err() {
            return false;
        }
        if self.reverse.update(&tuple, &pid_fd).is_err() {
            self.forward.remove(&pid_fd);
            return false;
        }
        true
    }

    pub fn tuple_for(&self, pid_fd: &PidFd) -> Option<ConnTuple> {
        self.forward.lookup(pid_fd)
    }

    pub fn descriptor_for(&self, tuple: &ConnTuple) -> Option<PidFd> {
        self.reverse.lookup(tuple)
    }
}
