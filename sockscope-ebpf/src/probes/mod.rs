//! Kernel-side bindings for the correlation core: BPF maps behind
//! `KeyedTable`, probe-read helpers behind `MemoryReader`, and the ring
//! buffers behind `EventSink`.

use aya_ebpf::{
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_ktime_get_ns, bpf_probe_read_kernel_buf, bpf_probe_read_user_buf,
    },
    maps::HashMap,
};
use sockscope_common::{
    ConnCloseEvent, ConnTuple, EventKind, EventSink, KernelOffsets, KeyedTable, LibPath,
    LibrarySet, LibsetConfig, OffsetAccessor, ProcessContext, SocketOpEvent, TableError,
    ThreadKey,
    event::{ProcessContextSource, SamplingPolicy, Termination},
    memory::{MemoryReader, ReadError},
};

pub mod maps;
pub mod shared_libraries;
pub mod socket_ops;
pub mod sockfd;

use maps::{
    CONN_CLOSE_EVENTS, CRYPTO_LIBRARIES, GPU_LIBRARIES, KERNEL_OFFSETS, LIBSET_CONFIG,
    SOCKET_OP_EVENTS, TRACED_PIDS,
};

/// A BPF hash map seen through the core's table contract.
pub struct Table<'a, K, V>(pub &'a HashMap<K, V>);

impl<K, V: Copy> KeyedTable<K, V> for Table<'_, K, V> {
    #[inline(always)]
    fn lookup(&self, key: &K) -> Option<V> {
        unsafe { self.0.get(key) }.copied()
    }

    #[inline(always)]
    fn update(&self, key: &K, value: &V) -> Result<(), TableError> {
        self.0
            .insert(key, value, 0)
            .map_err(|e| TableError::Rejected(e as i64))
    }

    #[inline(always)]
    fn with_entry_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let ptr = self.0.get_ptr_mut(key)?;
        Some(f(unsafe { &mut *ptr }))
    }

    #[inline(always)]
    fn remove(&self, key: &K) -> bool {
        self.0.remove(key).is_ok()
    }
}

pub struct UserMemory;

impl MemoryReader for UserMemory {
    #[inline(always)]
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst) }.map_err(|_| ReadError)
    }
}

pub struct KernelMemory;

impl MemoryReader for KernelMemory {
    #[inline(always)]
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        unsafe { bpf_probe_read_kernel_buf(addr as *const u8, dst) }.map_err(|_| ReadError)
    }
}

#[inline(always)]
pub fn current_thread() -> ThreadKey {
    ThreadKey::from_pid_tgid(bpf_get_current_pid_tgid())
}

/// Field accessor over kernel memory. `None` until the loader has written
/// the offset table; an untouched array slot is all zeroes.
#[inline(always)]
pub fn kernel_accessor() -> Option<OffsetAccessor<'static, KernelMemory>> {
    let offsets: &'static KernelOffsets = KERNEL_OFFSETS.get(0)?;
    if offsets.sk_protocol_size == 0 {
        return None;
    }
    Some(OffsetAccessor::new(KernelMemory, offsets))
}

#[inline(always)]
pub fn libset_config() -> LibsetConfig {
    LIBSET_CONFIG.get(0).copied().unwrap_or_default()
}

pub struct CurrentTask;

impl ProcessContextSource for CurrentTask {
    #[inline(always)]
    fn process_context(&self, key: ThreadKey) -> ProcessContext {
        ProcessContext {
            pid: key.pid(),
            tid: key.tid(),
            cgroup_id: unsafe { bpf_get_current_cgroup_id() },
            timestamp_ns: unsafe { bpf_ktime_get_ns() },
            comm: bpf_get_current_comm().unwrap_or([0; 16]),
        }
    }
}

/// Activity-dump selection written by the loader into `TRACED_PIDS`.
pub struct TracedPids;

impl SamplingPolicy for TracedPids {
    #[inline(always)]
    fn is_sampled(&self, pid: u32, kind: EventKind) -> bool {
        match unsafe { TRACED_PIDS.get(&pid) } {
            Some(mask) => mask & kind.mask() != 0,
            None => false,
        }
    }
}

/// Ring-buffer transport. A full ring drops the record.
pub struct RingSink;

impl EventSink for RingSink {
    #[inline(always)]
    fn library_opened(&self, set: LibrarySet, path: &LibPath) {
        let ring = match set {
            LibrarySet::Crypto => &CRYPTO_LIBRARIES,
            LibrarySet::Gpu => &GPU_LIBRARIES,
        };
        let _ = ring.output(path, 0);
    }

    #[inline(always)]
    fn connection_finished(&self, tuple: &ConnTuple, termination: Termination) {
        let event = ConnCloseEvent {
            tuple: *tuple,
            timestamp_ns: unsafe { bpf_ktime_get_ns() },
            termination: termination as u8,
            _pad: [0; 7],
        };
        let _ = CONN_CLOSE_EVENTS.output(&event, 0);
    }

    #[inline(always)]
    fn socket_operation(&self, event: &SocketOpEvent) {
        let _ = SOCKET_OP_EVENTS.output(event, 0);
    }
}
