use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, RingBuf},
};
use sockscope_common::{
    ConnTuple, EVENTS_RING_SIZE, IntentStack, KernelOffsets, LibPath, LibsetConfig, PidFd,
    RELAY_MAX_ENTRIES, RESOLVER_MAX_ENTRIES, ThreadKey,
};

pub const TRACED_PIDS_MAX_ENTRIES: u32 = 1024;

// Loader-written configuration (slot 0)

#[map]
pub static LIBSET_CONFIG: Array<LibsetConfig> = Array::with_max_entries(1, 0);

#[map]
pub static KERNEL_OFFSETS: Array<KernelOffsets> = Array::with_max_entries(1, 0);

/// pid -> mask of `EventKind::mask()` bits to sample
#[map]
pub static TRACED_PIDS: HashMap<u32, u64> = HashMap::with_max_entries(TRACED_PIDS_MAX_ENTRIES, 0);

// Entry -> exit relays

#[map]
pub static PENDING_OPENS: HashMap<ThreadKey, LibPath> =
    HashMap::with_max_entries(RELAY_MAX_ENTRIES, 0);

#[map]
pub static SOCKFD_LOOKUP_ARGS: HashMap<ThreadKey, u32> =
    HashMap::with_max_entries(RELAY_MAX_ENTRIES, 0);

#[map]
pub static SOCKET_INTENTS: HashMap<ThreadKey, IntentStack> =
    HashMap::with_max_entries(RELAY_MAX_ENTRIES, 0);

// Resolver index

#[map]
pub static TUPLE_BY_PID_FD: HashMap<PidFd, ConnTuple> =
    HashMap::with_max_entries(RESOLVER_MAX_ENTRIES, 0);

#[map]
pub static PID_FD_BY_TUPLE: HashMap<ConnTuple, PidFd> =
    HashMap::with_max_entries(RESOLVER_MAX_ENTRIES, 0);

// Event channels

#[map]
pub static CRYPTO_LIBRARIES: RingBuf = RingBuf::with_byte_size(EVENTS_RING_SIZE, 0);

#[map]
pub static GPU_LIBRARIES: RingBuf = RingBuf::with_byte_size(EVENTS_RING_SIZE, 0);

#[map]
pub static CONN_CLOSE_EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_SIZE, 0);

#[map]
pub static SOCKET_OP_EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_SIZE, 0);
