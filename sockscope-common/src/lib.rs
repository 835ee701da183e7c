#![cfg_attr(not(test), no_std)]

pub mod classifier;
pub mod event;
pub mod intent;
pub mod memory;
pub mod path;
pub mod relay;
pub mod resolver;
pub mod sock;
pub mod socket_op;
pub mod table;
pub mod teardown;
pub mod tuple;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{LibraryClassifier, LibsetConfig};
pub use event::{ConnCloseEvent, EventKind, EventSink, LibrarySet, ProcessContext, SocketOpEvent};
pub use intent::{IntentCache, IntentKind, IntentStack, SocketIntent};
pub use path::{BoundedPath, LibPath};
pub use relay::ArgRelay;
pub use resolver::SocketResolver;
pub use sock::{KernelOffsets, OffsetAccessor, SockField};
pub use socket_op::SocketOpTracker;
pub use table::{FixedTable, KeyedTable, TableError};
pub use teardown::TeardownNotifier;
pub use tuple::{ConnTuple, PidFd, ThreadKey};

/// Threads that can be between entry and exit of one syscall at a time.
pub const RELAY_MAX_ENTRIES: u32 = 1024;
/// Concurrently tracked descriptors across all processes.
pub const RESOLVER_MAX_ENTRIES: u32 = 10240;
pub const EVENTS_RING_SIZE: u32 = 256 * 1024;

#[cfg(feature = "user")]
mod pod {
    use super::*;

    unsafe impl aya::Pod for ThreadKey {}
    unsafe impl aya::Pod for PidFd {}
    unsafe impl aya::Pod for ConnTuple {}
    unsafe impl aya::Pod for LibPath {}
    unsafe impl aya::Pod for KernelOffsets {}
    unsafe impl aya::Pod for LibsetConfig {}
    unsafe impl aya::Pod for SocketIntent {}
    unsafe impl aya::Pod for IntentStack {}
    unsafe impl aya::Pod for ProcessContext {}
    unsafe impl aya::Pod for ConnCloseEvent {}
    unsafe impl aya::Pod for SocketOpEvent {}
}
