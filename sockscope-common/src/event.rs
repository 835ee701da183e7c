//! Fixed-layout records leaving this crate, and the narrow contracts of the
//! collaborators that receive or decorate them.

use crate::{path::LibPath, tuple::ConnTuple, tuple::ThreadKey};

pub const TASK_COMM_LEN: usize = 16;

/// Set on events that the activity-dump policy asked to sample.
pub const EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE: u8 = 1 << 0;

/// Classification tag attached to every emitted record.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    CryptoLibrary = 1,
    GpuLibrary = 2,
    ConnectionClosed = 3,
    Connect = 4,
    Bind = 5,
}

impl EventKind {
    pub const fn mask(self) -> u64 {
        1 << (self as u8)
    }

    pub const fn name(self) -> &'static str {
        match self {
            EventKind::CryptoLibrary => "crypto_library",
            EventKind::GpuLibrary => "gpu_library",
            EventKind::ConnectionClosed => "connection_closed",
            EventKind::Connect => "connect",
            EventKind::Bind => "bind",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            EventKind::CryptoLibrary,
            EventKind::GpuLibrary,
            EventKind::ConnectionClosed,
            EventKind::Connect,
            EventKind::Bind,
        ]
        .into_iter()
        .find(|k| k.name() == name)
    }
}

/// Output channel a classified library path is published on.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibrarySet {
    Crypto = 0,
    Gpu = 1,
}

impl LibrarySet {
    pub const fn event_kind(self) -> EventKind {
        match self {
            LibrarySet::Crypto => EventKind::CryptoLibrary,
            LibrarySet::Gpu => EventKind::GpuLibrary,
        }
    }
}

/// Whether a "connection finished" signal is final.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Provisional = 0,
    Definitive = 1,
}

impl Termination {
    /// Decodes `ConnCloseEvent::termination`.
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Termination::Provisional),
            1 => Some(Termination::Definitive),
            _ => None,
        }
    }
}

/// Attribution attached to socket operation events.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub tid: u32,
    pub cgroup_id: u64,
    pub timestamp_ns: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnCloseEvent {
    pub tuple: ConnTuple,
    pub timestamp_ns: u64,
    /// [`Termination`] as a raw byte.
    pub termination: u8,
    pub _pad: [u8; 7],
}

/// Outcome of a connect/bind call with the arguments assembled along the way.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOpEvent {
    pub process: ProcessContext,
    pub retval: i64,
    /// IPv4-mapped for `AF_INET`.
    pub addr: [u8; 16],
    pub family: u16,
    /// Host byte order.
    pub port: u16,
    pub protocol: u16,
    /// [`EventKind`] as a raw byte.
    pub kind: u8,
    pub flags: u8,
}

/// Best-effort transport out of the correlation layer. Implementations may
/// drop records under pressure; callers never retry.
pub trait EventSink {
    fn library_opened(&self, set: LibrarySet, path: &LibPath);

    fn connection_finished(&self, tuple: &ConnTuple, termination: Termination);

    fn socket_operation(&self, event: &SocketOpEvent);
}

/// Process/container attribution. Purely additive.
pub trait ProcessContextSource {
    fn process_context(&self, key: ThreadKey) -> ProcessContext;
}

/// Activity-dump sampling. Purely advisory.
pub trait SamplingPolicy {
    fn is_sampled(&self, pid: u32, kind: EventKind) -> bool;
}
