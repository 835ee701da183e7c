//! Host-side stand-ins for kernel memory, maps and output channels.

use std::{cell::RefCell, vec::Vec};

use crate::{
    event::{
        EventKind, EventSink, LibrarySet, ProcessContext, ProcessContextSource, SamplingPolicy,
        SocketOpEvent, TASK_COMM_LEN, Termination,
    },
    memory::{MemoryReader, ReadError},
    path::LibPath,
    sock::{KernelOffsets, OffsetAccessor, SockField},
    table::FixedTable,
    tuple::{AF_INET, AF_INET6, ConnTuple, IPPROTO_TCP, PidFd, SOCK_STREAM, ThreadKey},
};

/// Sparse address space. A read succeeds only if the whole range lies inside
/// one mapped region, which is how a copy across an unmapped page behaves.
#[derive(Default)]
pub struct FakeMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FakeMemory {
    pub fn map(&mut self, base: u64, bytes: &[u8]) {
        self.regions.push((base, bytes.to_vec()));
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let (base, region) = self
            .regions
            .iter_mut()
            .find(|(base, region)| addr >= *base && addr + bytes.len() as u64 <= *base + region.len() as u64)
            .expect("write outside mapped memory");
        let start = (addr - *base) as usize;
        region[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl MemoryReader for FakeMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        let end = addr.checked_add(dst.len() as u64).ok_or(ReadError)?;
        let (base, region) = self
            .regions
            .iter()
            .find(|(base, region)| addr >= *base && end <= *base + region.len() as u64)
            .ok_or(ReadError)?;
        let start = (addr - *base) as usize;
        dst.copy_from_slice(&region[start..start + dst.len()]);
        Ok(())
    }
}

/// Socket to lay out in [`FakeKernel`]. Fields are public so tests can
/// produce non-TCP or non-inet variants.
#[derive(Clone, Copy)]
pub struct SockShape {
    pub sock_type: u16,
    pub ops_family: u32,
    pub family: u16,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
    pub protocol: u16,
}

impl SockShape {
    pub fn tcp4(saddr: [u8; 4], sport: u16, daddr: [u8; 4], dport: u16) -> Self {
        let mut shape = Self::tcp6([0; 16], sport, [0; 16], dport);
        shape.ops_family = AF_INET as u32;
        shape.family = AF_INET;
        shape.saddr[..4].copy_from_slice(&saddr);
        shape.daddr[..4].copy_from_slice(&daddr);
        shape
    }

    pub fn tcp6(saddr: [u8; 16], sport: u16, daddr: [u8; 16], dport: u16) -> Self {
        Self {
            sock_type: SOCK_STREAM,
            ops_family: AF_INET6 as u32,
            family: AF_INET6,
            saddr,
            daddr,
            sport,
            dport,
            protocol: IPPROTO_TCP as u16,
        }
    }
}

pub struct FakeSocket {
    /// `struct socket *`
    pub socket: u64,
    /// `struct sock *`
    pub sk: u64,
}

/// Kernel objects laid out with [`KernelOffsets::typical_x86_64`].
pub struct FakeKernel {
    pub memory: FakeMemory,
    pub offsets: KernelOffsets,
    next: u64,
}

impl FakeKernel {
    pub const NETNS_INUM: u32 = 4026531840;
    const SK_PROTOCOL: u64 = 520;
    const SOCKET_SIZE: usize = 64;
    const OPS_SIZE: usize = 16;
    const SK_SIZE: usize = 768;
    const NET_SIZE: usize = 256;

    pub fn new() -> Self {
        let mut offsets = KernelOffsets::typical_x86_64();
        offsets.set(SockField::SkProtocol, Self::SK_PROTOCOL);
        Self {
            memory: FakeMemory::default(),
            offsets,
            next: 0xffff_8880_0000_0000,
        }
    }

    fn alloc(&mut self, size: usize) -> u64 {
        let addr = self.next;
        self.memory.map(addr, &vec![0u8; size]);
        self.next += 0x1000;
        addr
    }

    fn put(&mut self, obj: u64, field: SockField, bytes: &[u8]) {
        let offset = self.offsets.get(field).expect("offset configured");
        self.memory.write(obj + offset, bytes);
    }

    pub fn add_socket(&mut self, shape: SockShape) -> FakeSocket {
        let socket = self.alloc(Self::SOCKET_SIZE);
        let ops = self.alloc(Self::OPS_SIZE);
        let sk = self.alloc(Self::SK_SIZE);
        let net = self.alloc(Self::NET_SIZE);

        self.put(socket, SockField::SocketType, &shape.sock_type.to_ne_bytes());
        self.put(socket, SockField::SocketOps, &ops.to_ne_bytes());
        self.put(socket, SockField::SocketSk, &sk.to_ne_bytes());
        self.put(ops, SockField::ProtoOpsFamily, &shape.ops_family.to_ne_bytes());

        self.put(sk, SockField::SkcFamily, &shape.family.to_ne_bytes());
        if shape.family == AF_INET {
            self.put(sk, SockField::SkcRcvSaddr, &shape.saddr[..4]);
            self.put(sk, SockField::SkcDaddr, &shape.daddr[..4]);
        } else {
            self.put(sk, SockField::SkcV6RcvSaddr, &shape.saddr);
            self.put(sk, SockField::SkcV6Daddr, &shape.daddr);
        }
        self.put(sk, SockField::SkcNum, &shape.sport.to_ne_bytes());
        self.put(sk, SockField::SkcDport, &shape.dport.to_be_bytes());
        self.put(sk, SockField::SkcNet, &net.to_ne_bytes());
        self.put(sk, SockField::SkProtocol, &shape.protocol.to_ne_bytes());
        self.put(net, SockField::NetNsInum, &Self::NETNS_INUM.to_ne_bytes());

        FakeSocket { socket, sk }
    }

    pub fn accessor(&self) -> OffsetAccessor<'_, &FakeMemory> {
        OffsetAccessor::new(&self.memory, &self.offsets)
    }
}

/// Checks that every forward entry has its reverse and vice versa.
pub fn assert_bidirectional<const F: usize, const R: usize>(
    forward: &FixedTable<PidFd, ConnTuple, F>,
    reverse: &FixedTable<ConnTuple, PidFd, R>,
) {
    use crate::table::KeyedTable;

    forward.for_each(|pid_fd, tuple| {
        assert_eq!(reverse.lookup(tuple), Some(*pid_fd), "forward {pid_fd:?} has no reverse");
    });
    reverse.for_each(|tuple, pid_fd| {
        assert_eq!(forward.lookup(pid_fd), Some(*tuple), "reverse {tuple:?} has no forward");
    });
}

#[derive(Default)]
pub struct RecordingSink {
    pub libraries: RefCell<Vec<(LibrarySet, LibPath)>>,
    pub finished: RefCell<Vec<(ConnTuple, Termination)>>,
    pub socket_ops: RefCell<Vec<SocketOpEvent>>,
}

impl EventSink for RecordingSink {
    fn library_opened(&self, set: LibrarySet, path: &LibPath) {
        self.libraries.borrow_mut().push((set, *path));
    }

    fn connection_finished(&self, tuple: &ConnTuple, termination: Termination) {
        self.finished.borrow_mut().push((*tuple, termination));
    }

    fn socket_operation(&self, event: &SocketOpEvent) {
        self.socket_ops.borrow_mut().push(*event);
    }
}

/// Attributes everything to a process named `curl` in cgroup 77.
pub struct FixedContext;

impl FixedContext {
    pub const CGROUP_ID: u64 = 77;
    pub const TIMESTAMP_NS: u64 = 1_000_000;
}

impl ProcessContextSource for FixedContext {
    fn process_context(&self, key: ThreadKey) -> ProcessContext {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"curl");
        ProcessContext {
            pid: key.pid(),
            tid: key.tid(),
            cgroup_id: Self::CGROUP_ID,
            timestamp_ns: Self::TIMESTAMP_NS,
            comm,
        }
    }
}

/// Samples the listed pids for every event kind.
pub struct SampledPids(pub &'static [u32]);

impl SamplingPolicy for SampledPids {
    fn is_sampled(&self, pid: u32, _kind: EventKind) -> bool {
        self.0.contains(&pid)
    }
}
