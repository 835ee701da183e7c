//! Reading opaque kernel socket objects through pre-resolved field offsets.
//!
//! Offsets are discovered outside this crate and handed in as a
//! [`KernelOffsets`] table. A field whose offset is unknown for the running
//! kernel cannot be read, and every caller treats that as "not tracked".

use crate::{
    memory::MemoryReader,
    tuple::{AF_INET, AF_INET6, ConnTuple, SOCK_STREAM, ThreadKey, ipv4_mapped},
};

/// Marks a field whose offset is not known for this kernel build.
pub const OFFSET_UNKNOWN: u64 = u64::MAX;

/// Logical names for the kernel fields this crate reads.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockField {
    /// `struct socket::type` (short)
    SocketType = 0,
    /// `struct socket::sk`
    SocketSk = 1,
    /// `struct socket::ops`
    SocketOps = 2,
    /// `struct proto_ops::family` (int)
    ProtoOpsFamily = 3,
    /// `struct sock_common::skc_family`
    SkcFamily = 4,
    /// `struct sock_common::skc_rcv_saddr`
    SkcRcvSaddr = 5,
    /// `struct sock_common::skc_daddr`
    SkcDaddr = 6,
    /// `struct sock_common::skc_v6_rcv_saddr`
    SkcV6RcvSaddr = 7,
    /// `struct sock_common::skc_v6_daddr`
    SkcV6Daddr = 8,
    /// `struct sock_common::skc_num` (host order)
    SkcNum = 9,
    /// `struct sock_common::skc_dport` (network order)
    SkcDport = 10,
    /// `struct sock_common::skc_net`
    SkcNet = 11,
    /// `struct net::ns.inum`
    NetNsInum = 12,
    /// `struct sock::sk_protocol`
    SkProtocol = 13,
}

pub const SOCK_FIELD_COUNT: usize = 14;

impl SockField {
    pub const ALL: [SockField; SOCK_FIELD_COUNT] = [
        SockField::SocketType,
        SockField::SocketSk,
        SockField::SocketOps,
        SockField::ProtoOpsFamily,
        SockField::SkcFamily,
        SockField::SkcRcvSaddr,
        SockField::SkcDaddr,
        SockField::SkcV6RcvSaddr,
        SockField::SkcV6Daddr,
        SockField::SkcNum,
        SockField::SkcDport,
        SockField::SkcNet,
        SockField::NetNsInum,
        SockField::SkProtocol,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            SockField::SocketType => "socket_type",
            SockField::SocketSk => "socket_sk",
            SockField::SocketOps => "socket_ops",
            SockField::ProtoOpsFamily => "proto_ops_family",
            SockField::SkcFamily => "sock_common_skc_family",
            SockField::SkcRcvSaddr => "sock_common_skc_rcv_saddr",
            SockField::SkcDaddr => "sock_common_skc_daddr",
            SockField::SkcV6RcvSaddr => "sock_common_skc_v6_rcv_saddr",
            SockField::SkcV6Daddr => "sock_common_skc_v6_daddr",
            SockField::SkcNum => "sock_common_skc_num",
            SockField::SkcDport => "sock_common_skc_dport",
            SockField::SkcNet => "sock_common_skc_net",
            SockField::NetNsInum => "net_ns_inum",
            SockField::SkProtocol => "sock_sk_protocol",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Offset table shared with the kernel side through a one-slot array map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelOffsets {
    pub offsets: [u64; SOCK_FIELD_COUNT],
    /// Width in bytes of `sk_protocol`: 1 on kernels where it is a bitfield
    /// byte, 2 once it became a `u16`.
    pub sk_protocol_size: u32,
    pub _pad: u32,
}

impl Default for KernelOffsets {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl KernelOffsets {
    /// Nothing resolved: every field read fails.
    pub const UNKNOWN: Self = Self {
        offsets: [OFFSET_UNKNOWN; SOCK_FIELD_COUNT],
        sk_protocol_size: 2,
        _pad: 0,
    };

    /// Layout of `struct socket`, `struct proto_ops` and `struct sock_common`
    /// on mainstream x86_64 5.x/6.x kernels. `sk_protocol` moves around too
    /// much between builds to guess.
    pub fn typical_x86_64() -> Self {
        let mut offsets = Self::default();
        offsets.set(SockField::SocketType, 4);
        offsets.set(SockField::SocketSk, 24);
        offsets.set(SockField::SocketOps, 32);
        offsets.set(SockField::ProtoOpsFamily, 0);
        offsets.set(SockField::SkcDaddr, 0);
        offsets.set(SockField::SkcRcvSaddr, 4);
        offsets.set(SockField::SkcDport, 12);
        offsets.set(SockField::SkcNum, 14);
        offsets.set(SockField::SkcFamily, 16);
        offsets.set(SockField::SkcNet, 48);
        offsets.set(SockField::SkcV6Daddr, 56);
        offsets.set(SockField::SkcV6RcvSaddr, 72);
        offsets.set(SockField::NetNsInum, 136);
        offsets
    }

    pub fn set(&mut self, field: SockField, offset: u64) {
        self.offsets[field as usize] = offset;
    }

    pub fn get(&self, field: SockField) -> Option<u64> {
        match self.offsets[field as usize] {
            OFFSET_UNKNOWN => None,
            offset => Some(offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    UnknownOffset(SockField),
    NullObject,
    Unreadable,
}

/// Reads a named field of an opaque kernel object.
pub trait FieldAccessor {
    fn read_field(&self, obj: u64, field: SockField, dst: &mut [u8]) -> Result<(), FieldError>;

    /// Width of `sk_protocol` for this kernel.
    fn protocol_width(&self) -> usize {
        2
    }

    fn field_u16(&self, obj: u64, field: SockField) -> Result<u16, FieldError> {
        let mut raw = [0u8; 2];
        self.read_field(obj, field, &mut raw)?;
        Ok(u16::from_ne_bytes(raw))
    }

    fn field_u32(&self, obj: u64, field: SockField) -> Result<u32, FieldError> {
        let mut raw = [0u8; 4];
        self.read_field(obj, field, &mut raw)?;
        Ok(u32::from_ne_bytes(raw))
    }

    /// Reads a pointer field; a NULL pointer is an error.
    fn field_ptr(&self, obj: u64, field: SockField) -> Result<u64, FieldError> {
        let mut raw = [0u8; 8];
        self.read_field(obj, field, &mut raw)?;
        match u64::from_ne_bytes(raw) {
            0 => Err(FieldError::NullObject),
            ptr => Ok(ptr),
        }
    }
}

/// [`FieldAccessor`] over raw memory and an offset table.
pub struct OffsetAccessor<'a, M> {
    memory: M,
    offsets: &'a KernelOffsets,
}

impl<'a, M: MemoryReader> OffsetAccessor<'a, M> {
    pub fn new(memory: M, offsets: &'a KernelOffsets) -> Self {
        Self { memory, offsets }
    }
}

impl<M: MemoryReader> FieldAccessor for OffsetAccessor<'_, M> {
    fn read_field(&self, obj: u64, field: SockField, dst: &mut [u8]) -> Result<(), FieldError> {
        if obj == 0 {
            return Err(FieldError::NullObject);
        }
        let offset = self
            .offsets
            .get(field)
            .ok_or(FieldError::UnknownOffset(field))?;
        self.memory
            .read(obj.wrapping_add(offset), dst)
            .map_err(|_| FieldError::Unreadable)
    }

    fn protocol_width(&self) -> usize {
        match self.offsets.sk_protocol_size {
            1 => 1,
            _ => 2,
        }
    }
}

/// Returns the `struct sock` behind `socket` when it is a stream socket of
/// an inet family; anything else is not tracked.
pub fn stream_inet_sock<A: FieldAccessor>(accessor: &A, socket: u64) -> Option<u64> {
    let sock_type = accessor.field_u16(socket, SockField::SocketType).ok()?;
    if sock_type != SOCK_STREAM {
        return None;
    }
    let ops = accessor.field_ptr(socket, SockField::SocketOps).ok()?;
    let family = accessor.field_u32(ops, SockField::ProtoOpsFamily).ok()? as u16;
    if family != AF_INET && family != AF_INET6 {
        return None;
    }
    accessor.field_ptr(socket, SockField::SocketSk).ok()
}

/// Reads `sk_protocol`, honouring the configured field width.
pub fn sock_protocol<A: FieldAccessor>(accessor: &A, sk: u64) -> Option<u16> {
    let mut raw = [0u8; 2];
    let width = accessor.protocol_width();
    accessor
        .read_field(sk, SockField::SkProtocol, &mut raw[..width])
        .ok()?;
    match width {
        1 => Some(raw[0] as u16),
        _ => Some(u16::from_ne_bytes(raw)),
    }
}

/// Derives the connection identity of `sk` as seen by the thread `key`.
///
/// Endpoint addresses and ports are required; a half-filled tuple (unbound
/// source, zero port) is rejected. The network namespace is best-effort and
/// left at zero when it cannot be read.
pub fn read_conn_tuple<A: FieldAccessor>(
    accessor: &A,
    sk: u64,
    key: ThreadKey,
    protocol: u8,
) -> Option<ConnTuple> {
    let mut tuple = ConnTuple {
        pid: key.pid(),
        protocol,
        ..Default::default()
    };

    match accessor.field_u16(sk, SockField::SkcFamily).ok()? {
        AF_INET => {
            let mut saddr = [0u8; 4];
            let mut daddr = [0u8; 4];
            accessor
                .read_field(sk, SockField::SkcRcvSaddr, &mut saddr)
                .ok()?;
            accessor.read_field(sk, SockField::SkcDaddr, &mut daddr).ok()?;
            if saddr == [0; 4] || daddr == [0; 4] {
                return None;
            }
            tuple.saddr = ipv4_mapped(saddr);
            tuple.daddr = ipv4_mapped(daddr);
        }
        AF_INET6 => {
            accessor
                .read_field(sk, SockField::SkcV6RcvSaddr, &mut tuple.saddr)
                .ok()?;
            accessor
                .read_field(sk, SockField::SkcV6Daddr, &mut tuple.daddr)
                .ok()?;
            if tuple.saddr == [0; 16] || tuple.daddr == [0; 16] {
                return None;
            }
        }
        _ => return None,
    }

    tuple.sport = accessor.field_u16(sk, SockField::SkcNum).ok()?;
    tuple.dport = u16::from_be(accessor.field_u16(sk, SockField::SkcDport).ok()?);
    if tuple.sport == 0 || tuple.dport == 0 {
        return None;
    }

    tuple.netns = accessor
        .field_ptr(sk, SockField::SkcNet)
        .and_then(|net| accessor.field_u32(net, SockField::NetNsInum))
        .unwrap_or(0);

    Some(tuple)
}
