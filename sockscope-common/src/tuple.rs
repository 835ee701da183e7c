//! Connection and descriptor identities.

use core::net::{IpAddr, Ipv6Addr};

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;
pub const SOCK_STREAM: u16 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// `pid_tgid` as returned by the current-task helper: tgid in the upper half,
/// thread id in the lower half.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ThreadKey(pub u64);

impl ThreadKey {
    pub const fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self(pid_tgid)
    }

    pub const fn new(pid: u32, tid: u32) -> Self {
        Self(((pid as u64) << 32) | tid as u64)
    }

    /// User-mode process id (tgid).
    pub const fn pid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn tid(self) -> u32 {
        self.0 as u32
    }
}

/// A process-local descriptor. Only meaningful while the descriptor is open.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PidFd {
    pub pid: u32,
    pub fd: u32,
}

impl PidFd {
    pub const fn new(pid: u32, fd: u32) -> Self {
        Self { pid, fd }
    }
}

/// Addressing identity of one transport connection.
///
/// Used as a map key, so every byte is accounted for: padding is explicit and
/// always zero, making byte equality and field equality the same thing.
/// IPv4 addresses are stored IPv4-mapped, ports in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub protocol: u8,
    pub _pad: [u8; 3],
}

impl ConnTuple {
    pub fn source(&self) -> IpAddr {
        canonical(self.saddr)
    }

    pub fn destination(&self) -> IpAddr {
        canonical(self.daddr)
    }

    pub fn is_ipv4(&self) -> bool {
        is_ipv4_mapped(&self.saddr) && is_ipv4_mapped(&self.daddr)
    }
}

/// `::ffff:a.b.c.d`
pub const fn ipv4_mapped(addr: [u8; 4]) -> [u8; 16] {
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, addr[0], addr[1], addr[2], addr[3],
    ]
}

pub fn is_ipv4_mapped(addr: &[u8; 16]) -> bool {
    addr[..10].iter().all(|b| *b == 0) && addr[10] == 0xff && addr[11] == 0xff
}

fn canonical(addr: [u8; 16]) -> IpAddr {
    Ipv6Addr::from(addr).to_canonical()
}
