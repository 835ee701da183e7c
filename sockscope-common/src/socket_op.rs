//! `connect(2)` / `bind(2)` tracking on top of the intent cache.
//!
//! The syscall entry only knows the user pointer; the LSM hook further down
//! sees the kernel copy of the address and the socket, so that is where the
//! intent is filled. The exit decides whether the outcome is reported.

use crate::{
    event::{
        EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE, EventKind, EventSink, ProcessContextSource,
        SamplingPolicy, SocketOpEvent,
    },
    intent::{IntentCache, IntentKind, IntentStack},
    memory::MemoryReader,
    sock::{FieldAccessor, SockField, sock_protocol},
    table::KeyedTable,
    tuple::{AF_INET, AF_INET6, ThreadKey, ipv4_mapped},
};

pub const EPERM: i64 = 1;
pub const EACCES: i64 = 13;

const SA_FAMILY_OFFSET: u64 = 0;
const SIN_PORT_OFFSET: u64 = 2;
const SIN_ADDR_OFFSET: u64 = 4;
const SIN6_ADDR_OFFSET: u64 = 8;

impl IntentKind {
    pub const fn event_kind(self) -> EventKind {
        match self {
            IntentKind::Connect => EventKind::Connect,
            IntentKind::Bind => EventKind::Bind,
        }
    }
}

/// Failures other than a policy denial mean the operation never happened in
/// any interesting sense.
pub const fn is_unhandled_error(retval: i64) -> bool {
    retval < 0 && retval != -EACCES && retval != -EPERM
}

pub struct SocketOpTracker<'a, T> {
    intents: IntentCache<'a, T>,
}

impl<'a, T: KeyedTable<ThreadKey, IntentStack>> SocketOpTracker<'a, T> {
    pub const fn new(table: &'a T) -> Self {
        Self {
            intents: IntentCache::new(table),
        }
    }

    /// Syscall entry. Calls without an address are not tracked.
    pub fn sys_enter(&self, key: ThreadKey, kind: IntentKind, sockaddr: u64) -> bool {
        if sockaddr == 0 {
            return false;
        }
        self.intents.push(key, kind)
    }

    /// LSM hook: fills the pending intent from the kernel copy of the
    /// address and from the socket itself.
    pub fn security_hook<M: MemoryReader, A: FieldAccessor>(
        &self,
        key: ThreadKey,
        kind: IntentKind,
        socket: u64,
        sockaddr: u64,
        memory: &M,
        accessor: &A,
    ) -> bool {
        self.intents.peek(key, kind, |intent| {
            let Ok(family) = memory.read_u16(sockaddr + SA_FAMILY_OFFSET) else {
                return;
            };
            intent.family = family;
            match family {
                AF_INET => {
                    let mut addr = [0u8; 4];
                    if memory.read(sockaddr + SIN_ADDR_OFFSET, &mut addr).is_ok() {
                        intent.addr = ipv4_mapped(addr);
                    }
                    if let Ok(port) = memory.read_u16(sockaddr + SIN_PORT_OFFSET) {
                        intent.port = u16::from_be(port);
                    }
                }
                AF_INET6 => {
                    let mut addr = [0u8; 16];
                    if memory.read(sockaddr + SIN6_ADDR_OFFSET, &mut addr).is_ok() {
                        intent.addr = addr;
                    }
                    if let Ok(port) = memory.read_u16(sockaddr + SIN_PORT_OFFSET) {
                        intent.port = u16::from_be(port);
                    }
                }
                _ => {}
            }
            if let Some(protocol) = accessor
                .field_ptr(socket, SockField::SocketSk)
                .ok()
                .and_then(|sk| sock_protocol(accessor, sk))
            {
                intent.protocol = protocol;
            }
        })
    }

    /// Syscall exit. Returns the emitted event, if any.
    pub fn sys_exit<C, P, S>(
        &self,
        key: ThreadKey,
        kind: IntentKind,
        retval: i64,
        context: &C,
        sampling: &P,
        sink: &S,
    ) -> Option<SocketOpEvent>
    where
        C: ProcessContextSource,
        P: SamplingPolicy,
        S: EventSink,
    {
        let intent = self.intents.pop(key, kind)?;
        if is_unhandled_error(retval) {
            return None;
        }

        let event_kind = kind.event_kind();
        let mut event = SocketOpEvent {
            process: context.process_context(key),
            retval,
            addr: intent.addr,
            family: intent.family,
            port: intent.port,
            protocol: intent.protocol,
            kind: event_kind as u8,
            flags: 0,
        };
        if sampling.is_sampled(key.pid(), event_kind) {
            event.flags |= EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE;
        }
        sink.socket_operation(&event);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FixedTable;
    use crate::testing::{FakeKernel, FakeMemory, FixedContext, RecordingSink, SampledPids, SockShape};
    use crate::tuple::IPPROTO_TCP;

    type Table = FixedTable<ThreadKey, IntentStack, 4>;

    const KEY: ThreadKey = ThreadKey::new(900, 901);
    const SOCKADDR: u64 = 0xffff_c900_0000_0000;

    fn sockaddr_in(port: u16, addr: [u8; 4]) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[..2].copy_from_slice(&AF_INET.to_ne_bytes());
        raw[2..4].copy_from_slice(&port.to_be_bytes());
        raw[4..8].copy_from_slice(&addr);
        raw
    }

    fn sockaddr_in6(port: u16, addr: [u8; 16]) -> [u8; 28] {
        let mut raw = [0u8; 28];
        raw[..2].copy_from_slice(&AF_INET6.to_ne_bytes());
        raw[2..4].copy_from_slice(&port.to_be_bytes());
        raw[8..24].copy_from_slice(&addr);
        raw
    }

    #[test]
    fn test_connect_flow_emits_filled_event() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        let sink = RecordingSink::default();
        let mut kernel = FakeKernel::new();
        let sock = kernel.add_socket(SockShape::tcp4([10, 0, 0, 1], 1, [10, 0, 0, 2], 2));
        kernel.memory.map(SOCKADDR, &sockaddr_in(443, [93, 184, 216, 34]));

        assert!(tracker.sys_enter(KEY, IntentKind::Connect, 0x7fff_1000));
        assert!(tracker.security_hook(
            KEY,
            IntentKind::Connect,
            sock.socket,
            SOCKADDR,
            &kernel.memory,
            &kernel.accessor(),
        ));
        let event = tracker
            .sys_exit(KEY, IntentKind::Connect, 0, &FixedContext, &SampledPids(&[]), &sink)
            .unwrap();

        assert_eq!(event.kind, EventKind::Connect as u8);
        assert_eq!(event.family, AF_INET);
        assert_eq!(event.port, 443);
        assert_eq!(event.addr, ipv4_mapped([93, 184, 216, 34]));
        assert_eq!(event.protocol, IPPROTO_TCP as u16);
        assert_eq!(event.process.pid, 900);
        assert_eq!(event.process.cgroup_id, FixedContext::CGROUP_ID);
        assert_eq!(event.flags, 0);
        assert_eq!(sink.socket_ops.borrow().len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bind_ipv6_with_sampling() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        let sink = RecordingSink::default();
        let mut kernel = FakeKernel::new();
        let sock = kernel.add_socket(SockShape::tcp6([1; 16], 1, [2; 16], 2));
        let addr = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7];
        kernel.memory.map(SOCKADDR, &sockaddr_in6(8080, addr));

        tracker.sys_enter(KEY, IntentKind::Bind, 0x7fff_1000);
        tracker.security_hook(KEY, IntentKind::Bind, sock.socket, SOCKADDR, &kernel.memory, &kernel.accessor());
        let event = tracker
            .sys_exit(KEY, IntentKind::Bind, 0, &FixedContext, &SampledPids(&[900]), &sink)
            .unwrap();

        assert_eq!(event.kind, EventKind::Bind as u8);
        assert_eq!(event.addr, addr);
        assert_eq!(event.port, 8080);
        assert_eq!(event.flags & EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE, EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE);
    }

    #[test]
    fn test_unpeeked_intent_reports_defaults() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        let sink = RecordingSink::default();

        tracker.sys_enter(KEY, IntentKind::Connect, 0x7fff_1000);
        let event = tracker
            .sys_exit(KEY, IntentKind::Connect, -EACCES, &FixedContext, &SampledPids(&[]), &sink)
            .unwrap();
        assert_eq!(event.retval, -EACCES);
        assert_eq!(event.port, 0);
        assert_eq!(event.family, 0);
        assert_eq!(event.addr, [0; 16]);
    }

    #[test]
    fn test_unhandled_error_emits_nothing_but_clears_intent() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        let sink = RecordingSink::default();

        tracker.sys_enter(KEY, IntentKind::Connect, 0x7fff_1000);
        // ECONNREFUSED
        assert!(tracker
            .sys_exit(KEY, IntentKind::Connect, -111, &FixedContext, &SampledPids(&[]), &sink)
            .is_none());
        assert!(sink.socket_ops.borrow().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_null_sockaddr_is_not_tracked() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        assert!(!tracker.sys_enter(KEY, IntentKind::Connect, 0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unreadable_sockaddr_keeps_defaults() {
        let table = Table::new();
        let tracker = SocketOpTracker::new(&table);
        let sink = RecordingSink::default();
        let memory = FakeMemory::default();
        let kernel = FakeKernel::new();

        tracker.sys_enter(KEY, IntentKind::Connect, 0x7fff_1000);
        tracker.security_hook(KEY, IntentKind::Connect, 0, SOCKADDR, &memory, &kernel.accessor());
        let event = tracker
            .sys_exit(KEY, IntentKind::Connect, 0, &FixedContext, &SampledPids(&[]), &sink)
            .unwrap();
        assert_eq!(event.family, 0);
        assert_eq!(event.protocol, 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(!is_unhandled_error(0));
        assert!(!is_unhandled_error(-EPERM));
        assert!(!is_unhandled_error(-EACCES));
        // EINPROGRESS on a non-blocking connect
        assert!(is_unhandled_error(-115));
    }
}
