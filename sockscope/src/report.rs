//! Decoded, printable forms of the records drained from the ring buffers.

use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

use chrono::{SecondsFormat, Utc};
use log::{info, warn};
use serde::Serialize;
use sockscope_common::{
    ConnCloseEvent, EventKind, LibPath, LibrarySet, SocketOpEvent,
    event::{EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE, Termination},
    tuple::{AF_INET, AF_INET6, IPPROTO_TCP, IPPROTO_UDP},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Log,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { OutputFormat::Json } else { OutputFormat::Log }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Report {
    LibraryLoaded {
        timestamp: String,
        library_set: &'static str,
        pid: u32,
        comm: Option<String>,
        path: String,
    },
    ConnectionClosed {
        timestamp: String,
        pid: u32,
        netns: u32,
        protocol: &'static str,
        source: SocketAddr,
        destination: SocketAddr,
        definitive: bool,
    },
    SocketOperation {
        timestamp: String,
        operation: &'static str,
        pid: u32,
        tid: u32,
        comm: String,
        cgroup_id: u64,
        retval: i64,
        address: Option<SocketAddr>,
        family: u16,
        protocol: &'static str,
        sampled: bool,
    },
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn protocol_name(protocol: u16) -> &'static str {
    match protocol {
        p if p == IPPROTO_TCP as u16 => "tcp",
        p if p == IPPROTO_UDP as u16 => "udp",
        0 => "unknown",
        _ => "other",
    }
}

fn library_set_name(set: LibrarySet) -> &'static str {
    match set {
        LibrarySet::Crypto => "crypto",
        LibrarySet::Gpu => "gpu",
    }
}

/// `/proc/<pid>/comm` of a process that may already be gone.
fn process_comm(pid: u32) -> Option<String> {
    procfs::process::Process::new(pid as i32)
        .and_then(|p| p.stat())
        .map(|stat| stat.comm)
        .ok()
}

impl Report {
    pub fn library_loaded(set: LibrarySet, path: &LibPath) -> Self {
        Report::LibraryLoaded {
            timestamp: now(),
            library_set: library_set_name(set),
            pid: path.pid,
            comm: process_comm(path.pid),
            path: String::from_utf8_lossy(path.as_bytes()).into_owned(),
        }
    }

    pub fn connection_closed(event: &ConnCloseEvent) -> Self {
        let tuple = &event.tuple;
        Report::ConnectionClosed {
            timestamp: now(),
            pid: tuple.pid,
            netns: tuple.netns,
            protocol: protocol_name(tuple.protocol as u16),
            source: SocketAddr::new(tuple.source(), tuple.sport),
            destination: SocketAddr::new(tuple.destination(), tuple.dport),
            definitive: Termination::from_raw(event.termination) == Some(Termination::Definitive),
        }
    }

    pub fn socket_operation(event: &SocketOpEvent) -> Self {
        let address = match event.family {
            AF_INET | AF_INET6 => {
                let ip = Ipv6Addr::from(event.addr).to_canonical();
                Some(SocketAddr::new(ip, event.port))
            }
            _ => None,
        };
        let operation = if event.kind == EventKind::Bind as u8 {
            EventKind::Bind.name()
        } else {
            EventKind::Connect.name()
        };
        Report::SocketOperation {
            timestamp: now(),
            operation,
            pid: event.process.pid,
            tid: event.process.tid,
            comm: c_str(&event.process.comm),
            cgroup_id: event.process.cgroup_id,
            retval: event.retval,
            address,
            family: event.family,
            protocol: protocol_name(event.protocol),
            sampled: event.flags & EVENT_FLAGS_ACTIVITY_DUMP_SAMPLE != 0,
        }
    }

    pub fn emit(&self, format: OutputFormat) {
        match format {
            OutputFormat::Log => info!("{}", self),
            OutputFormat::Json => match serde_json::to_string(self) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            },
        }
    }
}

fn family_label(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ipv4",
        IpAddr::V6(_) => "ipv6",
    }
}

impl Report {
    /// Low-cardinality label for metrics.
    pub fn family(&self) -> Option<&'static str> {
        match self {
            Report::ConnectionClosed { destination, .. } => Some(family_label(&destination.ip())),
            Report::SocketOperation { address: Some(addr), .. } => Some(family_label(&addr.ip())),
            _ => None,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::LibraryLoaded {
                library_set,
                pid,
                comm,
                path,
                ..
            } => write!(
                f,
                "LIBRARY_LOADED set={} pid={} comm={} path={}",
                library_set,
                pid,
                comm.as_deref().unwrap_or("<exited>"),
                path
            ),
            Report::ConnectionClosed {
                pid,
                netns,
                protocol,
                source,
                destination,
                ..
            } => write!(
                f,
                "CONNECTION_CLOSED pid={} {} {} -> {} netns={}",
                pid, protocol, source, destination, netns
            ),
            Report::SocketOperation {
                operation,
                pid,
                comm,
                cgroup_id,
                retval,
                address,
                protocol,
                sampled,
                ..
            } => {
                write!(
                    f,
                    "SOCKET_{} pid={} comm={} {} addr=",
                    operation.to_uppercase(),
                    pid,
                    comm,
                    protocol
                )?;
                match address {
                    Some(addr) => write!(f, "{}", addr)?,
                    None => f.write_str("-")?,
                }
                write!(f, " ret={} cgroup={}", retval, cgroup_id)?;
                if *sampled {
                    f.write_str(" sampled")?;
                }
                Ok(())
            }
        }
    }
}
