use std::{sync::atomic::Ordering, time::Duration};

use anyhow::Result;
use aya::Ebpf;
use log::{debug, info, warn};
use sockscope_common::ConnCloseEvent;

use crate::maps::ResolverIndex;
use crate::probes::{Probe, attach_in_order, attach_kprobe, shutdown_flag, spawn_ringbuf_handler};
use crate::report::{OutputFormat, Report};
use crate::telemetry;

const RESOLVER_SAMPLE_INTERVAL_SECS: u64 = 15;

/// Retirement first, so nothing is indexed without a way out; the return
/// probe before the entry probe, so no lookup is relayed without a consumer.
const RESOLVER_HOOKS: [(&str, &str); 3] = [
    ("tcp_close", "tcp_close"),
    ("sockfd_lookup_light_ret", "sockfd_lookup_light"),
    ("sockfd_lookup_light", "sockfd_lookup_light"),
];

/// Descriptor -> connection resolution plus the close notifications that
/// retire entries.
pub struct SockfdProbe {
    pub format: OutputFormat,
}

impl Probe for SockfdProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let attached = attach_in_order(&RESOLVER_HOOKS, |program, function| {
            attach_kprobe(bpf, program, function)
        })?;
        if !attached {
            warn!("Socket resolver hooks unavailable; no connection close events");
            return Ok(());
        }

        let format = self.format;
        spawn_ringbuf_handler(bpf, "CONN_CLOSE_EVENTS", move |event: ConnCloseEvent| {
            let report = Report::connection_closed(&event);
            let family = report.family().unwrap_or("unknown");
            telemetry::record_connection_closed(event.tuple.dport, family);
            report.emit(format);
        })?;

        self.spawn_resolver_monitor(bpf)?;

        telemetry::record_active_probe("sockfd", 1);
        info!("SockfdProbe attached successfully");
        Ok(())
    }
}

impl SockfdProbe {
    fn spawn_resolver_monitor(&self, bpf: &mut Ebpf) -> Result<()> {
        let index = ResolverIndex::take(bpf)?;
        let shutdown = shutdown_flag();

        // each key costs a syscall, keep the walk off the async workers
        tokio::task::spawn_blocking(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let entries = index.len();
                debug!("Resolver index holds {} descriptors", entries);
                telemetry::record_resolver_entries(entries as u64);
                std::thread::sleep(Duration::from_secs(RESOLVER_SAMPLE_INTERVAL_SECS));
            }
        });
        Ok(())
    }
}
