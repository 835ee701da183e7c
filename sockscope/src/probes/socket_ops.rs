use anyhow::Result;
use aya::Ebpf;
use log::{info, warn};
use sockscope_common::SocketOpEvent;

use crate::probes::{Probe, attach_kprobe, attach_syscall_pair, spawn_ringbuf_handler};
use crate::report::{OutputFormat, Report};
use crate::telemetry;

/// connect(2)/bind(2) outcomes, with the address taken from the LSM hook.
pub struct SocketOpsProbe {
    pub connect: bool,
    pub bind: bool,
    pub format: OutputFormat,
}

impl Probe for SocketOpsProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let mut attached = 0;
        for (enabled, syscall) in [(self.connect, "connect"), (self.bind, "bind")] {
            if !enabled {
                continue;
            }
            let hook = format!("security_socket_{}", syscall);
            // without the LSM hook events still flow, minus the address
            if !attach_kprobe(bpf, &hook, &hook)? {
                warn!("{} unavailable; {} events carry no address", hook, syscall);
            }
            if attach_syscall_pair(bpf, syscall)? {
                attached += 1;
            } else {
                warn!("{} syscall tracepoints missing; no {} events", syscall, syscall);
            }
        }
        if attached == 0 {
            return Ok(());
        }

        let format = self.format;
        spawn_ringbuf_handler(bpf, "SOCKET_OP_EVENTS", move |event: SocketOpEvent| {
            let report = Report::socket_operation(&event);
            if let Report::SocketOperation {
                operation,
                retval,
                sampled,
                cgroup_id,
                ..
            } = &report
            {
                telemetry::record_socket_operation(operation, *retval == 0, *sampled, *cgroup_id);
            }
            report.emit(format);
        })?;

        telemetry::record_active_probe("socket_ops", attached);
        info!("SocketOpsProbe attached ({} operations)", attached);
        Ok(())
    }
}
