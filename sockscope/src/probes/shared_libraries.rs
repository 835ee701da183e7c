use anyhow::Result;
use aya::Ebpf;
use log::{info, warn};
use sockscope_common::{LibPath, LibrarySet};

use crate::probes::{Probe, attach_syscall_pair, spawn_ringbuf_handler};
use crate::report::{OutputFormat, Report};
use crate::telemetry;

/// open(2) is absent on arm64; openat2(2) needs 5.6+.
const OPEN_SYSCALLS: [&str; 3] = ["open", "openat", "openat2"];

pub struct SharedLibrariesProbe {
    pub format: OutputFormat,
}

impl Probe for SharedLibrariesProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let mut attached = 0;
        for syscall in OPEN_SYSCALLS {
            if attach_syscall_pair(bpf, syscall)? {
                attached += 1;
            }
        }
        if attached == 0 {
            warn!("No open syscall tracepoints available; shared library probe inactive");
            return Ok(());
        }

        for (map_name, set) in [
            ("CRYPTO_LIBRARIES", LibrarySet::Crypto),
            ("GPU_LIBRARIES", LibrarySet::Gpu),
        ] {
            let format = self.format;
            spawn_ringbuf_handler(bpf, map_name, move |path: LibPath| {
                let report = Report::library_loaded(set, &path);
                if let Report::LibraryLoaded { library_set, comm, .. } = &report {
                    telemetry::record_library_loaded(library_set, comm.as_deref().unwrap_or(""));
                }
                report.emit(format);
            })?;
        }

        telemetry::record_active_probe("shared_libraries", attached);
        info!("SharedLibrariesProbe attached ({} syscalls)", attached);
        Ok(())
    }
}
