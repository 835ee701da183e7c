pub mod maps;
pub mod probes;
pub mod report;
pub mod settings;
pub mod telemetry;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{info, warn};
use tokio::signal;

use crate::probes::{Probe, SharedLibrariesProbe, SockfdProbe, SocketOpsProbe, request_shutdown};
use crate::report::OutputFormat;
use crate::settings::Settings;

pub struct SockScopeEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl SockScopeEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        maps::configure(&mut bpf, &settings)?;
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        self.attach_probes()?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        request_shutdown();

        Ok(())
    }

    fn attach_probes(&mut self) -> Result<()> {
        let format = OutputFormat::from_json_flag(self.settings.json_output());
        let probes = &self.settings.probes;

        if probes.sockfd.unwrap_or(true) {
            SockfdProbe { format }.attach(&mut self.bpf)?;
        }

        if probes.shared_libraries.unwrap_or(true) {
            SharedLibrariesProbe { format }.attach(&mut self.bpf)?;
        }

        let connect = probes.connect.unwrap_or(false);
        let bind = probes.bind.unwrap_or(false);
        if connect || bind {
            SocketOpsProbe {
                connect,
                bind,
                format,
            }
            .attach(&mut self.bpf)?;
        }

        Ok(())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
