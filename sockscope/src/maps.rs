//! Loader-side writes into the configuration maps, done once before any
//! program is attached.

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{Array, HashMap, MapData},
};
use log::info;
use sockscope_common::{ConnTuple, KernelOffsets, LibsetConfig, PidFd, RESOLVER_MAX_ENTRIES};

use crate::settings::Settings;

pub fn configure(bpf: &mut Ebpf, settings: &Settings) -> Result<()> {
    write_libset_config(bpf, settings.to_libset_config())?;
    write_kernel_offsets(bpf, settings.to_kernel_offsets()?)?;
    write_traced_pids(bpf, &settings.activity_dump.pids, settings.activity_dump_mask()?)?;
    Ok(())
}

fn write_libset_config(bpf: &mut Ebpf, config: LibsetConfig) -> Result<()> {
    let mut array: Array<_, LibsetConfig> = bpf
        .map_mut("LIBSET_CONFIG")
        .context("Failed to find LIBSET_CONFIG map")?
        .try_into()
        .context("LIBSET_CONFIG is not an Array")?;
    array.set(0, config, 0)?;
    info!(
        "Library sets: crypto={} gpu={}",
        config.crypto_enabled != 0,
        config.gpu_enabled != 0
    );
    Ok(())
}

fn write_kernel_offsets(bpf: &mut Ebpf, offsets: KernelOffsets) -> Result<()> {
    let mut array: Array<_, KernelOffsets> = bpf
        .map_mut("KERNEL_OFFSETS")
        .context("Failed to find KERNEL_OFFSETS map")?
        .try_into()
        .context("KERNEL_OFFSETS is not an Array")?;
    array.set(0, offsets, 0)?;
    Ok(())
}

fn write_traced_pids(bpf: &mut Ebpf, pids: &[u32], mask: u64) -> Result<()> {
    if pids.is_empty() {
        return Ok(());
    }
    let mut traced: HashMap<_, u32, u64> = bpf
        .map_mut("TRACED_PIDS")
        .context("Failed to find TRACED_PIDS map")?
        .try_into()
        .context("TRACED_PIDS is not a HashMap")?;
    for pid in pids {
        traced.insert(pid, mask, 0)?;
    }
    info!("Activity dump sampling {} pid(s), event mask {:#x}", pids.len(), mask);
    Ok(())
}

fn clamp_to_capacity(walked: usize) -> usize {
    walked.min(RESOLVER_MAX_ENTRIES as usize)
}

/// Read-only handle on the descriptor -> connection index, for sizing.
pub struct ResolverIndex {
    map: HashMap<MapData, PidFd, ConnTuple>,
}

impl ResolverIndex {
    pub fn take(bpf: &mut Ebpf) -> Result<Self> {
        let map = HashMap::try_from(
            bpf.take_map("TUPLE_BY_PID_FD")
                .context("Failed to find TUPLE_BY_PID_FD map")?,
        )?;
        Ok(Self { map })
    }

    /// Approximate: a key deleted mid-walk restarts the kernel iteration,
    /// so the count is capped at the map capacity.
    pub fn len(&self) -> usize {
        let walked = self
            .map
            .keys()
            .filter(|k| k.is_ok())
            .take(RESOLVER_MAX_ENTRIES as usize + 1)
            .count();
        clamp_to_capacity(walked)
    }
}
