use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::RingBuf,
    programs::{KProbe, TracePoint},
};
use log::{info, warn};

pub mod shared_libraries;
pub mod socket_ops;
pub mod sockfd;

pub use shared_libraries::SharedLibrariesProbe;
pub use socket_ops::SocketOpsProbe;
pub use sockfd::SockfdProbe;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

pub fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Attaches the exit side first so an entry is never recorded without
/// something to consume it. Returns false if either side is missing.
pub fn attach_syscall_pair(bpf: &mut Ebpf, syscall: &str) -> Result<bool> {
    let enter = format!("sys_enter_{}", syscall);
    let exit = format!("sys_exit_{}", syscall);
    if !tracepoint_exists("syscalls", &enter) {
        warn!("Tracepoint syscalls:{} not available; skipping {}", enter, syscall);
        return Ok(false);
    }
    let attached = attach_tracepoint(
        bpf,
        TracepointConfig {
            program_name: &exit,
            category: "syscalls",
            name: &exit,
        },
    )? && attach_tracepoint(
        bpf,
        TracepointConfig {
            program_name: &enter,
            category: "syscalls",
            name: &enter,
        },
    )?;
    Ok(attached)
}

/// Loads `program_name` and attaches it to `function`. Works for both
/// kprobes and kretprobes; the program section decides which. Returns false
/// when the kernel has no probe-able `function` (static, inlined or removed).
pub fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, function: &str) -> Result<bool> {
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()
        .context("Program is not a KProbe")?;

    program.load()?;
    if let Err(e) = program.attach(function, 0) {
        warn!(
            "Kernel function {} not probe-able; skipping {}: {}",
            function, program_name, e
        );
        return Ok(false);
    }

    info!("Attached {} to {}", program_name, function);
    Ok(true)
}

/// Runs `attach` over `steps` in order and stops at the first one that is
/// unavailable, so later hooks never run without the earlier ones. Returns
/// true only when every step attached.
pub fn attach_in_order<'a, F>(steps: &[(&'a str, &'a str)], mut attach: F) -> Result<bool>
where
    F: FnMut(&'a str, &'a str) -> Result<bool>,
{
    for &(program_name, function) in steps {
        if !attach(program_name, function)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: [(&str, &str); 3] = [
        ("tcp_close", "tcp_close"),
        ("sockfd_lookup_light_ret", "sockfd_lookup_light"),
        ("sockfd_lookup_light", "sockfd_lookup_light"),
    ];

    #[test]
    fn test_attach_in_order_attaches_everything() {
        let mut seen = Vec::new();
        let attached = attach_in_order(&STEPS, |program, _| {
            seen.push(program);
            Ok(true)
        })
        .unwrap();

        assert!(attached);
        assert_eq!(
            seen,
            ["tcp_close", "sockfd_lookup_light_ret", "sockfd_lookup_light"]
        );
    }

    #[test]
    fn test_missing_function_skips_the_rest() {
        let mut seen = Vec::new();
        let attached = attach_in_order(&STEPS, |program, function| {
            seen.push(program);
            Ok(function != "sockfd_lookup_light")
        })
        .unwrap();

        assert!(!attached);
        // the lookup entry hook never runs without its return hook
        assert_eq!(seen, ["tcp_close", "sockfd_lookup_light_ret"]);
    }

    #[test]
    fn test_missing_first_step_attaches_nothing_else() {
        let mut calls = 0;
        let attached = attach_in_order(&STEPS, |_, _| {
            calls += 1;
            Ok(false)
        })
        .unwrap();

        assert!(!attached);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_load_error_still_propagates() {
        let result = attach_in_order(&STEPS, |program, _| {
            if program == "sockfd_lookup_light_ret" {
                anyhow::bail!("verifier rejected {}", program);
            }
            Ok(true)
        });
        assert!(result.is_err());
    }
}
