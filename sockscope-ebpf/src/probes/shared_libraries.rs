//! open/openat/openat2 tracepoints feeding the library classifier.

use aya_ebpf::{macros::tracepoint, programs::TracePointContext};
use aya_log_ebpf::debug;
use sockscope_common::LibraryClassifier;

use super::{RingSink, Table, UserMemory, current_thread, libset_config, maps::PENDING_OPENS};

// syscalls:sys_enter_* record layout: 8-byte common header, 8-byte
// `__syscall_nr` slot, then one 8-byte slot per argument from offset 16.
const OPEN_FILENAME: usize = 16;
const OPEN_FLAGS: usize = 24;
const OPENAT_FILENAME: usize = 24;
const OPENAT_FLAGS: usize = 32;
const SYS_EXIT_RET: usize = 16;

#[tracepoint]
pub fn sys_enter_open(ctx: TracePointContext) -> u32 {
    match try_open_enter(&ctx, OPEN_FILENAME, Some(OPEN_FLAGS)) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_enter_openat(ctx: TracePointContext) -> u32 {
    match try_open_enter(&ctx, OPENAT_FILENAME, Some(OPENAT_FLAGS)) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

/// Flags live behind the `struct open_how` pointer, so nothing is filtered.
#[tracepoint]
pub fn sys_enter_openat2(ctx: TracePointContext) -> u32 {
    match try_open_enter(&ctx, OPENAT_FILENAME, None) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_open(ctx: TracePointContext) -> u32 {
    match try_open_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_openat(ctx: TracePointContext) -> u32 {
    match try_open_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_openat2(ctx: TracePointContext) -> u32 {
    match try_open_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_open_enter(
    ctx: &TracePointContext,
    filename_offset: usize,
    flags_offset: Option<usize>,
) -> Result<u32, u32> {
    let filename: u64 = unsafe { ctx.read_at(filename_offset).map_err(|_| 1u32)? };
    let flags = match flags_offset {
        Some(offset) => Some(unsafe { ctx.read_at::<u64>(offset).map_err(|_| 1u32)? } as u32),
        None => None,
    };

    let pending = Table(&PENDING_OPENS);
    LibraryClassifier::new(&pending).open_enter(current_thread(), filename, flags, &UserMemory);
    Ok(0)
}

#[inline(always)]
fn try_open_exit(ctx: &TracePointContext) -> Result<u32, u32> {
    let ret: i64 = unsafe { ctx.read_at(SYS_EXIT_RET).map_err(|_| 1u32)? };
    let key = current_thread();

    let pending = Table(&PENDING_OPENS);
    let classifier = LibraryClassifier::new(&pending);
    if let Some(set) = classifier.open_exit(key, ret, &libset_config(), &RingSink) {
        debug!(ctx, "library set {} opened by pid {}", set as u8, key.pid());
    }
    Ok(0)
}
