use aya_ebpf::{
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use sockscope_common::{IntentKind, KernelOffsets, OffsetAccessor, SocketOpTracker};

use super::{
    CurrentTask, KernelMemory, RingSink, Table, TracedPids, current_thread, kernel_accessor,
    maps::SOCKET_INTENTS,
};

// sys_enter_connect / sys_enter_bind: fd, then the user sockaddr pointer
const SYS_ENTER_SOCKADDR: usize = 24;
const SYS_EXIT_RET: usize = 16;

#[tracepoint]
pub fn sys_enter_connect(ctx: TracePointContext) -> u32 {
    match try_sys_enter(&ctx, IntentKind::Connect) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_connect(ctx: TracePointContext) -> u32 {
    match try_sys_exit(&ctx, IntentKind::Connect) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_enter_bind(ctx: TracePointContext) -> u32 {
    match try_sys_enter(&ctx, IntentKind::Bind) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_bind(ctx: TracePointContext) -> u32 {
    match try_sys_exit(&ctx, IntentKind::Bind) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

/// `int security_socket_connect(struct socket *sock, struct sockaddr *address, int addrlen)`
#[kprobe]
pub fn security_socket_connect(ctx: ProbeContext) -> u32 {
    match try_security_hook(&ctx, IntentKind::Connect) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

/// `int security_socket_bind(struct socket *sock, struct sockaddr *address, int addrlen)`
#[kprobe]
pub fn security_socket_bind(ctx: ProbeContext) -> u32 {
    match try_security_hook(&ctx, IntentKind::Bind) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_sys_enter(ctx: &TracePointContext, kind: IntentKind) -> Result<u32, u32> {
    let sockaddr: u64 = unsafe { ctx.read_at(SYS_ENTER_SOCKADDR).map_err(|_| 1u32)? };
    let intents = Table(&SOCKET_INTENTS);
    SocketOpTracker::new(&intents).sys_enter(current_thread(), kind, sockaddr);
    Ok(0)
}

#[inline(always)]
fn try_security_hook(ctx: &ProbeContext, kind: IntentKind) -> Result<u32, u32> {
    let socket: u64 = ctx.arg(0).ok_or(1u32)?;
    let sockaddr: u64 = ctx.arg(1).ok_or(1u32)?;
    // without offsets the address is still worth having
    let accessor = kernel_accessor()
        .unwrap_or_else(|| OffsetAccessor::new(KernelMemory, &KernelOffsets::UNKNOWN));

    let intents = Table(&SOCKET_INTENTS);
    SocketOpTracker::new(&intents).security_hook(
        current_thread(),
        kind,
        socket,
        sockaddr,
        &KernelMemory,
        &accessor,
    );
    Ok(0)
}

#[inline(always)]
fn try_sys_exit(ctx: &TracePointContext, kind: IntentKind) -> Result<u32, u32> {
    let retval: i64 = unsafe { ctx.read_at(SYS_EXIT_RET).map_err(|_| 1u32)? };
    let key = current_thread();

    let intents = Table(&SOCKET_INTENTS);
    let tracker = SocketOpTracker::new(&intents);
    if let Some(event) = tracker.sys_exit(key, kind, retval, &CurrentTask, &TracedPids, &RingSink) {
        debug!(ctx, "socket op {} pid {} ret {}", event.kind, key.pid(), retval);
    }
    Ok(0)
}
