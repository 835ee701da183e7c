//! Descriptor -> connection resolution and teardown.
//!
//! `sockfd_lookup_light(int fd, int *err, int *fput_needed)` is on the path of
//! every socket syscall that takes a descriptor, which makes it the cheapest
//! place to learn which `struct socket` an fd refers to.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::debug;
use sockscope_common::{SocketResolver, TeardownNotifier};

use super::{
    RingSink, Table, current_thread, kernel_accessor,
    maps::{PID_FD_BY_TUPLE, SOCKFD_LOOKUP_ARGS, TUPLE_BY_PID_FD},
};

#[kprobe]
pub fn sockfd_lookup_light(ctx: ProbeContext) -> u32 {
    match try_sockfd_lookup_entry(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[kretprobe]
pub fn sockfd_lookup_light_ret(ctx: RetProbeContext) -> u32 {
    match try_sockfd_lookup_exit(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

/// `void tcp_close(struct sock *sk, long timeout)`
#[kprobe]
pub fn tcp_close(ctx: ProbeContext) -> u32 {
    match try_tcp_close(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[inline(always)]
fn try_sockfd_lookup_entry(ctx: &ProbeContext) -> Result<u32, u32> {
    let fd: i32 = ctx.arg(0).ok_or(1u32)?;

    let forward = Table(&TUPLE_BY_PID_FD);
    let reverse = Table(&PID_FD_BY_TUPLE);
    let lookups = Table(&SOCKFD_LOOKUP_ARGS);
    SocketResolver::new(&forward, &reverse, &lookups).lookup_entry(current_thread(), fd);
    Ok(0)
}

#[inline(always)]
fn try_sockfd_lookup_exit(ctx: &RetProbeContext) -> Result<u32, u32> {
    let key = current_thread();
    let forward = Table(&TUPLE_BY_PID_FD);
    let reverse = Table(&PID_FD_BY_TUPLE);
    let lookups = Table(&SOCKFD_LOOKUP_ARGS);
    let resolver = SocketResolver::new(&forward, &reverse, &lookups);

    let Some(accessor) = kernel_accessor() else {
        // still consume the pending lookup
        let _ = SOCKFD_LOOKUP_ARGS.remove(&key);
        return Ok(0);
    };
    let socket: u64 = ctx.ret().unwrap_or(0);
    if let Some(tuple) = resolver.lookup_return(key, socket, &accessor) {
        debug!(ctx, "pid {} resolved fd to port {}", key.pid(), tuple.dport);
    }
    Ok(0)
}

#[inline(always)]
fn try_tcp_close(ctx: &ProbeContext) -> Result<u32, u32> {
    let sk: u64 = ctx.arg(0).ok_or(1u32)?;
    let accessor = kernel_accessor().ok_or(1u32)?;

    let forward = Table(&TUPLE_BY_PID_FD);
    let reverse = Table(&PID_FD_BY_TUPLE);
    let key = current_thread();
    if TeardownNotifier::new(&forward, &reverse).on_close(key, sk, &accessor, &RingSink) {
        debug!(ctx, "connection closed by pid {}", key.pid());
    }
    Ok(0)
}
