//! Blocking-call interception
//!
//! libc-shaped wrappers over the blocking primitives. With hooks off
//! (the per-thread default) every wrapper forwards verbatim, bit for
//! bit. With hooks on, a call on a blocking-mode socket that would
//! block instead arms the fd on the thread's reactor, parks the calling
//! fiber and retries on wake; the worker thread stays busy with other
//! fibers in between.
//!
//! Two error translations exist and only two: EAGAIN and EINTR are
//! absorbed by the retry cycle, and ETIMEDOUT is synthesised when a
//! per-direction timeout elapses. Everything else is the underlying
//! call's errno, untouched.
//!
//! The "real" primitives are the libc symbols themselves, called
//! through the `libc` crate; the per-thread enable flag keeps the
//! forwarding contract observable.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use strand_core::rt_error;
use strand_runtime::scheduler;
use strand_runtime::timer::NEVER;
use strand_runtime::Fiber;

use crate::fd_table::FdTable;
use crate::reactor::{IoEvent, IoScheduler};

thread_local! {
    /// Per-thread hook switch; defaults to off
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread intercepts blocking calls
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable interception on the calling thread
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

/// Default timeout applied by the plain `connect` wrapper
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NEVER);

/// Set the process-wide default connect timeout ([`NEVER`] disables)
pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[inline]
fn set_errno(e: i32) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Status shared between a parked operation and its timeout timer
struct WaitInfo {
    /// 0 while live; ETIMEDOUT once the timer cancelled the wait
    cancelled: AtomicI32,
}

impl WaitInfo {
    fn new() -> Arc<WaitInfo> {
        Arc::new(WaitInfo {
            cancelled: AtomicI32::new(0),
        })
    }
}

/// Install a condition timer that marks `wait` timed out and cancels
/// the armed event, waking the parked fiber
fn timeout_timer(
    iom: &Arc<IoScheduler>,
    wait: &Arc<WaitInfo>,
    timeout_ms: u64,
    fd: c_int,
    event: IoEvent,
) -> Arc<strand_runtime::Timer> {
    let winfo = Arc::downgrade(wait);
    let wiom = Arc::downgrade(iom);
    iom.timers().add_condition_timer(
        timeout_ms,
        Arc::new(move || {
            let Some(info) = winfo.upgrade() else {
                return;
            };
            if info.cancelled.load(Ordering::SeqCst) != 0 {
                return;
            }
            info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
            // cancel wakes the fiber parked on this direction
            if let Some(iom) = wiom.upgrade() {
                iom.cancel_event(fd, event);
            }
        }),
        wait,
        false,
    )
}

/// The shared shim skeleton for the read/write families
///
/// try -> on EAGAIN register + park -> retry on wake. EINTR retries
/// inline; a cached per-direction timeout arms a condition timer whose
/// fire cancels the event and surfaces ETIMEDOUT.
fn do_io<F>(fd: c_int, mut io_call: F, name: &str, event: IoEvent, timeout_so: c_int) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return io_call();
    }

    // untracked fds belong to the kernel alone
    let Some(ctx) = FdTable::instance().get(fd, false) else {
        return io_call();
    };

    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    if !ctx.is_socket() || ctx.user_nonblock() {
        return io_call();
    }

    let timeout = ctx.timeout(timeout_so);
    let wait = WaitInfo::new();

    loop {
        let mut n = io_call();
        while n == -1 && errno() == libc::EINTR {
            n = io_call();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // would block: park on the reactor owning this thread
        let Some(iom) = IoScheduler::current() else {
            return n;
        };

        let timer = if timeout != NEVER {
            Some(timeout_timer(&iom, &wait, timeout, fd, event))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event, None) {
            rt_error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return -1;
        }

        // resumed by readiness, by the timeout timer, or by cancel_all
        Fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        if wait.cancelled.load(Ordering::SeqCst) == libc::ETIMEDOUT {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
        // go around: retry the call
    }
}

// ── sleep family ──

/// Hooked `sleep(3)`: parks the fiber on a one-shot timer
pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    let Some(iom) = IoScheduler::current() else {
        return unsafe { libc::sleep(seconds) };
    };

    sleep_ms(&iom, seconds as u64 * 1000);
    0
}

/// Hooked `usleep(3)`
pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    let Some(iom) = IoScheduler::current() else {
        return unsafe { libc::usleep(usec) };
    };

    sleep_ms(&iom, usec as u64 / 1000);
    0
}

/// Hooked `nanosleep(2)`; millisecond resolution
///
/// # Safety
///
/// `req` must point to a valid timespec; `rem` is ignored (the hooked
/// sleep is never interrupted).
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let Some(iom) = IoScheduler::current() else {
        return libc::nanosleep(req, rem);
    };

    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let timeout_ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    sleep_ms(&iom, timeout_ms);
    0
}

/// Park the current fiber on a one-shot timer that re-enqueues it
///
/// Sleeping tasks carry no thread affinity.
fn sleep_ms(iom: &Arc<IoScheduler>, ms: u64) {
    let fiber = Fiber::current();
    let wiom = Arc::downgrade(iom);
    iom.timers().add_timer(
        ms,
        Arc::new(move || {
            if let Some(iom) = wiom.upgrade() {
                scheduler::schedule_fiber(&iom, fiber.clone(), None);
            }
        }),
        false,
    );
    Fiber::yield_now();
}

// ── socket lifecycle ──

/// Hooked `socket(2)`: registers the new fd in the context table
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        rt_error!("socket({}, {}, {}) failed: errno {}", domain, ty, protocol, errno());
        return fd;
    }
    FdTable::instance().get(fd, true);
    fd
}

/// `connect(2)` with an explicit overall timeout in milliseconds
///
/// "Would block" here is EINPROGRESS on the WRITE direction; once
/// writable, SO_ERROR decides between success and the real errno.
///
/// # Safety
///
/// `addr`/`addrlen` as for `connect(2)`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }

    let Some(ctx) = FdTable::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // in progress: wait for writability
    let Some(iom) = IoScheduler::current() else {
        return n;
    };

    let wait = WaitInfo::new();
    let timer = if timeout_ms != NEVER {
        Some(timeout_timer(&iom, &wait, timeout_ms, fd, IoEvent::Write))
    } else {
        None
    };

    match iom.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::yield_now();

            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = wait.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            rt_error!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // the socket knows whether the connection was established
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect(2)`, using the process-wide default timeout
///
/// # Safety
///
/// As for `connect(2)`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Hooked `accept(2)`: the accepted fd joins the context table
///
/// # Safety
///
/// As for `accept(2)`.
pub unsafe fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(
        sockfd,
        || libc::accept(sockfd, addr, addrlen) as ssize_t,
        "accept",
        IoEvent::Read,
        libc::SO_RCVTIMEO,
    ) as c_int;
    if fd >= 0 {
        FdTable::instance().get(fd, true);
    }
    fd
}

// ── read family ──

/// # Safety
/// As for `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, || libc::read(fd, buf, count), "read", IoEvent::Read, libc::SO_RCVTIMEO)
}

/// # Safety
/// As for `readv(2)`.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || libc::readv(fd, iov, iovcnt), "readv", IoEvent::Read, libc::SO_RCVTIMEO)
}

/// # Safety
/// As for `recv(2)`.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::recv(sockfd, buf, len, flags),
        "recv",
        IoEvent::Read,
        libc::SO_RCVTIMEO,
    )
}

/// # Safety
/// As for `recvfrom(2)`.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen),
        "recvfrom",
        IoEvent::Read,
        libc::SO_RCVTIMEO,
    )
}

/// # Safety
/// As for `recvmsg(2)`.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::recvmsg(sockfd, msg, flags),
        "recvmsg",
        IoEvent::Read,
        libc::SO_RCVTIMEO,
    )
}

// ── write family ──

/// # Safety
/// As for `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, || libc::write(fd, buf, count), "write", IoEvent::Write, libc::SO_SNDTIMEO)
}

/// # Safety
/// As for `writev(2)`.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || libc::writev(fd, iov, iovcnt), "writev", IoEvent::Write, libc::SO_SNDTIMEO)
}

/// # Safety
/// As for `send(2)`.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::send(sockfd, buf, len, flags),
        "send",
        IoEvent::Write,
        libc::SO_SNDTIMEO,
    )
}

/// # Safety
/// As for `sendto(2)`.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen),
        "sendto",
        IoEvent::Write,
        libc::SO_SNDTIMEO,
    )
}

/// # Safety
/// As for `sendmsg(2)`.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::sendmsg(sockfd, msg, flags),
        "sendmsg",
        IoEvent::Write,
        libc::SO_SNDTIMEO,
    )
}

// ── close and fd control ──

/// Hooked `close(2)`: wakes everything parked on the fd, then closes
///
/// Parked fibers resume, retry, and observe EBADF.
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::close(fd) };
    }

    if let Some(ctx) = FdTable::instance().get(fd, false) {
        ctx.set_closed();
        if let Some(iom) = IoScheduler::current() {
            iom.cancel_all(fd);
        }
        FdTable::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl(2)` (single-argument form)
///
/// F_SETFL records the user's O_NONBLOCK wish but keeps the real flag
/// as the hook layer needs it; F_GETFL reports the flag the user asked
/// for, not the forced one. Everything else forwards. Pointer-argument
/// commands pass the pointer through `arg` as one machine word.
pub fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdTable::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // the real flag follows the hook's requirement
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }
                }
                _ => unsafe { libc::fcntl(fd, libc::F_SETFL, flags) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            match FdTable::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    // report what the user asked for, not what we forced
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        libc::F_GETFD | libc::F_GETOWN => unsafe { libc::fcntl(fd, cmd) },
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl(2)`: FIONBIO on a tracked socket records the user's
/// non-blocking wish; the real request always goes through
///
/// # Safety
///
/// As for `ioctl(2)` with a pointer argument.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdTable::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Hooked `getsockopt(2)`: forwards untouched
///
/// # Safety
///
/// As for `getsockopt(2)`.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// Hooked `setsockopt(2)`: caches SO_RCVTIMEO/SO_SNDTIMEO (as ms) on
/// the fd context before forwarding
///
/// # Safety
///
/// As for `setsockopt(2)`.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !is_hook_enabled() {
        return libc::setsockopt(sockfd, level, optname, optval, optlen);
    }

    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = FdTable::instance().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            ctx.set_timeout(optname, tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000);
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_default_off() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        set_hook_enabled(false);
    }

    #[test]
    fn test_disabled_forwards_verbatim() {
        // bad fd goes straight to the kernel and comes back bit for bit
        let mut buf = [0u8; 4];
        let n = unsafe { read(-1, buf.as_mut_ptr() as *mut c_void, 4) };
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EBADF);
    }

    #[test]
    fn test_fcntl_getfl_reflects_user_wish() {
        let fd = socket_with_hooks();

        // context forced O_NONBLOCK, but the user never asked
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        // user asks for nonblocking: reported back
        fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert!(flags & libc::O_NONBLOCK != 0);

        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
        set_hook_enabled(false);
    }

    #[test]
    fn test_ioctl_fionbio_recorded() {
        let fd = socket_with_hooks();

        let mut on: c_int = 1;
        unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void) };
        let ctx = FdTable::instance().get(fd, false).unwrap();
        assert!(ctx.user_nonblock());

        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
        set_hook_enabled(false);
    }

    fn socket_with_hooks() -> c_int {
        set_hook_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        fd
    }
}
