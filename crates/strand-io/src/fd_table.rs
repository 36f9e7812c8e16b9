//! Per-descriptor context table
//!
//! The process-wide singleton the interception layer consults: for each
//! tracked fd, whether it is a socket, whether the *user* asked for
//! non-blocking mode (the hooks force the real flag on sockets), and
//! the per-direction timeouts cached from `setsockopt`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use strand_runtime::timer::NEVER;

/// Initial size of the context table
const INITIAL_SLOTS: usize = 64;

/// Metadata for one descriptor
///
/// Fields are written once at init; the timeout setters race only with
/// themselves (last write wins, which is the syscall semantics anyway).
pub struct FdCtx {
    fd: libc::c_int,
    is_init: bool,
    is_socket: bool,
    /// The hook layer forced O_NONBLOCK on the real fd
    sys_nonblock: AtomicBool,
    /// What user code asked for via fcntl/ioctl
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Stat the fd; if it is a socket, force the real descriptor into
    /// non-blocking mode while remembering that the user never asked.
    fn new(fd: libc::c_int) -> FdCtx {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut statbuf) } == -1 {
            (false, false)
        } else {
            (true, statbuf.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let sys_nonblock = if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            true
        } else {
            false
        };

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NEVER),
            send_timeout_ms: AtomicU64::new(NEVER),
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Cache a timeout by socket option name (SO_RCVTIMEO / SO_SNDTIMEO)
    pub fn set_timeout(&self, optname: libc::c_int, ms: u64) {
        if optname == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }

    /// Cached timeout by socket option name; [`NEVER`] when unset
    pub fn timeout(&self, optname: libc::c_int) -> u64 {
        if optname == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.send_timeout_ms.load(Ordering::Relaxed)
        }
    }
}

/// The process-wide fd context table
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static INSTANCE: OnceLock<FdTable> = OnceLock::new();

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// The singleton
    pub fn instance() -> &'static FdTable {
        INSTANCE.get_or_init(FdTable::new)
    }

    /// Shared handle to the context for `fd`, creating one when asked
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            let grown = std::cmp::max(idx + 1, idx + idx / 2);
            slots.resize(grown, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the table's reference for `fd`
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_without_auto_create() {
        // high fd nobody registered
        assert!(FdTable::instance().get(4090, false).is_none());
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = FdTable::instance().get(fd, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        // the kernel-side flag really got set
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        FdTable::instance().del(fd);
        assert!(FdTable::instance().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_untouched() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = FdTable::instance().get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        FdTable::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeout_cache() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        let ctx = FdTable::instance().get(fd, true).unwrap();

        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), NEVER);
        ctx.set_timeout(libc::SO_RCVTIMEO, 100);
        ctx.set_timeout(libc::SO_SNDTIMEO, 250);
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 100);
        assert_eq!(ctx.timeout(libc::SO_SNDTIMEO), 250);

        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
    }
}
