//! The I/O reactor
//!
//! `IoScheduler` fuses the worker-pool scheduler with the timer heap
//! over an edge-triggered epoll instance. Worker idle fibers block in
//! `epoll_wait` (capped by the earliest timer deadline); readiness or
//! expiry turns into ordinary scheduled work.
//!
//! Per fd the reactor keeps an entry with the currently armed direction
//! mask and, per direction, a continuation: either a callback or the
//! fiber that parked itself. Entries are created lazily as the table
//! grows and are only destroyed at reactor shutdown, so the epoll
//! user-data slot can carry a raw entry pointer.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use strand_core::error::{SchedError, SchedResult};
use strand_core::state::FiberState;
use strand_core::{rt_debug, rt_error};
use strand_runtime::scheduler::{self, Schedule, Scheduler};
use strand_runtime::timer::{TimerCallback, TimerManager};
use strand_runtime::{Fiber, FiberFn, SchedulerConfig};

const EPOLLET: u32 = libc::EPOLLET as u32;
const EP_READ: u32 = libc::EPOLLIN as u32;
const EP_WRITE: u32 = libc::EPOLLOUT as u32;

/// Initial size of the fd-entry table
const INITIAL_FD_ENTRIES: usize = 32;

/// epoll_wait batch size
const MAX_EVENTS: usize = 256;

/// Upper bound on one epoll_wait, even with no timer due sooner.
/// Progress insurance should a timer wakeup ever be lost.
const MAX_TIMEOUT_MS: u64 = 5000;

/// An I/O direction that can be waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoEvent {
    /// Readable (EPOLLIN)
    Read = EP_READ,
    /// Writable (EPOLLOUT)
    Write = EP_WRITE,
}

impl IoEvent {
    #[inline]
    pub fn mask(self) -> u32 {
        self as u32
    }
}

/// Continuation for one armed (fd, direction)
///
/// Exactly one of `fiber`/`cb` is set while armed: the callback if one
/// was supplied to `add_event`, otherwise the fiber that parked.
struct EventCtx {
    scheduler: Weak<IoScheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventCtx {
    const fn empty() -> Self {
        Self {
            scheduler: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

/// Per-direction state of one fd, protected by the entry mutex
struct FdEntryState {
    /// Currently armed directions (EP_READ/EP_WRITE bits)
    events: u32,
    read: EventCtx,
    write: EventCtx,
}

impl FdEntryState {
    const fn new() -> Self {
        Self {
            events: 0,
            read: EventCtx::empty(),
            write: EventCtx::empty(),
        }
    }

    fn ctx_mut(&mut self, event: IoEvent) -> &mut EventCtx {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

/// The reactor's per-fd record
///
/// Boxed so its address is stable across table growth; the raw pointer
/// rides in the epoll user-data slot. Entries live until the reactor is
/// dropped.
struct FdEntry {
    fd: i32,
    state: Mutex<FdEntryState>,
}

thread_local! {
    /// The reactor owning the current worker thread (and the thread
    /// that constructed it)
    static CURRENT_IO: RefCell<Weak<IoScheduler>> = const { RefCell::new(Weak::new()) };
}

/// Scheduler + timer heap + epoll
///
/// Construction starts the worker pool; shut down with
/// [`strand_runtime::scheduler::stop`], after which dropping the last
/// handle closes the epoll instance and the wake pipe.
pub struct IoScheduler {
    sched: Scheduler,
    timers: Arc<TimerManager>,

    epfd: i32,
    /// Self-pipe; [0] read end is registered edge-triggered on the epoll
    tickle_fds: [i32; 2],

    /// Armed (fd, direction) pairs not yet triggered
    pending: AtomicUsize,

    entries: RwLock<Vec<Box<FdEntry>>>,

    /// Enable the I/O hooks on each worker thread
    hook_io: bool,

    self_weak: Weak<IoScheduler>,
}

impl IoScheduler {
    /// Create a reactor with `threads` workers and start the pool
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<IoScheduler>> {
        Self::with_config(
            SchedulerConfig::new()
                .workers(threads)
                .use_caller(use_caller)
                .name(name),
        )
    }

    /// Create a reactor from a full configuration and start the pool
    pub fn with_config(config: SchedulerConfig) -> SchedResult<Arc<IoScheduler>> {
        config.validate()?;

        // A reactor whose epoll or wake pipe cannot be created has no
        // way to run at all.
        let epfd = unsafe { libc::epoll_create1(0) };
        assert!(epfd >= 0, "epoll_create1 failed: errno {}", errno());

        let mut tickle_fds = [0i32; 2];
        let rt = unsafe { libc::pipe(tickle_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: errno {}", errno());

        // Edge-triggered read end must be drained without blocking
        unsafe {
            let flags = libc::fcntl(tickle_fds[0], libc::F_GETFL, 0);
            let rt = libc::fcntl(tickle_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            assert_eq!(rt, 0, "fcntl(tickle pipe) failed: errno {}", errno());
        }

        // The pipe is identified in the event loop by its fd in the
        // user-data slot; fd entries use their heap address, which can
        // never collide with a small integer.
        let mut ev = libc::epoll_event {
            events: EP_READ | EPOLLET,
            u64: tickle_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) };
        assert_eq!(rt, 0, "epoll_ctl(tickle pipe) failed: errno {}", errno());

        let timers = TimerManager::new();
        let iom = Arc::new_cyclic(|weak| IoScheduler {
            sched: Scheduler::new(
                config.workers,
                config.use_caller,
                &config.name,
                config.stack_size,
            ),
            timers: timers.clone(),
            epfd,
            tickle_fds,
            pending: AtomicUsize::new(0),
            entries: RwLock::new(Vec::new()),
            hook_io: config.hook_io,
            self_weak: weak.clone(),
        });

        iom.resize_entries(INITIAL_FD_ENTRIES);

        // An earliest-deadline insertion must be able to interrupt a
        // worker blocked in epoll_wait.
        let weak = Arc::downgrade(&iom);
        timers.set_front_hook(move || {
            if let Some(iom) = weak.upgrade() {
                iom.tickle();
            }
        });

        if config.use_caller {
            scheduler::init_caller(&iom);
        }

        // The constructing thread may issue hooked calls too
        CURRENT_IO.with(|c| *c.borrow_mut() = Arc::downgrade(&iom));

        scheduler::start(&iom)?;
        Ok(iom)
    }

    /// The reactor owning the current thread, if any
    pub fn current() -> Option<Arc<IoScheduler>> {
        CURRENT_IO.with(|c| c.borrow().upgrade())
    }

    /// The reactor's timer heap
    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Grow the fd-entry table to at least `size` slots
    fn resize_entries(&self, size: usize) {
        let mut entries = self.entries.write().unwrap();
        let old = entries.len();
        if size <= old {
            return;
        }
        entries.reserve(size - old);
        for fd in old..size {
            entries.push(Box::new(FdEntry {
                fd: fd as i32,
                state: Mutex::new(FdEntryState::new()),
            }));
        }
    }

    /// Look up the entry for `fd`, growing the table when allowed
    ///
    /// Entries are never destroyed before the reactor itself and boxes
    /// do not move when the vector grows, so the reference handed out
    /// stays valid for the borrow of `self`.
    fn entry(&self, fd: i32, auto_grow: bool) -> Option<&FdEntry> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let entries = self.entries.read().unwrap();
            if idx < entries.len() {
                let ptr: *const FdEntry = &*entries[idx];
                return Some(unsafe { &*ptr });
            }
        }
        if !auto_grow {
            return None;
        }
        self.resize_entries(std::cmp::max(idx + 1, idx + idx / 2));
        let entries = self.entries.read().unwrap();
        let ptr: *const FdEntry = &*entries[idx];
        Some(unsafe { &*ptr })
    }

    /// Arm `event` on `fd`
    ///
    /// With `cb` the callback becomes the continuation; without it the
    /// currently running fiber does, which therefore must be about to
    /// yield. Fails if the direction is already armed or epoll rejects
    /// the change; on failure the entry is left exactly as it was.
    pub fn add_event(&self, fd: i32, event: IoEvent, cb: Option<FiberFn>) -> SchedResult<()> {
        let entry = self.entry(fd, true).ok_or(SchedError::NoSuchFd)?;
        let mut st = entry.state.lock().unwrap();

        // one continuation per direction
        if st.events & event.mask() != 0 {
            rt_error!("add_event: {:?} already armed on fd {}", event, fd);
            return Err(SchedError::EventExists);
        }

        let op = if st.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ep = libc::epoll_event {
            events: EPOLLET | st.events | event.mask(),
            u64: entry as *const FdEntry as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rt != 0 {
            let e = errno();
            rt_error!("add_event: epoll_ctl(fd {}, {:?}) failed: errno {}", fd, event, e);
            return Err(SchedError::EpollCtl(e));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events |= event.mask();

        let scheduler = self.self_weak.clone();
        let ctx = st.ctx_mut(event);
        assert!(ctx.is_empty(), "event context already populated");
        ctx.scheduler = scheduler;
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    FiberState::Running,
                    "add_event without callback outside a running fiber"
                );
                ctx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Disarm `event` on `fd` without waking its continuation
    pub fn del_event(&self, fd: i32, event: IoEvent) -> bool {
        let Some(entry) = self.entry(fd, false) else {
            return false;
        };
        let mut st = entry.state.lock().unwrap();
        if st.events & event.mask() == 0 {
            return false;
        }

        let new_events = st.events & !event.mask();
        if !self.epoll_rearm(entry.fd, new_events, entry as *const FdEntry as u64, "del_event") {
            return false;
        }

        st.events = new_events;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        st.ctx_mut(event).reset();
        true
    }

    /// Disarm `event` on `fd` and schedule its continuation now
    ///
    /// Used by timeout timers and close-driven cancellation: the parked
    /// fiber resumes, retries, and observes the real condition.
    pub fn cancel_event(&self, fd: i32, event: IoEvent) -> bool {
        let Some(entry) = self.entry(fd, false) else {
            return false;
        };
        let mut st = entry.state.lock().unwrap();
        if st.events & event.mask() == 0 {
            return false;
        }

        let new_events = st.events & !event.mask();
        if !self.epoll_rearm(entry.fd, new_events, entry as *const FdEntry as u64, "cancel_event") {
            return false;
        }

        self.trigger_event(&mut st, event);
        true
    }

    /// Cancel every armed direction on `fd`
    pub fn cancel_all(&self, fd: i32) -> bool {
        let Some(entry) = self.entry(fd, false) else {
            return false;
        };
        let mut st = entry.state.lock().unwrap();
        if st.events == 0 {
            return false;
        }

        let mut ep = libc::epoll_event {
            events: 0,
            u64: entry as *const FdEntry as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, entry.fd, &mut ep) };
        if rt != 0 {
            rt_error!("cancel_all: epoll_ctl(fd {}) failed: errno {}", fd, errno());
            return false;
        }

        if st.events & EP_READ != 0 {
            self.trigger_event(&mut st, IoEvent::Read);
        }
        if st.events & EP_WRITE != 0 {
            self.trigger_event(&mut st, IoEvent::Write);
        }
        assert_eq!(st.events, 0);
        true
    }

    /// Hand the continuation to its scheduler and clear the direction
    ///
    /// Caller holds the entry mutex.
    fn trigger_event(&self, st: &mut FdEntryState, event: IoEvent) {
        assert!(st.events & event.mask() != 0, "triggering unarmed event");
        st.events &= !event.mask();

        let ctx = st.ctx_mut(event);
        if let Some(sched) = ctx.scheduler.upgrade() {
            if let Some(cb) = ctx.cb.take() {
                scheduler::schedule_cb(&sched, cb, None);
            } else if let Some(fiber) = ctx.fiber.take() {
                scheduler::schedule_fiber(&sched, fiber, None);
            }
        }
        ctx.reset();
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// MOD to the remaining mask, or DEL when nothing stays armed
    fn epoll_rearm(&self, fd: i32, new_events: u32, data: u64, who: &str) -> bool {
        let op = if new_events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep = libc::epoll_event {
            events: EPOLLET | new_events,
            u64: data,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rt != 0 {
            rt_error!("{}: epoll_ctl(fd {}) failed: errno {}", who, fd, errno());
            return false;
        }
        true
    }
}

impl Schedule for IoScheduler {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one idle worker by writing a byte into the self-pipe
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(rt, 1);
    }

    /// Done only when the pool is drained, no event is armed and no
    /// timer is outstanding
    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn on_thread_start(this: &Arc<Self>) {
        CURRENT_IO.with(|c| *c.borrow_mut() = this.self_weak.clone());
        if this.hook_io {
            crate::hook::set_hook_enabled(true);
        }
    }

    /// The reactor's idle routine: block in epoll until readiness, a
    /// timer deadline, or a tickle; translate what happened into
    /// scheduled work; yield back to the worker loop.
    fn idle(this: &Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if this.stopping() {
                rt_debug!(
                    "reactor {}: idle exits on tid {}",
                    this.sched.name(),
                    strand_runtime::thread::tid()
                );
                break;
            }

            let n = loop {
                let next = this.timers.next_timeout().unwrap_or(u64::MAX);
                let timeout = next.min(MAX_TIMEOUT_MS) as i32;
                let rt = unsafe {
                    libc::epoll_wait(this.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                // EINTR -> retry
                if rt < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rt.max(0) as usize;
            };

            // timers overdue run before kernel-reported readiness
            let mut cbs: Vec<TimerCallback> = Vec::new();
            this.timers.drain_expired(&mut cbs);
            for cb in cbs {
                scheduler::schedule_cb(this, Box::new(move || cb()), None);
            }

            for ev in events.iter().take(n) {
                let data = ev.u64;

                if data == this.tickle_fds[0] as u64 {
                    // edge triggered -> exhaust
                    let mut dummy = [0u8; 256];
                    while unsafe {
                        libc::read(
                            this.tickle_fds[0],
                            dummy.as_mut_ptr() as *mut libc::c_void,
                            dummy.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                // Entries outlive the reactor loop; see `entry()`.
                let entry = unsafe { &*(data as *const FdEntry) };
                let mut st = entry.state.lock().unwrap();

                // error/hangup counts as readiness for whatever was armed
                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (EP_READ | EP_WRITE) & st.events;
                }
                let mut real = 0u32;
                if revents & EP_READ != 0 {
                    real |= EP_READ;
                }
                if revents & EP_WRITE != 0 {
                    real |= EP_WRITE;
                }
                if st.events & real == 0 {
                    continue;
                }

                let left = st.events & !real;
                if !this.epoll_rearm(entry.fd, left, data, "idle") {
                    continue;
                }

                if real & EP_READ != 0 {
                    this.trigger_event(&mut st, IoEvent::Read);
                }
                if real & EP_WRITE != 0 {
                    this.trigger_event(&mut st, IoEvent::Write);
                }
            }

            // let the worker loop run whatever just got scheduled
            Fiber::yield_now();
        }
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        // Runs only once every worker has exited (they hold strong
        // references), i.e. after scheduler::stop.
        unsafe {
            libc::close(self.tickle_fds[1]);
            libc::close(self.tickle_fds[0]);
            libc::close(self.epfd);
        }
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pipe_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_double_arm_rejected() {
        let iom = IoScheduler::new(1, false, "arm").unwrap();
        let (r, w) = pipe_pair();

        iom.add_event(r, IoEvent::Read, Some(Box::new(|| {}))).unwrap();
        assert_eq!(
            iom.add_event(r, IoEvent::Read, Some(Box::new(|| {}))),
            Err(SchedError::EventExists)
        );

        // disarm so the reactor can drain and stop
        assert!(iom.del_event(r, IoEvent::Read));
        assert!(!iom.del_event(r, IoEvent::Read));
        scheduler::stop(&iom);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_readiness_runs_callback() {
        let iom = IoScheduler::new(2, false, "ready").unwrap();
        let (r, w) = pipe_pair();

        let (tx, rx) = mpsc::channel();
        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                tx.send(()).unwrap();
            })),
        )
        .unwrap();

        let rt = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rt, 1);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        scheduler::stop(&iom);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_cancel_event_triggers() {
        let iom = IoScheduler::new(2, false, "cancel").unwrap();
        let (r, w) = pipe_pair();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        // no readiness: the wakeup comes from the cancel
        assert!(iom.cancel_event(r, IoEvent::Read));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // exactly one wakeup per park
        assert!(!iom.cancel_event(r, IoEvent::Read));
        scheduler::stop(&iom);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_timer_via_reactor() {
        let iom = IoScheduler::new(1, false, "timer").unwrap();

        let (tx, rx) = mpsc::channel();
        iom.timers().add_timer(
            30,
            Arc::new(move || {
                let _ = tx.send(());
            }),
            false,
        );

        // the timer callback is scheduled by the idle loop even though
        // nobody touches epoll-visible fds
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        scheduler::stop(&iom);
    }

    #[test]
    fn test_stop_drains_pending() {
        let iom = IoScheduler::new(2, false, "drain").unwrap();
        let (r, w) = pipe_pair();

        let (tx, rx) = mpsc::channel();
        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                tx.send(()).unwrap();
            })),
        )
        .unwrap();

        // a pending event holds the reactor open; cancel releases it
        assert!(iom.cancel_all(r));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        scheduler::stop(&iom);
        assert!(iom.stopping());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
