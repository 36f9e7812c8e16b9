//! Fiber scheduler
//!
//! A multi-threaded worker pool multiplexing fibers and plain callbacks
//! over N OS threads. Tasks are FIFO, with optional pinning to a worker
//! TID; a worker scanning past a task pinned elsewhere tickles its peers
//! so the pinned task is not starved.
//!
//! The [`Schedule`] trait is the seam the reactor extends: it overrides
//! `tickle` (wake one idle worker), `idle` (block in epoll instead of
//! sleeping) and `stopping` (drain pending events and timers too). The
//! base `Scheduler` implements the trait with the defaults and is usable
//! on its own. The pool-level operations (`start`, `stop`, `schedule_*`)
//! are free functions generic over the implementation, mirroring how the
//! loop itself is shared.
//!
//! In caller-participates mode the constructing thread owns a dedicated
//! scheduler fiber running the same worker loop; `stop` resumes it so
//! the caller thread helps drain the queue before the workers are
//! joined.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_core::error::{SchedError, SchedResult};
use strand_core::state::FiberState;
use strand_core::{rt_debug, rt_error};

use crate::fiber::{Fiber, FiberFn};
use crate::thread::{self, Thread};

/// How long the default idle fiber sleeps between stop checks
const IDLE_SLEEP_MS: u64 = 20;

/// One unit of schedulable work: a fiber to resume or a callback to wrap
/// in a fresh fiber, optionally pinned to a worker TID
pub struct ScheduleTask {
    pub fiber: Option<Arc<Fiber>>,
    pub cb: Option<FiberFn>,
    pub thread: Option<libc::pid_t>,
}

impl ScheduleTask {
    pub fn from_fiber(fiber: Arc<Fiber>, thread: Option<libc::pid_t>) -> Self {
        Self {
            fiber: Some(fiber),
            cb: None,
            thread,
        }
    }

    pub fn from_cb(cb: FiberFn, thread: Option<libc::pid_t>) -> Self {
        Self {
            fiber: None,
            cb: Some(cb),
            thread,
        }
    }
}

/// Shared scheduler state
///
/// Embedded by anything implementing [`Schedule`]; the base
/// implementation on `Scheduler` itself gives the plain worker pool.
pub struct Scheduler {
    name: String,

    tasks: Mutex<VecDeque<ScheduleTask>>,

    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,

    /// Worker threads to spawn (excludes the caller in caller mode)
    thread_count: usize,

    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,

    use_caller: bool,
    /// TID of the constructing thread in caller mode
    root_tid: Option<libc::pid_t>,
    /// The caller thread's scheduler fiber in caller mode
    root_fiber: Mutex<Option<Arc<Fiber>>>,

    /// Stack size for task and idle fibers (0 = default)
    stack_size: usize,
}

impl Scheduler {
    /// Build the shared state
    ///
    /// `threads` counts the caller when `use_caller` is set, so at least
    /// one is always required. The caller-mode scheduler fiber is wired
    /// up separately by [`init_caller`], which needs the owning `Arc`.
    pub fn new(threads: usize, use_caller: bool, name: &str, stack_size: usize) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");

        let (thread_count, root_tid) = if use_caller {
            // the caller thread takes one worker slot
            (threads - 1, Some(thread::tid()))
        } else {
            (threads, None)
        };

        Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            use_caller,
            root_tid,
            root_fiber: Mutex::new(None),
            stack_size,
        }
    }

    /// Create a plain scheduler with the default idle/tickle behaviour
    pub fn create(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let sched = Arc::new(Scheduler::new(threads, use_caller, name, 0));
        if use_caller {
            init_caller(&sched);
        }
        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// TIDs of the spawned workers (plus the caller in caller mode)
    pub fn worker_tids(&self) -> Vec<libc::pid_t> {
        let mut ids = self.thread_ids.lock().unwrap().clone();
        if let Some(root) = self.root_tid {
            ids.push(root);
        }
        ids
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// The base stopping predicate: stop requested, queue drained, no
    /// worker still running a task
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }
}

/// The scheduler seam: base behaviour here, reactor overrides
///
/// An implementation supplies the shared state and may override the
/// wakeup (`tickle`), the out-of-work behaviour (`idle`), the
/// termination predicate (`stopping`) and the per-worker setup
/// (`on_thread_start`).
pub trait Schedule: Send + Sync + Sized + 'static {
    fn scheduler(&self) -> &Scheduler;

    /// Wake one idle worker. The base pool has nothing to wake through;
    /// workers poll out of their sleep.
    fn tickle(&self) {}

    /// Termination predicate consulted by idle fibers and `stop`
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Runs on the idle fiber whenever a worker finds the queue empty.
    /// Must yield regularly; returns only when `stopping()` holds.
    fn idle(this: &Arc<Self>) {
        while !this.stopping() {
            std::thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
            Fiber::yield_now();
        }
    }

    /// Per-worker-thread setup before the scheduling loop runs
    fn on_thread_start(_this: &Arc<Self>) {}
}

/// The base scheduler is itself a `Schedule` with default behaviour
impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

/// Wire up caller-participation: create the caller thread's scheduler
/// fiber (running the worker loop) and make it the thread's yield target
///
/// Must run on the constructing thread, after the owning `Arc` exists.
pub fn init_caller<S: Schedule>(this: &Arc<S>) {
    let base = this.scheduler();
    debug_assert!(base.use_caller);

    // ensure the caller thread has its main fiber
    Fiber::current();
    thread::set_name(&base.name);

    // run_in_scheduler = false: when the loop finishes, control returns
    // to the caller's main fiber inside stop()
    let weak = Arc::downgrade(this);
    let root = Fiber::new(
        Box::new(move || {
            if let Some(s) = weak.upgrade() {
                run(s);
            }
        }),
        base.stack_size,
        false,
    );
    Fiber::set_scheduler_fiber(&root);
    *base.root_fiber.lock().unwrap() = Some(root);
}

/// Spawn the worker threads
///
/// Errors with [`SchedError::Stopped`] if the scheduler was already
/// stopped; must not be called twice.
pub fn start<S: Schedule>(this: &Arc<S>) -> SchedResult<()> {
    let base = this.scheduler();
    let mut threads = base.threads.lock().unwrap();
    if base.stopping.load(Ordering::SeqCst) {
        rt_error!("scheduler {}: start() after stop", base.name);
        return Err(SchedError::Stopped);
    }
    assert!(threads.is_empty(), "scheduler started twice");

    for i in 0..base.thread_count {
        let worker = this.clone();
        let th = Thread::spawn(&format!("{}_{}", base.name, i), move || run(worker))?;
        base.thread_ids.lock().unwrap().push(th.tid());
        threads.push(th);
    }
    Ok(())
}

/// Stop the scheduler and drain
///
/// Sets the stopping flag, wakes every worker, lets the caller thread
/// run its share in caller mode, then joins the workers. After `stop`
/// returns the queue is empty, no worker is active and `stopping()`
/// holds; calling it again is a no-op.
pub fn stop<S: Schedule>(this: &Arc<S>) {
    let base = this.scheduler();
    if this.stopping() {
        return;
    }
    base.stopping.store(true, Ordering::SeqCst);

    // wake every worker so its idle fiber observes the flag
    for _ in 0..base.thread_count {
        this.tickle();
    }

    let root = base.root_fiber.lock().unwrap().clone();
    if root.is_some() {
        this.tickle();
    }
    if let Some(root) = root {
        debug_assert_eq!(
            Some(thread::tid()),
            base.root_tid,
            "caller-mode stop must run on the constructing thread"
        );
        // the caller thread becomes a worker until the queue drains
        root.resume();
    }

    let mut workers = Vec::new();
    std::mem::swap(&mut workers, &mut *base.threads.lock().unwrap());
    for th in workers {
        th.join();
    }
}

/// Queue a fiber for execution
pub fn schedule_fiber<S: Schedule>(this: &Arc<S>, fiber: Arc<Fiber>, thread: Option<libc::pid_t>) {
    schedule_task(this, ScheduleTask::from_fiber(fiber, thread));
}

/// Queue a callback; a worker wraps it in a fresh fiber
pub fn schedule_cb<S: Schedule>(this: &Arc<S>, cb: FiberFn, thread: Option<libc::pid_t>) {
    schedule_task(this, ScheduleTask::from_cb(cb, thread));
}

/// Convenience spawn without thread affinity
pub fn spawn<S, F>(this: &Arc<S>, f: F)
where
    S: Schedule,
    F: FnOnce() + Send + 'static,
{
    schedule_cb(this, Box::new(f), None);
}

fn schedule_task<S: Schedule>(this: &Arc<S>, task: ScheduleTask) {
    let base = this.scheduler();
    let need_tickle;
    {
        let mut q = base.tasks.lock().unwrap();
        need_tickle = q.is_empty();
        q.push_back(task);
    }
    if need_tickle {
        this.tickle();
    }
}

/// The scheduling loop, one per worker thread (and one on the caller
/// thread's scheduler fiber in caller mode)
fn run<S: Schedule>(this: Arc<S>) {
    let tid = thread::tid();
    rt_debug!(
        "scheduler {}: loop starts on tid {}",
        this.scheduler().name,
        tid
    );

    S::on_thread_start(&this);

    // workers need their main fiber before any resume; the caller
    // thread already has one from init_caller
    if this.scheduler().root_tid != Some(tid) {
        Fiber::current();
    }

    let idle_this = this.clone();
    let idle_fiber = Fiber::new(
        Box::new(move || S::idle(&idle_this)),
        this.scheduler().stack_size,
        true,
    );

    loop {
        let base = this.scheduler();
        let mut task: Option<ScheduleTask> = None;
        let mut tickle_me = false;

        {
            let mut q = base.tasks.lock().unwrap();
            let mut i = 0;
            while i < q.len() {
                // skip tasks pinned to some other worker
                if matches!(q[i].thread, Some(t) if t != tid) {
                    i += 1;
                    tickle_me = true;
                    continue;
                }
                task = q.remove(i);
                base.active_threads.fetch_add(1, Ordering::SeqCst);
                break;
            }
            // work remains for someone after our pop
            tickle_me = tickle_me || !q.is_empty();
        }

        if tickle_me {
            this.tickle();
        }

        match task {
            Some(ScheduleTask {
                fiber: Some(fiber), ..
            }) => {
                {
                    // one worker at a time, even if a race enqueued the
                    // fiber twice
                    let _exec = fiber.exec_lock().lock().unwrap();
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                }
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(ScheduleTask { cb: Some(cb), .. }) => {
                let cb_fiber = Fiber::new(cb, base.stack_size, true);
                {
                    let _exec = cb_fiber.exec_lock().lock().unwrap();
                    cb_fiber.resume();
                }
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(_) => {
                // empty task; nothing to run
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                // idle fiber reaching TERM means the stop predicate held
                // and this worker is done
                if idle_fiber.state() == FiberState::Term {
                    rt_debug!("scheduler {}: loop ends on tid {}", base.name, tid);
                    break;
                }
                base.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                base.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_runs_callbacks() {
        let sched = Scheduler::create(2, false, "test");
        start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            spawn(&sched, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_runs_fibers_with_yields() {
        let sched = Scheduler::create(2, false, "test");
        start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            true,
        );
        schedule_fiber(&sched, fiber, None);

        stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_within_thread() {
        let sched = Scheduler::create(3, false, "fifo");
        start(&sched).unwrap();

        let target = sched.worker_tids()[0];
        let (tx, rx) = mpsc::channel::<usize>();
        for i in 0..50 {
            let tx = tx.clone();
            schedule_cb(
                &sched,
                Box::new(move || {
                    assert_eq!(thread::tid(), target);
                    tx.send(i).unwrap();
                }),
                Some(target),
            );
        }
        drop(tx);

        let order: Vec<usize> = rx.iter().collect();
        stop(&sched);
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_drains() {
        let sched = Scheduler::create(2, false, "drain");
        start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let c = count.clone();
            spawn(&sched, move || {
                std::thread::sleep(Duration::from_millis(1));
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        stop(&sched);

        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert!(sched.stopping());
        // idempotent
        stop(&sched);
    }

    #[test]
    fn test_start_after_stop_errors() {
        let sched = Scheduler::create(1, false, "late");
        start(&sched).unwrap();
        stop(&sched);
        assert_eq!(start(&sched), Err(SchedError::Stopped));
    }

    #[test]
    fn test_use_caller_mode() {
        let sched = Scheduler::create(2, true, "caller");
        start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = count.clone();
            spawn(&sched, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        // stop() pulls the caller thread into the loop until drained
        stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
