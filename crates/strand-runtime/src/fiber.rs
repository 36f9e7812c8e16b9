//! Stackful fibers
//!
//! A `Fiber` is a cooperatively scheduled user-mode execution context
//! with its own heap stack. Exactly one fiber per thread is RUNNING at
//! any moment and is tracked in TLS as the thread's "current" fiber.
//!
//! Each thread lazily owns a stackless *main* fiber representing the OS
//! thread's native context, plus an optional *scheduler* fiber set by a
//! caller-mode scheduler. A fiber's `run_in_scheduler` flag selects
//! which of the two it swaps against:
//!
//! - `true`: resume/yield swap against the thread's scheduler fiber
//!   (tasks multiplexed by the worker loop)
//! - `false`: resume/yield swap against the thread's main fiber (fibers
//!   driven synchronously by the caller, e.g. a caller-mode scheduler's
//!   own loop fiber)

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use strand_core::id::FiberId;
use strand_core::state::FiberState;

use crate::arch;
use crate::stack::Stack;

/// Default stack size for child fibers
pub const DEFAULT_STACK_SIZE: usize = 128_000;

/// The callable a fiber runs to completion
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Currently running fiber on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The thread's main fiber (created on first query)
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Yield target for fibers with `run_in_scheduler` set.
    /// Equals the main fiber until a caller-mode scheduler overrides it.
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,

    /// Heap stack; `None` for a thread's main fiber
    stack: Option<Stack>,

    /// Saved machine context. Written by the fiber switching away from
    /// this context, read by the fiber switching into it; the state
    /// machine guarantees the two never overlap.
    ctx: UnsafeCell<arch::Context>,

    /// User callable; taken by the trampoline so captured resources are
    /// released as soon as the body completes.
    cb: UnsafeCell<Option<FiberFn>>,

    state: AtomicU8,

    /// Swap partner selector, fixed at creation
    run_in_scheduler: bool,

    /// Held around resume so a task that got enqueued twice by a racing
    /// trigger cannot be resumed by two workers at once.
    exec_lock: Mutex<()>,

    /// Backref to the owning Arc; every fiber is Arc-managed
    self_weak: Weak<Fiber>,
}

// Access to ctx/cb follows the ownership handoff of resume/yield: only
// the thread that observes the fiber in the right state touches them.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a new fiber that will run `cb` when first resumed
    ///
    /// `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`]. The context is
    /// initialised to enter the fiber trampoline on first switch.
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack = Stack::new(size);
        let stack_top = stack.top();

        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::next(),
            stack: Some(stack),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            cb: UnsafeCell::new(Some(cb)),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            exec_lock: Mutex::new(()),
            self_weak: weak.clone(),
        });

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                stack_top,
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        fiber
    }

    /// The main fiber for a thread: no owned stack, born RUNNING since
    /// it is by definition the context executing right now.
    fn new_main() -> Arc<Fiber> {
        Arc::new_cyclic(|weak| Fiber {
            id: FiberId::next(),
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            cb: UnsafeCell::new(None),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            exec_lock: Mutex::new(()),
            self_weak: weak.clone(),
        })
    }

    /// Get the currently running fiber, creating the thread's main fiber
    /// on first call
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        let main = Fiber::new_main();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        SCHEDULER.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Id of the currently running fiber, or NONE if the thread has no
    /// fiber context yet
    pub fn current_id() -> FiberId {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(FiberId::NONE))
    }

    /// Override the thread's scheduler fiber (the yield target for
    /// `run_in_scheduler` fibers). Used by caller-mode schedulers.
    pub fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
        SCHEDULER.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn owns_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Lock held by the scheduler loop around `resume`
    pub(crate) fn exec_lock(&self) -> &Mutex<()> {
        &self.exec_lock
    }

    /// Switch from the current context into this fiber
    ///
    /// Saves the caller's registers into the swap partner chosen by
    /// `run_in_scheduler` and loads this fiber's. Returns when the fiber
    /// yields or terminates.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not READY, or if the thread has no fiber
    /// context to swap against.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume of fiber {} in state {}",
            self.id,
            self.state()
        );
        self.set_state(FiberState::Running);

        let this = self.self_weak.upgrade().expect("fiber without an owner");
        let partner = self.swap_partner();
        let prev = CURRENT.with(|c| c.replace(Some(this)));
        drop(prev);

        // Saves into the partner's context slot: `partner` is the fiber
        // whose context is executing this call.
        unsafe {
            arch::context_switch(partner.ctx.get(), self.ctx.get());
        }
        // Back in the partner context; CURRENT was restored by yield.
    }

    /// Suspend the current fiber, switching back to its swap partner
    ///
    /// Legal in RUNNING (sets READY) and in TERM (the trampoline's final
    /// exit path).
    pub fn yield_fiber(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield of fiber {} in state {}",
            self.id,
            st
        );
        if st != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let partner = self.swap_partner();
        let prev = CURRENT.with(|c| c.replace(Some(partner.clone())));
        drop(prev);

        // A terminating fiber never returns here, abandoning this frame;
        // no owned handle may be live across the switch. The partner is
        // kept alive by the CURRENT/MAIN/SCHEDULER slots.
        let partner_ctx = partner.ctx.get();
        drop(partner);

        unsafe {
            arch::context_switch(self.ctx.get(), partner_ctx);
        }
        // Resumed again.
    }

    /// Yield the currently running fiber
    pub fn yield_now() {
        Fiber::current().yield_fiber();
    }

    /// Reuse a terminated fiber's stack for a new callable
    ///
    /// # Panics
    ///
    /// Panics unless the fiber is TERM and owns a stack (a thread's main
    /// fiber cannot be reset).
    pub fn reset(&self, cb: FiberFn) {
        assert!(
            self.stack.is_some() && self.state() == FiberState::Term,
            "reset requires a terminated fiber with its own stack"
        );
        let stack_top = self.stack.as_ref().unwrap().top();
        unsafe {
            *self.cb.get() = Some(cb);
            arch::init_context(
                self.ctx.get(),
                stack_top,
                fiber_main as usize,
                self.self_weak.as_ptr() as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }

    /// The fiber whose context this one swaps against
    fn swap_partner(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            SCHEDULER
                .with(|c| c.borrow().clone())
                .expect("no scheduler fiber on this thread")
        } else {
            MAIN.with(|c| c.borrow().clone())
                .expect("no main fiber on this thread")
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .field("owns_stack", &self.owns_stack())
            .finish()
    }
}

/// Entry point every child fiber starts in (via the arch trampoline)
///
/// Runs the user callable to completion, drops it, marks the fiber TERM
/// and yields for the last time. The raw pointer is valid for the whole
/// body: the resuming worker holds a strong reference until `resume`
/// returns, which happens strictly after the final yield.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let cb = unsafe { (*fiber.cb.get()).take() };
    if let Some(cb) = cb {
        cb();
    }

    fiber.set_state(FiberState::Term);
    fiber.yield_fiber();
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_main_fiber_identity() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), FiberState::Running);
        assert!(!a.owns_stack());
    }

    #[test]
    fn test_resume_yield_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();

        Fiber::current();
        let fiber = Fiber::new(
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));

        Fiber::current();
        let c = count.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = count.clone();
        fiber.reset(Box::new(move || {
            c.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_ids_increase() {
        Fiber::current();
        let a = Fiber::new(Box::new(|| {}), 0, false);
        let b = Fiber::new(Box::new(|| {}), 0, false);
        assert!(b.id() > a.id());
        // Leave no READY fibers dangling: run them to completion.
        a.resume();
        b.resume();
    }
}
