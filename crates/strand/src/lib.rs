//! # strand
//!
//! Facade crate: the public API of the strand cooperative I/O
//! scheduler.
//!
//! ```ignore
//! use strand::{scheduler, IoScheduler, NetListener, SchedulerConfig};
//!
//! let iom = IoScheduler::with_config(
//!     SchedulerConfig::new().workers(4).hook_io(true).name("app"),
//! )?;
//! scheduler::spawn(&iom, || {
//!     let listener = NetListener::bind(8080, 1024).unwrap();
//!     // blocking-style accept/read/write; only the fiber parks
//! });
//! ```

pub use strand_core::{FiberId, FiberState, SchedError, SchedResult};
pub use strand_io::{hook, FdCtx, FdTable, IoEvent, IoScheduler, NetListener, NetStream};
pub use strand_runtime::{
    scheduler, timer, Fiber, Schedule, SchedulerConfig, Thread, Timer, TimerManager,
    DEFAULT_STACK_SIZE,
};
