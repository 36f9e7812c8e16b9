//! # strand-runtime
//!
//! The coroutine runtime for strand: stackful fibers, the worker-pool
//! scheduler and the deadline timer heap.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Heap-owned fiber stacks
//! - Per-thread tracking of the running fiber
//! - Worker thread management with a spawn handshake
//! - The affinity-aware FIFO task scheduler
//! - A wall-clock deadline timer heap with rollover detection

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

// Re-exports
pub use config::SchedulerConfig;
pub use fiber::{Fiber, FiberFn, DEFAULT_STACK_SIZE};
pub use scheduler::{Schedule, ScheduleTask, Scheduler};
pub use thread::Thread;
pub use timer::{Timer, TimerCallback, TimerManager};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
