//! # strand-io
//!
//! The I/O half of strand: an epoll reactor fused with the scheduler
//! and timer heap, a per-fd context table, and wrappers that turn
//! blocking-style socket calls into park-and-retry cycles on fibers.
//!
//! This crate provides:
//! - `IoScheduler` - scheduler + timer heap + edge-triggered epoll
//! - `fd_table` - process-wide per-descriptor metadata
//! - `hook` - libc-shaped wrappers (`read`, `write`, `connect`, `sleep`,
//!   ...) that park the calling fiber instead of blocking the thread
//! - `net` - small blocking-style TCP helpers over the wrappers

pub mod fd_table;
pub mod hook;
pub mod net;
pub mod reactor;

// Re-exports
pub use fd_table::{FdCtx, FdTable};
pub use net::{NetListener, NetStream};
pub use reactor::{IoEvent, IoScheduler};
