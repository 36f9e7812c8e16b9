//! Architecture-specific context switching
//!
//! Provides assembly implementations for saving and restoring the
//! callee-saved register set during fiber switches, plus the trampoline
//! that a fresh fiber starts in.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, context_switch, init_context};
    }
}
