//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
///
/// Transitions:
/// - `Ready -> Running` on resume
/// - `Running -> Ready` on yield before the body completes
/// - `Running -> Term` when the body returns
/// - `Term -> Ready` on reset (only for fibers that own a stack)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable, waiting to be resumed
    Ready = 0,

    /// Currently executing on some thread
    Running = 1,

    /// Body has returned; may be reset if the fiber owns a stack
    Term = 2,
}

impl FiberState {
    /// Check if this state allows the fiber to be resumed
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has finished
    #[inline]
    pub const fn is_term(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Term => write!(f, "TERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(!FiberState::Term.is_runnable());
        assert!(FiberState::Term.is_term());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            let raw: u8 = s.into();
            assert_eq!(FiberState::from(raw), s);
        }
    }
}
