//! Error types for the strand scheduler

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler and reactor operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler was already stopped
    Stopped,

    /// The requested (fd, direction) is already armed
    EventExists,

    /// No context registered for this fd
    NoSuchFd,

    /// epoll_ctl failed; payload is the kernel errno
    EpollCtl(i32),

    /// Failed to spawn an OS thread
    SpawnFailed,

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Stopped => write!(f, "scheduler is stopped"),
            SchedError::EventExists => write!(f, "event already armed for this fd/direction"),
            SchedError::NoSuchFd => write!(f, "no context for this fd"),
            SchedError::EpollCtl(errno) => write!(f, "epoll_ctl failed: errno {}", errno),
            SchedError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SchedError::Stopped), "scheduler is stopped");
        assert_eq!(
            format!("{}", SchedError::EpollCtl(9)),
            "epoll_ctl failed: errno 9"
        );
    }
}
