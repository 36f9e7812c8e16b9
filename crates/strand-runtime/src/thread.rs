//! Worker thread management
//!
//! Wraps an OS thread with a human name, the kernel TID, and a spawn
//! handshake: the spawning thread blocks until the child has published
//! its TLS identity and taken ownership of the callable, so the spawner
//! can rely on the child's TID immediately and may drop its own state
//! without racing the child's startup reads.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use strand_core::error::{SchedError, SchedResult};

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
    static THREAD_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Kernel TID of the calling thread (cached per thread)
#[inline]
pub fn tid() -> libc::pid_t {
    THREAD_TID.with(|cell| {
        let mut t = cell.get();
        if t == 0 {
            t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cell.set(t);
        }
        t
    })
}

/// Name of the calling thread
pub fn name() -> String {
    THREAD_NAME.with(|cell| cell.borrow().clone())
}

/// Set the calling thread's name (TLS only; the pthread name is set at
/// spawn time)
pub fn set_name(name: &str) {
    THREAD_NAME.with(|cell| *cell.borrow_mut() = name.to_string());
}

/// Binary semaphore for the spawn handshake
struct Semaphore {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signalled = self.state.lock().unwrap();
        *signalled = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut signalled = self.state.lock().unwrap();
        while !*signalled {
            signalled = self.cond.wait(signalled).unwrap();
        }
    }
}

/// An OS thread owned by the scheduler
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a named thread running `cb`
    ///
    /// Blocks until the child has initialised its TLS and recorded its
    /// TID; the returned `Thread` therefore always carries a valid TID.
    pub fn spawn<F>(name: &str, cb: F) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new());
        let child_sem = Arc::clone(&sem);
        let child_tid = Arc::new(Mutex::new(0 as libc::pid_t));
        let child_tid2 = Arc::clone(&child_tid);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                set_name(&thread_name);
                *child_tid2.lock().unwrap() = tid();
                child_sem.signal();
                cb();
            })
            .map_err(|_| SchedError::SpawnFailed)?;

        sem.wait();
        let tid = *child_tid.lock().unwrap();

        Ok(Thread {
            handle: Some(handle),
            tid,
            name: name.to_string(),
        })
    }

    /// Kernel TID of the spawned thread
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Name the thread was spawned with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // A joined thread has had its handle taken; anything else is
        // detached rather than blocking an arbitrary drop site.
        drop(self.handle.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_tid_stable() {
        assert_eq!(tid(), tid());
        assert!(tid() > 0);
    }

    #[test]
    fn test_spawn_handshake() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();

        let th = Thread::spawn("strand-test", move || {
            seen2.store(tid(), Ordering::SeqCst);
        })
        .unwrap();

        let child_tid = th.tid();
        assert!(child_tid > 0);
        assert_ne!(child_tid, tid());
        th.join();
        // The TID the spawner observed is the one the child reported.
        assert_eq!(seen.load(Ordering::SeqCst), child_tid);
    }

    #[test]
    fn test_thread_name_tls() {
        let th = Thread::spawn("named-worker", || {
            assert_eq!(name(), "named-worker");
        })
        .unwrap();
        assert_eq!(th.name(), "named-worker");
        th.join();
    }
}
