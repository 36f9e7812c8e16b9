//! Deadline timer heap
//!
//! An ordered set of absolute-deadline timers over the wall clock, with
//! cancel/refresh/reset, recurring timers, condition timers guarded by a
//! weak reference, and backward-clock-jump detection.
//!
//! Expired callbacks are collected under the write lock but invoked by
//! the caller after the lock is released, bounding lock-hold time. A
//! single `tickled` bit de-duplicates front-insertion wakeups between
//! two `next_timeout` calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Timeout sentinel: never fires
pub const NEVER: u64 = u64::MAX;

/// Backward clock jumps larger than this window count as a rollover
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Callback type for timers. Recurring timers fire it repeatedly, so it
/// is a shared `Fn`, not a one-shot.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Current wall-clock time in milliseconds since the epoch
///
/// The system clock is authoritative for deadlines; rollover detection
/// below is the compensation for it being settable.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single timer registered with a [`TimerManager`]
///
/// Shared between the manager (while armed) and user-held handles used
/// to cancel/refresh/reset.
pub struct Timer {
    /// Identity tie-break for equal deadlines
    seq: u64,

    /// Interval in ms (mutated only by `reset`)
    ms: AtomicU64,

    /// Absolute deadline in wall-clock ms; doubles as the map key, so it
    /// is only changed while the entry is out of the map, under the
    /// manager's write lock.
    deadline: AtomicU64,

    recurring: bool,

    /// None once cancelled or fired (non-recurring). A timer present in
    /// the manager's set always has a callback.
    cb: Mutex<Option<TimerCallback>>,

    manager: Weak<TimerManager>,
}

impl Timer {
    fn key(&self) -> (u64, u64) {
        (self.deadline.load(Ordering::Relaxed), self.seq)
    }

    /// Cancel the timer
    ///
    /// Nulls the callback first, then erases the entry, so an expiry
    /// scan that momentarily released the lock observes a cancelled
    /// timer as callback-less. Returns false if already cancelled.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = manager.inner.write().unwrap();

        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        drop(cb);

        inner.timers.remove(&self.key());
        true
    }

    /// Push the deadline out to now + interval
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = manager.inner.write().unwrap();

        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        let Some(timer) = inner.timers.remove(&self.key()) else {
            return false;
        };

        self.deadline
            .store(now_ms() + self.ms.load(Ordering::Relaxed), Ordering::Relaxed);
        inner.timers.insert(self.key(), timer);
        true
    }

    /// Change the interval and reinsert
    ///
    /// The new deadline is `(from_now ? now : old_deadline - old_interval)
    /// + new_interval`.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let this = {
            let mut inner = manager.inner.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            match inner.timers.remove(&self.key()) {
                Some(timer) => timer,
                None => return false,
            }
        };

        let old_ms = self.ms.swap(ms, Ordering::Relaxed);
        let start = if from_now {
            now_ms()
        } else {
            self.deadline.load(Ordering::Relaxed).saturating_sub(old_ms)
        };
        self.deadline.store(start + ms, Ordering::Relaxed);

        // Reinsert through the tickle-aware path
        manager.add(this);
        true
    }
}

struct TimerInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last observed wall-clock time, for rollover detection
    previous_time: u64,
}

/// Owner of the timer set
///
/// Embedded (as an `Arc`) in the reactor; the `on_front` hook is how an
/// earliest-deadline insertion wakes a sleeping poll loop.
pub struct TimerManager {
    inner: RwLock<TimerInner>,

    /// Set when an earliest-deadline insertion has signalled a wakeup
    /// and not yet been observed by `next_timeout`
    tickled: AtomicBool,

    /// Invoked (outside the lock) when a new earliest timer is inserted
    on_front: OnceLock<Box<dyn Fn() + Send + Sync>>,

    seq: AtomicU64,

    /// Backref handed to timers so their handles can find the set
    self_weak: Weak<TimerManager>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new_cyclic(|weak| TimerManager {
            inner: RwLock::new(TimerInner {
                timers: BTreeMap::new(),
                previous_time: now_ms(),
            }),
            tickled: AtomicBool::new(false),
            on_front: OnceLock::new(),
            seq: AtomicU64::new(0),
            self_weak: weak.clone(),
        })
    }

    /// Install the front-insertion wakeup hook (reactor: wake-pipe write)
    ///
    /// May be set at most once; later calls are ignored.
    pub fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _ = self.on_front.set(Box::new(hook));
    }

    /// Register a timer firing `ms` from now
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ms: AtomicU64::new(ms),
            deadline: AtomicU64::new(now_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            manager: self.self_weak.clone(),
        });
        self.add(timer.clone());
        timer
    }

    /// Register a timer whose callback only runs if `cond` is still
    /// alive at fire time
    pub fn add_condition_timer<T>(
        &self,
        ms: u64,
        cb: TimerCallback,
        cond: &Arc<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(cond);
        let guarded: TimerCallback = Arc::new(move || {
            // Fire only while the interested party still exists
            if weak.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, guarded, recurring)
    }

    /// Insert, signalling the front hook if this became the earliest
    /// deadline and no wakeup is already pending
    fn add(&self, timer: Arc<Timer>) {
        let at_front;
        {
            let mut inner = self.inner.write().unwrap();
            let key = timer.key();
            inner.timers.insert(key, timer);
            let is_first = inner.timers.keys().next() == Some(&key);
            // only tickle once until some thread runs next_timeout()
            at_front = is_first && !self.tickled.load(Ordering::Relaxed);
            if at_front {
                self.tickled.store(true, Ordering::Relaxed);
            }
        }
        if at_front {
            if let Some(hook) = self.on_front.get() {
                hook();
            }
        }
    }

    /// Milliseconds until the earliest deadline
    ///
    /// `None` when no timers are registered; 0 when the earliest is
    /// already due. Clears the tickled bit.
    pub fn next_timeout(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        self.tickled.store(false, Ordering::Relaxed);

        let (&(deadline, _), _) = inner.timers.iter().next()?;
        let now = now_ms();
        Some(deadline.saturating_sub(now))
    }

    /// Whether any timer is registered
    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    /// Collect callbacks of every expired timer into `out`
    ///
    /// If the wall clock jumped backward past the rollover window, every
    /// timer counts as expired so none starves. Recurring timers are
    /// reinserted at now + interval; one-shot timers drop their callback.
    /// The caller invokes `out` after this returns, outside the lock.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut inner = self.inner.write().unwrap();

        let rollover = Self::detect_clock_rollover(&mut inner, now);

        loop {
            let Some((&key, _)) = inner.timers.iter().next() else {
                break;
            };
            if !rollover && key.0 > now {
                break;
            }
            let timer = inner.timers.remove(&key).unwrap();

            let mut cb_slot = timer.cb.lock().unwrap();
            if timer.recurring {
                if let Some(cb) = cb_slot.as_ref() {
                    out.push(cb.clone());
                }
                drop(cb_slot);
                timer.deadline
                    .store(now + timer.ms.load(Ordering::Relaxed), Ordering::Relaxed);
                let key = timer.key();
                inner.timers.insert(key, timer);
            } else if let Some(cb) = cb_slot.take() {
                out.push(cb);
            }
        }
    }

    fn detect_clock_rollover(inner: &mut TimerInner, now: u64) -> bool {
        let rollover = now < inner.previous_time.saturating_sub(ROLLOVER_WINDOW_MS);
        inner.previous_time = now;
        rollover
    }

    #[cfg(test)]
    fn set_previous_time(&self, t: u64) {
        self.inner.write().unwrap().previous_time = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn run_all(out: Vec<TimerCallback>) {
        for cb in out {
            cb();
        }
    }

    #[test]
    fn test_expiry_ordering() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (ms, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let order = order.clone();
            mgr.add_timer(ms, Arc::new(move || order.lock().unwrap().push(tag)), false);
        }

        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 3);
        run_all(out);
        // earliest deadline scheduled first
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_before_fire() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(0, counter_cb(&count), false);
        assert!(timer.cancel());
        assert!(!timer.cancel()); // already cancelled

        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert!(out.is_empty());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancel_after_collection_still_runs() {
        // collect-then-drop-lock: a callback already collected keeps
        // running even if cancel lands before invocation
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(0, counter_cb(&count), false);
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 1);

        // cancel no longer finds a callback to null
        assert!(!timer.cancel());
        run_all(out);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(1, counter_cb(&count), true);
        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let mut out = Vec::new();
            mgr.drain_expired(&mut out);
            assert_eq!(out.len(), 1);
            run_all(out);
            assert!(mgr.has_timer());
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_guard() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(());
        mgr.add_condition_timer(0, counter_cb(&count), &cond, false);
        let dead_cond = Arc::new(());
        mgr.add_condition_timer(0, counter_cb(&count), &dead_cond, false);
        drop(dead_cond);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 2);
        run_all(out);
        // only the timer whose guard survived actually ran its callback
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_timeout() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), None);

        mgr.add_timer(10_000, Arc::new(|| {}), false);
        let t = mgr.next_timeout().unwrap();
        assert!(t > 0 && t <= 10_000);

        mgr.add_timer(0, Arc::new(|| {}), false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(mgr.next_timeout(), Some(0));
    }

    #[test]
    fn test_tickled_dedup() {
        let mgr = TimerManager::new();
        let tickles = Arc::new(AtomicUsize::new(0));
        let t = tickles.clone();
        mgr.set_front_hook(move || {
            t.fetch_add(1, Ordering::SeqCst);
        });

        // successively earlier deadlines, no next_timeout in between:
        // only the first front insertion may signal
        mgr.add_timer(30_000, Arc::new(|| {}), false);
        mgr.add_timer(20_000, Arc::new(|| {}), false);
        mgr.add_timer(10_000, Arc::new(|| {}), false);
        assert_eq!(tickles.load(Ordering::SeqCst), 1);

        // draining the state re-arms the signal
        mgr.next_timeout();
        mgr.add_timer(5_000, Arc::new(|| {}), false);
        assert_eq!(tickles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(40, counter_cb(&count), false);
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(timer.refresh());

        // would have been ~10ms from expiry without the refresh
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert!(out.is_empty());
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_reset_interval() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(60_000, counter_cb(&count), false);
        assert!(timer.reset(1, true));

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_clock_rollover_fires_everything() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        mgr.add_timer(60_000, counter_cb(&count), false);
        mgr.add_timer(120_000, counter_cb(&count), false);

        // pretend the last observation was far in the future, i.e. the
        // wall clock has since been set back by more than an hour
        mgr.set_previous_time(now_ms() + 2 * ROLLOVER_WINDOW_MS);

        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        assert_eq!(out.len(), 2);
        run_all(out);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!mgr.has_timer());
    }
}
