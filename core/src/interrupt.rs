//! Cooperative interruption for blocking waits
//!
//! Rust threads carry no interrupt flag, so callers that want to abort a
//! bounded wait hand an [`InterruptToken`] to the primitive. Interrupting the
//! token wakes the waiter promptly; the flag stays set afterwards so the
//! caller can still observe that it was interrupted.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

type WakeHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    interrupted: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    hooks: Mutex<Vec<(u64, WakeHook)>>,
    next_hook: AtomicU64,
}

/// Shared, clonable interrupt flag
#[derive(Clone)]
pub struct InterruptToken {
    inner: Arc<Inner>,
}

/// Returned by [`InterruptToken::sleep`] when the sleep was cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl InterruptToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                interrupted: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                hooks: Mutex::new(Vec::new()),
                next_hook: AtomicU64::new(0),
            }),
        }
    }

    /// Set the flag and wake anything waiting on this token
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
        let hooks: Vec<WakeHook> = self
            .inner
            .hooks
            .lock()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set
    pub fn clear(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Block for `duration` unless interrupted first
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_interrupted() {
                return Err(Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.inner.cond.wait_for(&mut guard, deadline - now);
                }
                None => self.inner.cond.wait(&mut guard),
            }
        }
    }

    /// Run `hook` whenever the token is interrupted, until the returned
    /// registration is dropped. Used by primitives that wait on their own
    /// condition variable.
    pub(crate) fn register(&self, hook: WakeHook) -> HookRegistration {
        let id = self.inner.next_hook.fetch_add(1, Ordering::Relaxed);
        self.inner.hooks.lock().push((id, hook));
        HookRegistration {
            token: self.clone(),
            id,
        }
    }
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptToken")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Removes a wake hook on drop
pub(crate) struct HookRegistration {
    token: InterruptToken,
    id: u64,
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        self.token
            .inner
            .hooks
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_sleep_completes_without_interrupt() {
        let token = InterruptToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(20)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_interrupt_wakes_sleeper_and_keeps_flag() {
        let token = InterruptToken::new();
        let sleeper = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let result = sleeper.sleep(Duration::from_secs(5));
            (result, start.elapsed(), sleeper.is_interrupted())
        });

        thread::sleep(Duration::from_millis(30));
        token.interrupt();

        let (result, elapsed, flag) = handle.join().unwrap();
        assert_eq!(result, Err(Interrupted));
        assert!(elapsed < Duration::from_secs(5));
        assert!(flag);
    }

    #[test]
    fn test_already_interrupted_returns_immediately() {
        let token = InterruptToken::new();
        token.interrupt();
        assert_eq!(token.sleep(Duration::from_secs(5)), Err(Interrupted));
        assert!(token.clear());
        assert!(!token.is_interrupted());
    }

    #[test]
    fn test_hooks_fire_until_unregistered() {
        let token = InterruptToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let registration = token.register(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        token.interrupt();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(registration);
        token.interrupt();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
