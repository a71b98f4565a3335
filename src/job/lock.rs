// Job state lock
//
// The re-entrant lock a job holds while it mutates its step bookkeeping.
// The guard doubles as the ownership ticket handed to the cancel callback:
// only the frame holding a `StateGuard` may release it temporarily.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;

/// Re-entrant lock guarding a job's pipeline state.
///
/// The same thread may acquire the lock several times. Another party can only
/// release it through [`StateGuard::unlocked`], which requires the guard itself,
/// so a release always happens in the call frame that owns the lock.
#[derive(Default)]
pub struct StateLock {
    inner: ReentrantMutex<()>,
}

impl StateLock {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(()),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.inner.lock(),
        }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<StateGuard<'_>> {
        self.inner.try_lock().map(|inner| StateGuard { inner })
    }

    /// Whether any thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Whether the calling thread holds the lock.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.inner.is_owned_by_current_thread()
    }
}

impl fmt::Debug for StateLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Proof that the job's state lock is held by the current call frame.
///
/// Must be the outermost guard of the thread when passed to the cancel
/// callback: [`unlocked`](Self::unlocked) releases exactly one level.
pub struct StateGuard<'a> {
    inner: ReentrantMutexGuard<'a, ()>,
}

impl StateGuard<'_> {
    /// Release the lock while `f` runs, then re-acquire it before returning.
    ///
    /// The guard is in the same held state afterwards as it was before.
    pub fn unlocked<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        ReentrantMutexGuard::unlocked(&mut self.inner, f)
    }
}

impl fmt::Debug for StateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateGuard")
    }
}
