// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred reclamation for data structures that are read without locks.
//!
//! Readers enter a read-side critical section through [`Reclaim::read_lock`] and may dereference
//! shared pointers for as long as the returned guard is alive. Writers unpublish data first and then
//! hand it to [`Reclaim::retire`], which only drops it once every reader that could still observe it
//! has left its critical section.
//!
//! [`GracePeriod`] is the default implementation: a pair of reader counters that are flipped on every
//! grace period, in the spirit of sleepable RCU.

use core::fmt;

use crate::loom::hint;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// A reclamation scheme.
///
/// # Safety
///
/// [`synchronize`][Reclaim::synchronize] must not return before every guard returned by
/// [`read_lock`][Reclaim::read_lock] *before* the call to `synchronize` started has been dropped.
/// Data that was unpublished before calling `synchronize` is unreachable for guards created later
/// only if the implementation orders guard creation after the unpublishing store, which
/// implementations must do by using sequentially consistent operations (or stronger
/// synchronization) on guard entry.
pub unsafe trait Reclaim: Send + Sync {
    type Guard<'a>
    where
        Self: 'a;

    /// Enters a read-side critical section.
    fn read_lock(&self) -> Self::Guard<'_>;

    /// Waits until all read-side critical sections that began before this call have ended.
    ///
    /// Calling this while holding a guard of the same instance deadlocks.
    fn synchronize(&self);

    /// Drops `garbage` once no reader can reference it anymore.
    fn retire<T: Send>(&self, garbage: T) {
        self.synchronize();
        drop(garbage);
    }
}

/// Two-counter grace period tracking.
///
/// Readers increment the counter selected by the current epoch. A grace period flips the epoch and
/// then waits for the counter of the previous epoch to drain. Grace periods are serialized through
/// the `R` mutex, readers never block.
pub struct GracePeriod<R: lock_api::RawMutex> {
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    writer: lock_api::Mutex<R, ()>,
}

impl<R: lock_api::RawMutex> fmt::Debug for GracePeriod<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracePeriod")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field(
                "readers",
                &[
                    self.readers[0].load(Ordering::Relaxed),
                    self.readers[1].load(Ordering::Relaxed),
                ],
            )
            .finish_non_exhaustive()
    }
}

impl<R: lock_api::RawMutex> Default for GracePeriod<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: lock_api::RawMutex> GracePeriod<R> {
    pub fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: lock_api::Mutex::new(()),
        }
    }

    /// Returns the number of grace periods that have elapsed.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }
}

// Safety: every guard is counted in `readers[idx]` where `idx` matched the epoch *after* the
// counter was incremented. Any `synchronize` that flips away from `idx` afterwards waits for that
// counter, and any `synchronize` that flipped before the re-check is ordered before the guard's
// subsequent loads through the SeqCst operations.
unsafe impl<R: lock_api::RawMutex + Send + Sync> Reclaim for GracePeriod<R> {
    type Guard<'a>
        = ReadGuard<'a, R>
    where
        Self: 'a;

    fn read_lock(&self) -> Self::Guard<'_> {
        loop {
            let idx = self.epoch.load(Ordering::SeqCst) & 1;
            self.readers[idx].fetch_add(1, Ordering::SeqCst);

            // a grace period started between reading the epoch and announcing ourselves. it might
            // not have seen our increment, so back out and retry with the new epoch
            if self.epoch.load(Ordering::SeqCst) & 1 == idx {
                return ReadGuard { gp: self, idx };
            }

            self.readers[idx].fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn synchronize(&self) {
        let _writer = self.writer.lock();

        let prev = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;
        while self.readers[prev].load(Ordering::SeqCst) != 0 {
            hint::spin_loop();
        }

        log::trace!("grace period {} elapsed", self.epoch.load(Ordering::Relaxed));
    }
}

/// A read-side critical section of a [`GracePeriod`].
pub struct ReadGuard<'a, R: lock_api::RawMutex> {
    gp: &'a GracePeriod<R>,
    idx: usize,
}

impl<R: lock_api::RawMutex> fmt::Debug for ReadGuard<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("idx", &self.idx)
            .finish_non_exhaustive()
    }
}

impl<R: lock_api::RawMutex> Drop for ReadGuard<'_, R> {
    fn drop(&mut self) {
        self.gp.readers[self.idx].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicBool;
    use crate::loom::{self, thread};

    type TestGracePeriod = GracePeriod<parking_lot::RawMutex>;

    struct Shared {
        gp: TestGracePeriod,
        current: AtomicUsize,
        reclaimed: [AtomicBool; 2],
    }

    impl Shared {
        fn new() -> Self {
            Self {
                gp: GracePeriod::new(),
                current: AtomicUsize::new(0),
                reclaimed: [AtomicBool::new(false), AtomicBool::new(false)],
            }
        }
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn synchronize_without_readers() {
        let gp = TestGracePeriod::new();

        gp.synchronize();
        gp.synchronize();

        assert_eq!(gp.epoch(), 2);
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn nested_guards() {
        let gp = TestGracePeriod::new();

        let outer = gp.read_lock();
        let inner = gp.read_lock();
        drop(outer);
        drop(inner);

        gp.synchronize();
        assert_eq!(gp.readers[0].load(Ordering::SeqCst), 0);
        assert_eq!(gp.readers[1].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reader_never_observes_reclaimed() {
        loom::model(|| {
            let shared = Arc::new(Shared::new());

            let reader = {
                let shared = shared.clone();
                thread::spawn(move || {
                    let _guard = shared.gp.read_lock();
                    let idx = shared.current.load(Ordering::SeqCst);

                    assert!(!shared.reclaimed[idx].load(Ordering::SeqCst));
                    thread::yield_now();
                    assert!(!shared.reclaimed[idx].load(Ordering::SeqCst));
                })
            };

            shared.current.store(1, Ordering::SeqCst);
            shared.gp.synchronize();
            shared.reclaimed[0].store(true, Ordering::SeqCst);

            reader.join().unwrap();
        });
    }

    #[test]
    fn retire_waits_for_reader() {
        loom::model(|| {
            let shared = Arc::new(Shared::new());

            let reader = {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..2 {
                        let _guard = shared.gp.read_lock();
                        let idx = shared.current.load(Ordering::SeqCst);
                        assert!(!shared.reclaimed[idx].load(Ordering::SeqCst));
                    }
                })
            };

            // two back-to-back grace periods flip the epoch twice
            shared.current.store(1, Ordering::SeqCst);
            shared.gp.synchronize();
            shared.reclaimed[0].store(true, Ordering::SeqCst);

            shared.reclaimed[0].store(false, Ordering::SeqCst);
            shared.current.store(0, Ordering::SeqCst);
            shared.gp.synchronize();
            shared.reclaimed[1].store(true, Ordering::SeqCst);

            reader.join().unwrap();
        });
    }
}
