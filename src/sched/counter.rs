//! Atomic completion counters with a small table of parked fibers.
//!
//! Scheduling a job against a counter takes a reference (increment); the
//! job releases it when it has run (decrement). A fiber that needs the
//! count to hit a target value parks itself in one of the waiter slots and
//! is handed back to a worker by whichever decrement establishes the
//! target. Every slot transition goes through a CAS, so each parked fiber
//! is woken exactly once.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::manager::Manager;
use super::thread;
use super::{Count, FiberIndex, FlagIndex};

/// Waiter capacity of a regular [`Counter`]. Exceeding it means the job
/// graph has a wider fan-in than the system is built for, and is fatal.
pub(crate) const MAX_WAITING: usize = 5;

struct WaiterSlot {
    fiber: Cell<FiberIndex>,
    flag: Cell<FlagIndex>,
    target: Cell<Count>,
    in_use: AtomicBool,
}

impl WaiterSlot {
    fn new() -> Self {
        WaiterSlot {
            fiber: Cell::new(0),
            flag: Cell::new(0),
            target: Cell::new(0),
            // A slot that was never claimed must not look wakeable.
            in_use: AtomicBool::new(true),
        }
    }
}

// The plain fields are only written between winning the `free` CAS and the
// release of `in_use`, and only read after acquiring `in_use == false`.
unsafe impl Sync for WaiterSlot {}

/// The shared counter core. Public API goes through [`Counter`] and
/// [`TinyCounter`], which pin down the slot budget and the manager borrow.
pub struct RawCounter {
    manager: *const Manager,
    value: AtomicU32,
    used_slots: usize,
    free: [AtomicBool; MAX_WAITING],
    slots: [WaiterSlot; MAX_WAITING],
}

unsafe impl Send for RawCounter {}
unsafe impl Sync for RawCounter {}

impl RawCounter {
    pub(crate) fn new(manager: *const Manager, used_slots: usize) -> Self {
        debug_assert!(used_slots >= 1 && used_slots <= MAX_WAITING);

        RawCounter {
            manager,
            value: AtomicU32::new(0),
            used_slots,
            free: [
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
            ],
            slots: [
                WaiterSlot::new(),
                WaiterSlot::new(),
                WaiterSlot::new(),
                WaiterSlot::new(),
                WaiterSlot::new(),
            ],
        }
    }

    /// Current outstanding reference count.
    pub fn value(&self) -> Count {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn manager(&self) -> *const Manager {
        self.manager
    }

    pub(crate) fn increment(&self, by: Count) -> Count {
        let prev = self.value.fetch_add(by, Ordering::SeqCst);
        self.check_waiters(prev.wrapping_add(by));
        prev
    }

    pub(crate) fn decrement(&self, by: Count) -> Count {
        let prev = self.value.fetch_sub(by, Ordering::SeqCst);
        self.check_waiters(prev.wrapping_sub(by));
        prev
    }

    /// Tries to install a waiter for `target`. Returns `true` when the wait
    /// is already satisfied and the caller must *not* park; `false` means
    /// the waiter is registered and the caller parks, relying on `flag` for
    /// the handshake with whichever worker resumes the fiber.
    pub(crate) fn add_waiter(&self, fiber: FiberIndex, target: Count, flag: FlagIndex) -> bool {
        for i in 0..self.used_slots {
            if self.free[i]
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let slot = &self.slots[i];
            slot.fiber.set(fiber);
            slot.flag.set(flag);
            slot.target.set(target);
            slot.in_use.store(false, Ordering::SeqCst);

            let value = self.value.load(Ordering::Relaxed);

            if slot.in_use.load(Ordering::Acquire) {
                // A completion raced in and already took the slot; the wake
                // is in flight through its ready list, so the caller still
                // parks and gets resumed through the flag.
                return false;
            }

            if slot.target.get() == value {
                // Satisfied right now; claim the wake for ourselves.
                if slot
                    .in_use
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    return false;
                }

                self.free[i].store(true, Ordering::Release);
                return true;
            }

            return false;
        }

        critical!("counter waiter table is full (more than {} concurrent waits)", self.used_slots);
    }

    /// Completion-side scan: wake every waiter whose target matches the new
    /// value by handing its fiber to the calling worker's ready list.
    fn check_waiters(&self, value: Count) {
        for i in 0..self.used_slots {
            if self.free[i].load(Ordering::Acquire) {
                continue;
            }

            let slot = &self.slots[i];
            if slot.in_use.load(Ordering::Acquire) {
                continue;
            }

            if slot.target.get() == value {
                if slot
                    .in_use
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }

                let tls = thread::current_tls();
                if tls.is_null() {
                    critical!("counter completion outside of a scheduler thread");
                }

                unsafe { (*tls).ready_fibers.push((slot.fiber.get(), slot.flag.get())) };
                self.free[i].store(true, Ordering::Release);
            }
        }
    }
}

/// A counter with room for [`MAX_WAITING`] concurrent waiters.
pub struct Counter<'m> {
    raw: RawCounter,
    _manager: PhantomData<&'m Manager>,
}

impl<'m> Counter<'m> {
    pub fn new(manager: &'m Manager) -> Self {
        Counter {
            raw: RawCounter::new(manager, MAX_WAITING),
            _manager: PhantomData,
        }
    }
}

impl<'m> Deref for Counter<'m> {
    type Target = RawCounter;

    fn deref(&self) -> &RawCounter {
        &self.raw
    }
}

/// A single-slot counter, enough for the one-job one-waiter pattern that
/// `wait_for_single` uses. Lives happily on a fiber stack.
pub struct TinyCounter<'m> {
    raw: RawCounter,
    _manager: PhantomData<&'m Manager>,
}

impl<'m> TinyCounter<'m> {
    pub fn new(manager: &'m Manager) -> Self {
        TinyCounter {
            raw: RawCounter::new(manager, 1),
            _manager: PhantomData,
        }
    }
}

impl<'m> Deref for TinyCounter<'m> {
    type Target = RawCounter;

    fn deref(&self) -> &RawCounter {
        &self.raw
    }
}
