//! Pinned worker threads and their thread-local scheduler state.

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::Mutex;
use std::thread::JoinHandle;

use smallvec::SmallVec;

use super::fiber::Fiber;
use super::{FiberIndex, FlagIndex, ThreadIndex, INVALID_FIBER, INVALID_FLAG};

/// Where the fiber we just switched away from has to be filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberLocation {
    None,
    Pool,
    Waiting,
}

/// Per-worker scheduler state. Only ever touched by the thread that owns
/// it; counter completions append to the ready list of *their own* current
/// worker, never across threads.
pub(crate) struct Tls {
    pub thread_index: ThreadIndex,
    pub thread_fiber: Fiber,

    pub current_fiber: FiberIndex,

    pub previous_fiber: FiberIndex,
    pub previous_location: FiberLocation,
    pub previous_stored: FlagIndex,

    pub ready_fibers: SmallVec<[(FiberIndex, FlagIndex); 8]>,
}

pub(crate) struct WorkerThread {
    tls: UnsafeCell<Tls>,
    join: Mutex<Option<JoinHandle<()>>>,
}

// The TLS block is only dereferenced by its owning thread (through the
// thread-local pointer below); the join handle is guarded by its mutex.
unsafe impl Sync for WorkerThread {}

impl WorkerThread {
    pub fn new(index: ThreadIndex) -> Self {
        WorkerThread {
            tls: UnsafeCell::new(Tls {
                thread_index: index,
                thread_fiber: Fiber::thread_fiber(),
                current_fiber: INVALID_FIBER,
                previous_fiber: INVALID_FIBER,
                previous_location: FiberLocation::None,
                previous_stored: INVALID_FLAG,
                ready_fibers: SmallVec::new(),
            }),
            join: Mutex::new(None),
        }
    }

    pub fn tls(&self) -> *mut Tls {
        self.tls.get()
    }

    pub fn set_join_handle(&self, handle: JoinHandle<()>) {
        *self.join.lock().unwrap() = Some(handle);
    }

    /// Joins the OS thread if it is still running. Safe to call more than
    /// once; later calls are no-ops.
    pub fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("a worker thread panicked during execution");
            }
        }
    }
}

thread_local! {
    static CURRENT_TLS: Cell<*mut Tls> = Cell::new(ptr::null_mut());
}

/// The calling thread's scheduler state, or null when the thread is not a
/// worker. The pointer is valid anywhere on the owning thread.
#[inline]
pub(crate) fn current_tls() -> *mut Tls {
    CURRENT_TLS.with(|t| t.get())
}

/// Registers `tls` as the calling thread's scheduler state. Done once
/// during worker startup.
pub(crate) unsafe fn bind_tls(tls: *mut Tls) {
    CURRENT_TLS.with(|t| {
        debug_assert!(t.get().is_null());
        t.set(tls);
    });
}

pub(crate) fn unbind_tls() {
    CURRENT_TLS.with(|t| t.set(ptr::null_mut()));
}

/// Pins the calling thread to the given logical core. Workers map 1:1 onto
/// cores (thread 0 on core 0); on topologies where the core list cannot be
/// queried this degrades to a warning.
pub(crate) fn pin_to_core(index: usize) {
    match core_affinity::get_core_ids() {
        Some(ref ids) if index < ids.len() => {
            core_affinity::set_for_current(ids[index]);
        }
        _ => log::warn!("unable to pin worker thread to logical core {}", index),
    }
}
