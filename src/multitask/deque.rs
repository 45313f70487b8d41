//! Fixed-capacity Chase–Lev work-stealing deque.
//!
//! The owning worker pushes and pops at the bottom (LIFO, cache-warm);
//! thieves take from the top (FIFO, oldest first). Descriptors are plain
//! `Copy` data: a thief that loses the top CAS simply discards its copy,
//! so no slot is ever handed out twice.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, Ordering};

use crossbeam_utils::CachePadded;

pub struct WorkStealDeque<T: Copy> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: isize,
    bottom: CachePadded<AtomicIsize>,
    top: CachePadded<AtomicIsize>,
}

unsafe impl<T: Copy + Send> Send for WorkStealDeque<T> {}
unsafe impl<T: Copy + Send> Sync for WorkStealDeque<T> {}

impl<T: Copy> WorkStealDeque<T> {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 || !capacity.is_power_of_two() {
            critical!("deque capacity must be a non-zero power of two, got {}", capacity);
        }

        WorkStealDeque {
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            mask: capacity as isize - 1,
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Pushes at the bottom, returning `false` when the deque is full.
    ///
    /// # Safety
    ///
    /// Owner only: must be called from the thread this deque belongs to.
    pub unsafe fn push(&self, value: T) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);

        if bottom - top > self.mask {
            return false;
        }

        *self.buffer[(bottom & self.mask) as usize].get() = MaybeUninit::new(value);

        // Publish the slot before publishing the new bottom.
        self.bottom.store(bottom + 1, Ordering::Release);
        true
    }

    /// Pops at the bottom (the most recently pushed entry).
    ///
    /// # Safety
    ///
    /// Owner only: must be called from the thread this deque belongs to.
    pub unsafe fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::SeqCst);
        let top = self.top.load(Ordering::SeqCst);

        if top <= bottom {
            let value = (*self.buffer[(bottom & self.mask) as usize].get())
                .as_ptr()
                .read();

            if top == bottom {
                // Last entry: race the thieves for it.
                let won = self
                    .top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                self.bottom.store(bottom + 1, Ordering::Relaxed);

                if won {
                    Some(value)
                } else {
                    None
                }
            } else {
                Some(value)
            }
        } else {
            // Already empty; undo the speculative decrement.
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            None
        }
    }

    /// Steals from the top (the oldest entry). Any thread may call this.
    pub fn steal(&self) -> Option<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top < bottom {
            let value = unsafe {
                (*self.buffer[(top & self.mask) as usize].get())
                    .as_ptr()
                    .read()
            };

            if self
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(value);
            }

            // Lost to the owner or another thief; drop our copy.
            return None;
        }

        None
    }

    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
